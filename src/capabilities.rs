use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogChannel {
    Id,
    Header,
    Data,
    Tx,
    Rx,
    Info,
    Error,
}

impl LogChannel {
    pub fn tag(self) -> &'static str {
        match self {
            LogChannel::Id => "ID",
            LogChannel::Header => "HEADER",
            LogChannel::Data => "DATA",
            LogChannel::Tx => "TX",
            LogChannel::Rx => "RX",
            LogChannel::Info => "INFO",
            LogChannel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Record keeping for the flight. Shared by both workers, so implementations
/// synchronise internally.
pub trait FlightLog: Send + Sync {
    /// Most recent complete measurement record, without its line terminator.
    fn latest_line(&self) -> io::Result<Option<String>>;

    fn append(&self, channel: LogChannel, text: &str);
}

/// An auxiliary sensor read on the flight computer itself and merged into
/// the measurement stream.
pub trait Photosensor: Send {
    /// Column names this sensor contributes to the data header,
    /// comma-separated.
    fn header_addition(&self) -> String;

    /// One `(name, value)` sample, or `None` when the sensor has nothing.
    fn sample(&mut self) -> Option<(String, f64)>;
}
