use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::{debug, info, warn};

pub type PortId = String;

/// Always reported present on the flight computer (the Pi's PL011 UART) but
/// never connected to anything.
pub const FALSE_POSITIVE_PORT: &str = "/dev/ttyAMA0";

const LINE_TERMINATOR: u8 = b'\n';
const WINDOWS_COM_PORTS: u16 = 256;

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("port {path} unavailable: {reason}")]
    PortUnavailable { path: String, reason: String },
    #[error("unsupported platform '{0}'")]
    UnsupportedPlatform(String),
    #[error("could not enumerate serial devices: {0}")]
    Enumeration(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    Windows,
    Linux,
    MacOs,
}

impl Platform {
    pub fn detect() -> Result<Self, PortError> {
        Self::from_os(std::env::consts::OS)
    }

    pub fn from_os(os: &str) -> Result<Self, PortError> {
        match os {
            "windows" => Ok(Platform::Windows),
            "linux" | "android" | "cygwin" => Ok(Platform::Linux),
            "macos" => Ok(Platform::MacOs),
            other => Err(PortError::UnsupportedPlatform(other.to_string())),
        }
    }

    /// Candidate device paths for this platform.
    pub fn candidates(self) -> Result<Vec<String>, PortError> {
        match self {
            Platform::Windows => Ok((1..=WINDOWS_COM_PORTS).map(|i| format!("COM{i}")).collect()),
            // /dev/tty[A-Za-z]*, which leaves out the controlling terminal /dev/tty
            Platform::Linux => dev_entries(|name| {
                name.strip_prefix("tty")
                    .and_then(|rest| rest.chars().next())
                    .is_some_and(|c| c.is_ascii_alphabetic())
            }),
            Platform::MacOs => dev_entries(|name| name.starts_with("tty.")),
        }
    }
}

fn dev_entries(keep: impl Fn(&str) -> bool) -> Result<Vec<String>, PortError> {
    let mut paths: Vec<String> = fs::read_dir("/dev")?
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| keep(name))
        .map(|name| format!("/dev/{name}"))
        .collect();
    paths.sort();
    Ok(paths)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSettings {
    pub baud_rate: u32,
    /// Bounds both reads and writes.
    pub timeout: Duration,
}

impl LineSettings {
    pub fn new(baud_rate: u32, timeout: Duration) -> Self {
        Self { baud_rate, timeout }
    }
}

/// An open byte-stream connection.
pub trait SerialLink: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read up to and including the line terminator. A timeout after some
    /// bytes arrived returns what was read; a timeout before any byte is an
    /// `ErrorKind::TimedOut` error.
    fn read_line(&mut self) -> io::Result<Vec<u8>>;

    /// Discard pending input and output.
    fn clear_buffers(&mut self) -> io::Result<()>;
}

/// How the registry reaches the hardware.
pub trait PortOpener: Send {
    fn candidates(&self) -> Result<Vec<String>, PortError>;

    /// Open and immediately close `path` to check it is usable.
    fn probe(&self, path: &str) -> Result<(), PortError>;

    fn open(&self, path: &str, settings: LineSettings) -> Result<Box<dyn SerialLink>, PortError>;
}

/// Real serial ports through the `serialport` crate.
#[derive(Debug, Clone, Copy)]
pub struct SystemPorts {
    platform: Platform,
}

impl SystemPorts {
    pub fn new() -> Result<Self, PortError> {
        Ok(Self {
            platform: Platform::detect()?,
        })
    }
}

impl PortOpener for SystemPorts {
    fn candidates(&self) -> Result<Vec<String>, PortError> {
        self.platform.candidates()
    }

    fn probe(&self, path: &str) -> Result<(), PortError> {
        serialport::new(path, 9600)
            .open()
            .map(drop)
            .map_err(|e| unavailable(path, &e))
    }

    fn open(&self, path: &str, settings: LineSettings) -> Result<Box<dyn SerialLink>, PortError> {
        let port = serialport::new(path, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(settings.timeout)
            .open()
            .map_err(|e| unavailable(path, &e))?;

        info!("Opened serial port: {} at {} baud", path, settings.baud_rate);
        Ok(Box::new(SystemLink { port }))
    }
}

fn unavailable(path: &str, error: &serialport::Error) -> PortError {
    PortError::PortUnavailable {
        path: path.to_string(),
        reason: error.to_string(),
    }
}

struct SystemLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink for SystemLink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(0) => return Ok(line),
                Ok(_) => {
                    line.push(byte[0]);
                    if byte[0] == LINE_TERMINATOR {
                        return Ok(line);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut && !line.is_empty() => return Ok(line),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::All).map_err(io::Error::from)
    }
}

/// Owns every open port.
pub struct PortRegistry {
    opener: Box<dyn PortOpener>,
    excluded: Vec<String>,
    ports: BTreeMap<PortId, Box<dyn SerialLink>>,
}

impl PortRegistry {
    pub fn new(opener: Box<dyn PortOpener>) -> Self {
        Self::with_exclusions(opener, vec![FALSE_POSITIVE_PORT.to_string()])
    }

    pub fn with_exclusions(opener: Box<dyn PortOpener>, excluded: Vec<String>) -> Self {
        Self {
            opener,
            excluded,
            ports: BTreeMap::new(),
        }
    }

    /// Close every handle, then find and open all usable ports. Returns the
    /// identifiers of the ports now open, sorted.
    pub fn discover(&mut self, baud_rate: u32, timeout: Duration) -> Result<Vec<PortId>, PortError> {
        self.close_all();

        let settings = LineSettings::new(baud_rate, timeout);
        let available: Vec<String> = self
            .opener
            .candidates()?
            .into_iter()
            .filter(|path| match self.opener.probe(path) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Skipping {}: {}", path, e);
                    false
                }
            })
            .collect();

        for path in available {
            if self.excluded.contains(&path) {
                debug!("Excluding always-present port {}", path);
                continue;
            }
            match self.opener.open(&path, settings) {
                Ok(link) => {
                    self.ports.insert(path, link);
                }
                Err(e) => warn!("Port {} passed probing but failed to open: {}", path, e),
            }
        }

        info!("Discovered {} serial port(s): {:?}", self.ports.len(), self.port_ids());
        Ok(self.port_ids())
    }

    pub fn close_all(&mut self) {
        self.ports.clear();
    }

    pub fn port_ids(&self) -> Vec<PortId> {
        self.ports.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn get_mut(&mut self, port: &str) -> Option<&mut (dyn SerialLink + 'static)> {
        self.ports.get_mut(port).map(|link| link.as_mut())
    }

    pub fn links_mut(&mut self) -> impl Iterator<Item = (&PortId, &mut Box<dyn SerialLink>)> {
        self.ports.iter_mut()
    }
}

impl std::fmt::Debug for PortRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortRegistry")
            .field("excluded", &self.excluded)
            .field("ports", &self.port_ids())
            .finish_non_exhaustive()
    }
}
