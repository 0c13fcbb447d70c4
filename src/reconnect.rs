use crate::ports::PortRegistry;
use crate::scheduler::LinkHandle;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

/// A single digital output wired to the payload controller's reset.
pub trait ResetLine: Send {
    fn set_level(&mut self, level: Level) -> io::Result<()>;
}

/// For hosts with no controllable reset line. Pulses are only traced.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoResetLine;

impl ResetLine for NoResetLine {
    fn set_level(&mut self, level: Level) -> io::Result<()> {
        info!("Reset line not wired, would drive {:?}", level);
        Ok(())
    }
}

/// Linux sysfs GPIO output, numbered by BCM pin.
#[derive(Debug)]
pub struct SysfsResetLine {
    pin: u32,
    value_path: PathBuf,
}

impl SysfsResetLine {
    const GPIO_ROOT: &'static str = "/sys/class/gpio";

    /// Export `pin` if needed and configure it as an output driven low.
    pub fn open(pin: u32) -> io::Result<Self> {
        let pin_dir = PathBuf::from(Self::GPIO_ROOT).join(format!("gpio{pin}"));
        if !pin_dir.exists() {
            fs::write(PathBuf::from(Self::GPIO_ROOT).join("export"), pin.to_string())?;
        }
        fs::write(pin_dir.join("direction"), "low")?;

        Ok(Self {
            pin,
            value_path: pin_dir.join("value"),
        })
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }
}

impl ResetLine for SysfsResetLine {
    fn set_level(&mut self, level: Level) -> io::Result<()> {
        let value = match level {
            Level::Low => "0",
            Level::High => "1",
        };
        fs::write(&self.value_path, value)
    }
}

/// Runs the same fixed recovery cycle for every link fault. There is no
/// escalation and no give-up state.
pub struct ReconnectionSupervisor {
    reset_line: Box<dyn ResetLine>,
    backoff: Duration,
    cycles: u64,
}

impl ReconnectionSupervisor {
    pub fn new(reset_line: Box<dyn ResetLine>, backoff: Duration) -> Self {
        Self {
            reset_line,
            backoff,
            cycles: 0,
        }
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Completed recovery cycles since start.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Run one recovery cycle. Blocks the calling (scheduler) thread for
    /// the backoff plus half of it again for the reset pulse.
    pub fn recover(&mut self, registry: &mut PortRegistry, link: &LinkHandle) {
        warn!("Serial link fault, resetting connection in {:?}", self.backoff);
        thread::sleep(self.backoff);

        self.pulse_reset_line();

        // In-flight and queued requests are lost here.
        let dropped = link.lock().reset_for_reconnect();
        if dropped > 0 {
            warn!("Dropped {} queued serial request(s) during reconnection", dropped);
        }

        for (port, handle) in registry.links_mut() {
            if let Err(e) = handle.clear_buffers() {
                warn!("Could not flush buffers on {}: {}", port, e);
            }
        }

        self.cycles += 1;
        info!("Reconnection cycle {} complete", self.cycles);
    }

    fn pulse_reset_line(&mut self) {
        if let Err(e) = self.reset_line.set_level(Level::Low) {
            warn!("Could not drive reset line low: {}", e);
        }
        thread::sleep(self.backoff / 2);
        if let Err(e) = self.reset_line.set_level(Level::High) {
            warn!("Could not drive reset line high: {}", e);
        }
    }
}

impl std::fmt::Debug for ReconnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectionSupervisor")
            .field("backoff", &self.backoff)
            .field("cycles", &self.cycles)
            .finish_non_exhaustive()
    }
}
