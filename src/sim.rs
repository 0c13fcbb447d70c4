use crate::codec::Schema;
use crate::ports::{LineSettings, PortError, PortOpener, SerialLink};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    /// The next read times out with nothing received.
    ReadTimeout,
    /// The next write fails.
    WriteFailure,
    /// The next read returns bytes that are not UTF-8.
    Garbage,
}

#[derive(Default)]
struct DeviceState {
    available: bool,
    responses: VecDeque<Vec<u8>>,
    responder: Option<Responder>,
    faults: VecDeque<InjectedFault>,
    writes: Vec<Vec<u8>>,
    opens: u32,
    buffer_clears: u32,
}

/// Cloning shares the device: the test keeps one clone, the registry the
/// other.
#[derive(Clone)]
pub struct SimulatedDevice {
    path: String,
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedDevice {
    pub fn new(path: impl Into<String>) -> Self {
        let state = DeviceState {
            available: true,
            ..DeviceState::default()
        };
        Self {
            path: path.into(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// A bench stand-in for the payload microcontroller: identifies itself,
    /// reports a header and a measurement line sized for `schema`,
    /// acknowledges downlink frames, and answers every twentieth uplink poll
    /// with a `PING` command.
    pub fn payload_controller(path: impl Into<String>, schema: &Schema) -> Self {
        let device = Self::new(path);
        let header: Vec<String> = schema.fields().iter().skip(1).map(|f| f.name.clone()).collect();
        let header = header.join(",");
        let value_count = schema.len().saturating_sub(1);
        let mut sample = 0u32;
        let mut polls = 0u32;

        device.set_responder(move |written| {
            let reply = match written {
                b"ID" => "PiTS-bench-controller".to_string(),
                b"HEADER" => header.clone(),
                b"DATA" => {
                    sample = sample.wrapping_add(1);
                    (0..value_count)
                        .map(|i| format!("{:.2}", f64::from((sample + i as u32) % 1000) / 10.0))
                        .collect::<Vec<_>>()
                        .join(",")
                }
                b"RX" => {
                    polls = polls.wrapping_add(1);
                    if polls % 20 != 0 {
                        return None;
                    }
                    "PING".to_string()
                }
                frame if frame.starts_with(b"TX") => format!("TX {} bytes", frame.len() - 2),
                _ => return None,
            };
            Some(format!("{reply}\r\n").into_bytes())
        });
        device
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn push_response(&self, line: impl Into<Vec<u8>>) {
        self.lock().responses.push_back(line.into());
    }

    pub fn set_responder(&self, responder: impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static) {
        self.lock().responder = Some(Box::new(responder));
    }

    pub fn inject_fault(&self, fault: InjectedFault) {
        self.lock().faults.push_back(fault);
    }

    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    pub fn pending_responses(&self) -> usize {
        self.lock().responses.len()
    }

    pub fn open_count(&self) -> u32 {
        self.lock().opens
    }

    pub fn buffer_clears(&self) -> u32 {
        self.lock().buffer_clears
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_fault(state: &mut DeviceState, wanted: &[InjectedFault]) -> Option<InjectedFault> {
        let position = state.faults.iter().position(|fault| wanted.contains(fault))?;
        state.faults.remove(position)
    }
}

impl std::fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedDevice").field("path", &self.path).finish_non_exhaustive()
    }
}

impl SerialLink for SimulatedDevice {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.lock();
        if Self::take_fault(&mut state, &[InjectedFault::WriteFailure]).is_some() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected write failure"));
        }
        state.writes.push(bytes.to_vec());
        if let Some(reply) = state.responder.as_mut().and_then(|responder| responder(bytes)) {
            state.responses.push_back(reply);
        }
        Ok(())
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        let mut state = self.lock();
        match Self::take_fault(&mut state, &[InjectedFault::ReadTimeout, InjectedFault::Garbage]) {
            Some(InjectedFault::ReadTimeout) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "injected read timeout"));
            }
            Some(InjectedFault::Garbage) => return Ok(vec![0xFF, 0xFE, b'\n']),
            _ => {}
        }
        state
            .responses
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "no response"))
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        let mut state = self.lock();
        state.responses.clear();
        state.buffer_clears += 1;
        Ok(())
    }
}

/// A [`PortOpener`] over simulated devices, keyed by path.
#[derive(Debug, Clone, Default)]
pub struct SimulatedPorts {
    devices: BTreeMap<String, SimulatedDevice>,
}

impl SimulatedPorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device: SimulatedDevice) -> Self {
        self.add(device);
        self
    }

    pub fn add(&mut self, device: SimulatedDevice) {
        self.devices.insert(device.path().to_string(), device);
    }

    pub fn device(&self, path: &str) -> Option<&SimulatedDevice> {
        self.devices.get(path)
    }

    fn available(&self, path: &str) -> Result<&SimulatedDevice, PortError> {
        match self.devices.get(path) {
            Some(device) if device.lock().available => Ok(device),
            _ => Err(PortError::PortUnavailable {
                path: path.to_string(),
                reason: "no such simulated device".to_string(),
            }),
        }
    }
}

impl PortOpener for SimulatedPorts {
    fn candidates(&self) -> Result<Vec<String>, PortError> {
        Ok(self.devices.keys().cloned().collect())
    }

    fn probe(&self, path: &str) -> Result<(), PortError> {
        self.available(path).map(drop)
    }

    fn open(&self, path: &str, _settings: LineSettings) -> Result<Box<dyn SerialLink>, PortError> {
        let device = self.available(path)?;
        device.lock().opens += 1;
        Ok(Box::new(device.clone()))
    }
}
