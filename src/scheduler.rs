use crate::capabilities::{FlightLog, LogChannel, Photosensor};
use crate::ports::{LineSettings, PortError, PortId, PortRegistry};
use crate::reconnect::ReconnectionSupervisor;
use crate::uplink::UplinkCommandStore;
use heapless::Deque;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const MAX_QUEUED_REQUESTS: usize = 64;

/// Leads every downlink frame on the wire.
pub const DOWNLINK_TAG: &[u8; 2] = b"TX";

/// Prefixed to data headers to mark the columns added on the flight computer.
pub const HEADER_TAG: &str = "PiTS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadKind {
    Id,
    Header,
    Data,
    Tx,
    Rx,
}

impl PayloadKind {
    pub fn tag(self) -> &'static str {
        match self {
            PayloadKind::Id => "ID",
            PayloadKind::Header => "HEADER",
            PayloadKind::Data => "DATA",
            PayloadKind::Tx => "TX",
            PayloadKind::Rx => "RX",
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// What a write puts on the wire, decided when it is enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePayload {
    Text(String),
    Bytes(Vec<u8>),
}

impl WritePayload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            WritePayload::Text(text) => text.as_bytes(),
            WritePayload::Bytes(bytes) => bytes,
        }
    }

    /// Loggable form; line terminators are stripped from text.
    pub fn describe(&self) -> String {
        match self {
            WritePayload::Text(text) => text.trim().replace(['\r', '\n'], ""),
            WritePayload::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub port: PortId,
    pub payload: WritePayload,
}

impl WriteRequest {
    pub fn text(port: impl Into<PortId>, text: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            payload: WritePayload::Text(text.into()),
        }
    }

    pub fn bytes(port: impl Into<PortId>, bytes: Vec<u8>) -> Self {
        Self {
            port: port.into(),
            payload: WritePayload::Bytes(bytes),
        }
    }

    /// The bare tag, asking the far end for that kind of reply.
    pub fn probe(port: impl Into<PortId>, kind: PayloadKind) -> Self {
        Self::text(port, kind.tag())
    }

    /// `TX` immediately followed by the packed frame. No length prefix and
    /// no delimiter: the frame length is fixed by the schema.
    pub fn downlink(port: impl Into<PortId>, frame: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(DOWNLINK_TAG.len() + frame.len());
        bytes.extend_from_slice(DOWNLINK_TAG);
        bytes.extend_from_slice(frame);
        Self::bytes(port, bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub port: PortId,
    pub kind: PayloadKind,
}

impl ReadRequest {
    pub fn new(port: impl Into<PortId>, kind: PayloadKind) -> Self {
        Self {
            port: port.into(),
            kind,
        }
    }
}

/// Link-wide, not per port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SchedulerState {
    #[default]
    Idle,
    WritePending,
    /// A write went out; its read is owed before the next write.
    AwaitRead,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("[{port}] timed out waiting for a reply")]
    ReadTimeout { port: PortId },
    #[error("[{port}] returned no data for a {kind} read")]
    EmptyFrame { port: PortId, kind: PayloadKind },
    #[error("[{port}] write failed: {source}")]
    WriteFailure { port: PortId, source: io::Error },
    #[error("[{port}] read failed: {source}")]
    ReadFailure { port: PortId, source: io::Error },
    #[error("[{port}] sent a line that is not UTF-8")]
    GarbledFrame { port: PortId },
    #[error("request for port {0}, which is not open")]
    UnknownPort(PortId),
}

impl LinkError {
    pub fn port(&self) -> &str {
        match self {
            LinkError::ReadTimeout { port }
            | LinkError::EmptyFrame { port, .. }
            | LinkError::WriteFailure { port, .. }
            | LinkError::ReadFailure { port, .. }
            | LinkError::GarbledFrame { port }
            | LinkError::UnknownPort(port) => port,
        }
    }
}

/// What happened to a repeating poll handed to [`LinkHandle::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Queued,
    /// The previous poll of that kind on that port is still unanswered.
    Coalesced,
    Refused,
}

#[derive(Debug)]
pub enum Action {
    Write(WriteRequest),
    Read(ReadRequest),
}

/// Queues and call-and-response state shared between the scheduler and its
/// producers, always accessed under one lock through [`LinkHandle`].
#[derive(Debug)]
pub struct LinkState {
    read_queue: Deque<ReadRequest, MAX_QUEUED_REQUESTS>,
    write_queue: Deque<WriteRequest, MAX_QUEUED_REQUESTS>,
    state: SchedulerState,
    bypass_call_response: bool,
    ports_good: bool,
    open_ports: Vec<PortId>,
    session: u64,
    dropped_requests: u32,
}

impl LinkState {
    pub fn new() -> Self {
        Self {
            read_queue: Deque::new(),
            write_queue: Deque::new(),
            state: SchedulerState::Idle,
            bypass_call_response: false,
            ports_good: false,
            open_ports: Vec::new(),
            session: 0,
            dropped_requests: 0,
        }
    }

    pub fn push_write(&mut self, request: WriteRequest) -> bool {
        match self.write_queue.push_back(request) {
            Ok(()) => true,
            Err(request) => {
                self.refuse(&request.port, "write");
                false
            }
        }
    }

    pub fn push_read(&mut self, request: ReadRequest) -> bool {
        match self.read_queue.push_back(request) {
            Ok(()) => true,
            Err(request) => {
                self.refuse(&request.port, "read");
                false
            }
        }
    }

    /// Enqueue a write together with the read that answers it. Both go in or
    /// neither does, so the queues never fall out of step.
    pub fn push_exchange(&mut self, write: WriteRequest, read: ReadRequest) -> bool {
        if self.write_queue.is_full() || self.read_queue.is_full() {
            self.refuse(&write.port, "exchange");
            return false;
        }
        self.push_write(write) && self.push_read(read)
    }

    /// True while a `kind` read from `port` is still waiting in the queue.
    pub fn is_outstanding(&self, port: &str, kind: PayloadKind) -> bool {
        self.read_queue.iter().any(|read| read.kind == kind && read.port == port)
    }

    fn refuse(&mut self, port: &str, what: &str) {
        self.dropped_requests += 1;
        warn!("Serial queue full, dropping {} request for {}", what, port);
    }

    /// Pop the request the call-and-response discipline allows next. A read
    /// is only serviced after a write; a second write only goes out once the
    /// owed read was serviced, unless call-and-response is bypassed.
    pub fn next_action(&mut self) -> Option<Action> {
        if self.state == SchedulerState::AwaitRead {
            if let Some(read) = self.read_queue.pop_front() {
                return Some(Action::Read(read));
            }
            if !self.bypass_call_response {
                return None;
            }
        }

        let write = self.write_queue.pop_front()?;
        self.state = SchedulerState::WritePending;
        Some(Action::Write(write))
    }

    pub fn complete_write(&mut self) {
        self.state = SchedulerState::AwaitRead;
    }

    pub fn complete_read(&mut self) {
        self.state = SchedulerState::Idle;
    }

    /// Flag the link bad and drop all queued work. Returns how many requests
    /// were discarded.
    pub fn reset_for_reconnect(&mut self) -> usize {
        let dropped = self.read_queue.len() + self.write_queue.len();
        self.ports_good = false;
        self.read_queue.clear();
        self.write_queue.clear();
        self.bypass_call_response = false;
        self.state = SchedulerState::Idle;
        dropped
    }

    /// Publish a fresh port list. A non-empty list starts a new link
    /// session.
    pub fn rearm(&mut self, ports: Vec<PortId>) {
        self.ports_good = !ports.is_empty();
        if self.ports_good {
            self.session += 1;
        }
        self.open_ports = ports;
        self.state = SchedulerState::Idle;
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn bypass_call_response(&self) -> bool {
        self.bypass_call_response
    }

    pub fn set_bypass_call_response(&mut self, bypass: bool) {
        self.bypass_call_response = bypass;
    }

    pub fn ports_good(&self) -> bool {
        self.ports_good
    }

    pub fn open_ports(&self) -> &[PortId] {
        &self.open_ports
    }

    /// Counts the times the link came up.
    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn read_queue_len(&self) -> usize {
        self.read_queue.len()
    }

    pub fn write_queue_len(&self) -> usize {
        self.write_queue.len()
    }

    pub fn dropped_requests(&self) -> u32 {
        self.dropped_requests
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared access to the [`LinkState`] (the "serial" lock).
#[derive(Debug, Clone, Default)]
pub struct LinkHandle {
    inner: Arc<Mutex<LinkState>>,
}

impl LinkHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask `port` for one reply of `kind`: the tag goes out as a write and
    /// the matching read is queued behind it.
    pub fn request(&self, port: &str, kind: PayloadKind) -> bool {
        self.lock()
            .push_exchange(WriteRequest::probe(port, kind), ReadRequest::new(port, kind))
    }

    /// Like [`request`](Self::request) for polls that repeat on a timer. A
    /// port keeps at most one unanswered poll of each kind, so a producer
    /// running faster than the scheduler cannot fill the queues.
    pub fn poll(&self, port: &str, kind: PayloadKind) -> PollOutcome {
        let mut state = self.lock();
        if state.is_outstanding(port, kind) {
            return PollOutcome::Coalesced;
        }
        if state.push_exchange(WriteRequest::probe(port, kind), ReadRequest::new(port, kind)) {
            PollOutcome::Queued
        } else {
            PollOutcome::Refused
        }
    }

    pub fn ports_good(&self) -> bool {
        self.lock().ports_good()
    }

    pub fn open_ports(&self) -> Vec<PortId> {
        self.lock().open_ports().to_vec()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub writes_serviced: u32,
    pub reads_serviced: u32,
    pub uplinks_received: u32,
    pub link_faults: u32,
    pub reconnections: u32,
    pub rearms: u32,
}

#[derive(Debug)]
pub enum TickOutcome {
    Idle,
    Wrote { port: PortId, bytes: usize },
    Read { port: PortId, kind: PayloadKind, line: String },
    Rearmed(Vec<PortId>),
    Reconnected(LinkError),
}

/// Services one queued request per tick over the open ports, enforcing
/// call-and-response, and hands link faults to the reconnection supervisor.
pub struct DuplexScheduler {
    registry: PortRegistry,
    link: LinkHandle,
    uplink: Arc<UplinkCommandStore>,
    log: Arc<dyn FlightLog>,
    photosensors: Vec<Box<dyn Photosensor>>,
    supervisor: ReconnectionSupervisor,
    settings: LineSettings,
    rearm_interval: Duration,
    last_rearm: Option<Instant>,
    stats: SchedulerStats,
}

impl DuplexScheduler {
    pub fn new(
        registry: PortRegistry,
        link: LinkHandle,
        uplink: Arc<UplinkCommandStore>,
        log: Arc<dyn FlightLog>,
        supervisor: ReconnectionSupervisor,
        settings: LineSettings,
    ) -> Self {
        let rearm_interval = supervisor.backoff();
        Self {
            registry,
            link,
            uplink,
            log,
            photosensors: Vec::new(),
            supervisor,
            settings,
            rearm_interval,
            last_rearm: None,
            stats: SchedulerStats::default(),
        }
    }

    pub fn with_photosensors(mut self, photosensors: Vec<Box<dyn Photosensor>>) -> Self {
        self.photosensors = photosensors;
        self
    }

    pub fn link(&self) -> &LinkHandle {
        &self.link
    }

    pub fn registry(&self) -> &PortRegistry {
        &self.registry
    }

    pub fn supervisor(&self) -> &ReconnectionSupervisor {
        &self.supervisor
    }

    pub fn get_stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Rediscover ports and, if any opened, flag the link good.
    pub fn rearm(&mut self) -> Result<Vec<PortId>, PortError> {
        self.last_rearm = Some(Instant::now());
        let ports = self.registry.discover(self.settings.baud_rate, self.settings.timeout)?;
        self.link.lock().rearm(ports.clone());
        if ports.is_empty() {
            warn!("No serial ports available, link stays down");
        } else {
            self.stats.rearms += 1;
        }
        Ok(ports)
    }

    /// Run until `running` is cleared, one tick per `interval`.
    pub fn run(&mut self, running: &AtomicBool, interval: Duration) {
        info!("Serial scheduler starting");
        while running.load(Ordering::Relaxed) {
            self.tick();
            thread::sleep(interval);
        }
        info!("Serial scheduler exiting");
    }

    /// Service at most one request. Never fails: faults are logged and
    /// answered with a reconnection cycle.
    pub fn tick(&mut self) -> TickOutcome {
        if !self.link.ports_good() {
            return self.try_rearm();
        }

        let action = self.link.lock().next_action();
        match action {
            None => TickOutcome::Idle,
            Some(Action::Write(request)) => match self.write(&request) {
                Ok(bytes) => {
                    self.link.lock().complete_write();
                    self.stats.writes_serviced += 1;
                    TickOutcome::Wrote {
                        port: request.port,
                        bytes,
                    }
                }
                Err(e) => self.escalate(e),
            },
            Some(Action::Read(request)) => match self.read(&request) {
                Ok(line) => {
                    self.link.lock().complete_read();
                    self.stats.reads_serviced += 1;
                    TickOutcome::Read {
                        port: request.port,
                        kind: request.kind,
                        line,
                    }
                }
                Err(e) => self.escalate(e),
            },
        }
    }

    fn try_rearm(&mut self) -> TickOutcome {
        let due = self
            .last_rearm
            .map_or(true, |last| last.elapsed() >= self.rearm_interval);
        if !due {
            return TickOutcome::Idle;
        }
        match self.rearm() {
            Ok(ports) if !ports.is_empty() => TickOutcome::Rearmed(ports),
            Ok(_) => TickOutcome::Idle,
            Err(e) => {
                error!("Port rediscovery failed: {}", e);
                TickOutcome::Idle
            }
        }
    }

    fn escalate(&mut self, fault: LinkError) -> TickOutcome {
        error!("{}. Attempting reconnect.", fault);
        self.log.append(LogChannel::Error, &fault.to_string());
        self.stats.link_faults += 1;

        self.supervisor.recover(&mut self.registry, &self.link);
        self.stats.reconnections += 1;
        // Rediscover on the very next tick.
        self.last_rearm = None;
        TickOutcome::Reconnected(fault)
    }

    fn write(&mut self, request: &WriteRequest) -> Result<usize, LinkError> {
        let port = &request.port;
        let link = self
            .registry
            .get_mut(port)
            .ok_or_else(|| LinkError::UnknownPort(port.clone()))?;

        let bytes = request.payload.as_bytes();
        link.write_all(bytes).map_err(|source| LinkError::WriteFailure {
            port: port.clone(),
            source,
        })?;

        debug!("sent [{}] over [{}]", request.payload.describe(), port);
        Ok(bytes.len())
    }

    fn read(&mut self, request: &ReadRequest) -> Result<String, LinkError> {
        let port = &request.port;
        let link = self
            .registry
            .get_mut(port)
            .ok_or_else(|| LinkError::UnknownPort(port.clone()))?;

        let raw = match link.read_line() {
            Ok(raw) => raw,
            // No uplink waiting is the normal answer to a poll.
            Err(e) if e.kind() == io::ErrorKind::TimedOut && request.kind == PayloadKind::Rx => Vec::new(),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(LinkError::ReadTimeout { port: port.clone() });
            }
            Err(source) => {
                return Err(LinkError::ReadFailure {
                    port: port.clone(),
                    source,
                })
            }
        };

        let text = String::from_utf8(raw).map_err(|_| LinkError::GarbledFrame { port: port.clone() })?;
        let line = text.trim().replace(['\r', '\n'], "");
        if line.is_empty() && request.kind != PayloadKind::Rx {
            return Err(LinkError::EmptyFrame {
                port: port.clone(),
                kind: request.kind,
            });
        }

        let line = self.dispatch(request, line);
        if !line.is_empty() {
            info!("received [{}] information over [{}]", request.kind, port);
        }
        Ok(line)
    }

    // Route a received line to its log channel, merging local sensor data
    // where it belongs. Returns the line as recorded.
    fn dispatch(&mut self, request: &ReadRequest, line: String) -> String {
        match request.kind {
            PayloadKind::Data => {
                let samples: Vec<(String, f64)> = self
                    .photosensors
                    .iter_mut()
                    .filter_map(|sensor| sensor.sample())
                    .collect();
                let line = augment_data(&line, &samples);
                self.log.append(LogChannel::Data, &line);
                line
            }
            PayloadKind::Header => {
                let additions: Vec<String> = self
                    .photosensors
                    .iter()
                    .map(|sensor| sensor.header_addition())
                    .collect();
                let line = augment_header(&line, &additions);
                self.log.append(LogChannel::Header, &line);
                line
            }
            PayloadKind::Id => {
                self.log.append(LogChannel::Id, &line);
                line
            }
            PayloadKind::Tx => {
                self.log.append(LogChannel::Tx, &line);
                line
            }
            PayloadKind::Rx => {
                if !line.is_empty() {
                    self.log.append(LogChannel::Rx, &line);
                    // Assume uplink commands are one comma-delimited list.
                    self.uplink.publish(line.split(',').map(str::to_string).collect());
                    self.stats.uplinks_received += 1;
                }
                line
            }
        }
    }
}

impl fmt::Debug for DuplexScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexScheduler")
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Append `name,value` pairs to a measurement line, keeping exactly one
/// separating comma and no trailing comma.
pub fn augment_data(line: &str, samples: &[(String, f64)]) -> String {
    let mut merged = line.to_string();
    for (name, value) in samples {
        if !merged.ends_with(',') {
            merged.push(',');
        }
        merged.push_str(name);
        merged.push(',');
        merged.push_str(&value.to_string());
    }
    if merged.ends_with(',') {
        merged.pop();
    }
    merged
}

/// Append each sensor's header columns and mark the result with
/// [`HEADER_TAG`].
pub fn augment_header(line: &str, additions: &[String]) -> String {
    let mut merged = line.to_string();
    for addition in additions {
        if !merged.ends_with(',') {
            merged.push(',');
        }
        merged.push_str(addition);
        if merged.ends_with(',') {
            merged.pop();
        }
    }
    format!("{HEADER_TAG},{merged}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(state: &mut LinkState, port: &str, kind: PayloadKind) {
        assert!(state.push_exchange(WriteRequest::probe(port, kind), ReadRequest::new(port, kind)));
    }

    #[test]
    fn test_link_state_creation() {
        let state = LinkState::new();
        assert_eq!(state.state(), SchedulerState::Idle);
        assert!(!state.ports_good());
        assert!(!state.bypass_call_response());
        assert_eq!(state.read_queue_len(), 0);
        assert_eq!(state.write_queue_len(), 0);
    }

    #[test]
    fn test_poll_coalesces_until_answered() {
        let link = LinkHandle::new();
        assert_eq!(link.poll("/dev/ttyACM0", PayloadKind::Rx), PollOutcome::Queued);
        assert_eq!(link.poll("/dev/ttyACM0", PayloadKind::Rx), PollOutcome::Coalesced);
        assert_eq!(link.poll("/dev/ttyACM1", PayloadKind::Rx), PollOutcome::Queued);
        assert_eq!(link.poll("/dev/ttyACM0", PayloadKind::Data), PollOutcome::Queued);

        let mut state = link.lock();
        assert_eq!(state.write_queue_len(), 3);
        assert_eq!(state.dropped_requests(), 0);

        // Still owed after its write goes out.
        assert!(matches!(state.next_action(), Some(Action::Write(_))));
        state.complete_write();
        assert!(state.is_outstanding("/dev/ttyACM0", PayloadKind::Rx));
        assert!(matches!(state.next_action(), Some(Action::Read(_))));
        state.complete_read();
        assert!(!state.is_outstanding("/dev/ttyACM0", PayloadKind::Rx));
        drop(state);

        assert_eq!(link.poll("/dev/ttyACM0", PayloadKind::Rx), PollOutcome::Queued);
    }

    #[test]
    fn test_write_then_matching_read() {
        let mut state = LinkState::new();
        exchange(&mut state, "/dev/ttyACM0", PayloadKind::Rx);
        exchange(&mut state, "/dev/ttyACM0", PayloadKind::Data);

        assert!(matches!(state.next_action(), Some(Action::Write(w)) if w.payload == WritePayload::Text("RX".into())));
        assert_eq!(state.state(), SchedulerState::WritePending);
        state.complete_write();
        assert_eq!(state.state(), SchedulerState::AwaitRead);

        assert!(matches!(state.next_action(), Some(Action::Read(r)) if r.kind == PayloadKind::Rx));
        state.complete_read();
        assert_eq!(state.state(), SchedulerState::Idle);

        assert!(matches!(state.next_action(), Some(Action::Write(w)) if w.payload == WritePayload::Text("DATA".into())));
    }

    #[test]
    fn test_second_write_waits_for_owed_read() {
        let mut state = LinkState::new();
        state.push_write(WriteRequest::text("/dev/ttyACM0", "ID"));
        state.push_write(WriteRequest::text("/dev/ttyACM0", "HEADER"));

        assert!(matches!(state.next_action(), Some(Action::Write(_))));
        state.complete_write();
        // no read queued yet: nothing may be serviced
        assert!(state.next_action().is_none());
        assert_eq!(state.write_queue_len(), 1);

        state.push_read(ReadRequest::new("/dev/ttyACM0", PayloadKind::Id));
        assert!(matches!(state.next_action(), Some(Action::Read(_))));
    }

    #[test]
    fn test_read_without_write_is_never_serviced() {
        let mut state = LinkState::new();
        state.push_read(ReadRequest::new("/dev/ttyACM0", PayloadKind::Data));
        assert!(state.next_action().is_none());
        assert_eq!(state.read_queue_len(), 1);
    }

    #[test]
    fn test_bypass_allows_consecutive_writes() {
        let mut state = LinkState::new();
        state.set_bypass_call_response(true);
        state.push_write(WriteRequest::text("/dev/ttyACM0", "ID"));
        state.push_write(WriteRequest::text("/dev/ttyACM0", "HEADER"));

        assert!(matches!(state.next_action(), Some(Action::Write(_))));
        state.complete_write();
        assert!(matches!(state.next_action(), Some(Action::Write(_))));
    }

    #[test]
    fn test_reset_for_reconnect_clears_everything() {
        let mut state = LinkState::new();
        state.rearm(vec!["/dev/ttyACM0".to_string()]);
        state.set_bypass_call_response(true);
        exchange(&mut state, "/dev/ttyACM0", PayloadKind::Rx);
        exchange(&mut state, "/dev/ttyACM0", PayloadKind::Tx);
        let _ = state.next_action();
        state.complete_write();

        assert_eq!(state.reset_for_reconnect(), 3);
        assert!(!state.ports_good());
        assert!(!state.bypass_call_response());
        assert_eq!(state.state(), SchedulerState::Idle);
        assert_eq!(state.read_queue_len() + state.write_queue_len(), 0);
    }

    #[test]
    fn test_full_queue_refuses_whole_exchange() {
        let mut state = LinkState::new();
        for _ in 0..MAX_QUEUED_REQUESTS {
            assert!(state.push_read(ReadRequest::new("/dev/ttyACM0", PayloadKind::Rx)));
        }
        assert!(!state.push_exchange(
            WriteRequest::probe("/dev/ttyACM0", PayloadKind::Rx),
            ReadRequest::new("/dev/ttyACM0", PayloadKind::Rx)
        ));
        assert_eq!(state.write_queue_len(), 0);
        assert_eq!(state.dropped_requests(), 1);
    }

    #[test]
    fn test_downlink_payload_layout() {
        let request = WriteRequest::downlink("/dev/ttyACM0", &[0xAB, 0xCD]);
        assert_eq!(request.payload.as_bytes(), b"TX\xAB\xCD");
        assert_eq!(request.payload.describe(), "<4 bytes>");
        assert_eq!(WritePayload::Text("RX\r\n".into()).describe(), "RX");
    }

    #[test]
    fn test_augment_data() {
        let samples = vec![("lux1".to_string(), 12.5), ("lux2".to_string(), 3.0)];
        assert_eq!(augment_data("1,2,3", &samples), "1,2,3,lux1,12.5,lux2,3");
        assert_eq!(augment_data("1,2,3,", &samples), "1,2,3,lux1,12.5,lux2,3");
        assert_eq!(augment_data("1,2,3,", &[]), "1,2,3");
        assert_eq!(augment_data("1,2,3", &[]), "1,2,3");
    }

    #[test]
    fn test_augment_header() {
        let additions = vec!["lux1_name,lux1".to_string()];
        assert_eq!(augment_header("time,pressure", &additions), "PiTS,time,pressure,lux1_name,lux1");
        assert_eq!(augment_header("time,pressure,", &additions), "PiTS,time,pressure,lux1_name,lux1");
        assert_eq!(augment_header("time,pressure", &[]), "PiTS,time,pressure");
    }
}
