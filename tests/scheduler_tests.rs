use pits::capabilities::{LogChannel, Photosensor};
use pits::logbook::MemoryLog;
use pits::ports::{LineSettings, PortRegistry};
use pits::reconnect::{Level, ReconnectionSupervisor, ResetLine};
use pits::scheduler::{
    DuplexScheduler, LinkError, LinkHandle, PayloadKind, ReadRequest, SchedulerState, TickOutcome, WriteRequest,
};
use pits::sim::{InjectedFault, SimulatedDevice, SimulatedPorts};
use pits::uplink::UplinkCommandStore;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PORT: &str = "/dev/ttyACM0";

#[derive(Clone, Default)]
struct RecordingResetLine {
    levels: Arc<Mutex<Vec<Level>>>,
}

impl RecordingResetLine {
    fn levels(&self) -> Vec<Level> {
        self.levels.lock().unwrap().clone()
    }
}

impl ResetLine for RecordingResetLine {
    fn set_level(&mut self, level: Level) -> io::Result<()> {
        self.levels.lock().unwrap().push(level);
        Ok(())
    }
}

struct FailingResetLine;

impl ResetLine for FailingResetLine {
    fn set_level(&mut self, _level: Level) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "gpio not exported"))
    }
}

struct FixedSensor {
    name: &'static str,
    value: f64,
}

impl Photosensor for FixedSensor {
    fn header_addition(&self) -> String {
        format!("{}_name,{}", self.name, self.name)
    }

    fn sample(&mut self) -> Option<(String, f64)> {
        Some((self.name.to_string(), self.value))
    }
}

struct Fixture {
    scheduler: DuplexScheduler,
    link: LinkHandle,
    log: Arc<MemoryLog>,
    uplink: Arc<UplinkCommandStore>,
    reset_line: RecordingResetLine,
}

fn fixture(devices: &[SimulatedDevice]) -> Fixture {
    let mut ports = SimulatedPorts::new();
    for device in devices {
        ports.add(device.clone());
    }
    let link = LinkHandle::new();
    let log = Arc::new(MemoryLog::new());
    let uplink = Arc::new(UplinkCommandStore::new());
    let reset_line = RecordingResetLine::default();
    let supervisor = ReconnectionSupervisor::new(Box::new(reset_line.clone()), Duration::ZERO);

    let mut scheduler = DuplexScheduler::new(
        PortRegistry::new(Box::new(ports)),
        link.clone(),
        Arc::clone(&uplink),
        log.clone(),
        supervisor,
        LineSettings::new(9600, Duration::from_millis(50)),
    );
    scheduler.rearm().unwrap();

    Fixture {
        scheduler,
        link,
        log,
        uplink,
        reset_line,
    }
}

#[test]
fn test_rearm_flags_link_good() {
    let device = SimulatedDevice::new(PORT);
    let fx = fixture(&[device]);

    assert!(fx.link.ports_good());
    assert_eq!(fx.link.open_ports(), vec![PORT.to_string()]);
    assert_eq!(fx.scheduler.get_stats().rearms, 1);
}

#[test]
fn test_no_ports_keeps_link_down() {
    let device = SimulatedDevice::new(PORT);
    device.set_available(false);
    let mut fx = fixture(&[device.clone()]);

    assert!(!fx.link.ports_good());
    assert!(matches!(fx.scheduler.tick(), TickOutcome::Idle));

    // The device coming back is picked up by a later tick.
    device.set_available(true);
    assert!(matches!(fx.scheduler.tick(), TickOutcome::Rearmed(ports) if ports == vec![PORT.to_string()]));
    assert!(fx.link.ports_good());
}

#[test]
fn test_id_request_write_then_read() {
    let device = SimulatedDevice::new(PORT);
    device.push_response("payload-7\r\n");
    let mut fx = fixture(&[device.clone()]);

    assert!(fx.link.request(PORT, PayloadKind::Id));
    assert!(matches!(fx.scheduler.tick(), TickOutcome::Wrote { bytes: 2, .. }));
    assert_eq!(fx.link.lock().state(), SchedulerState::AwaitRead);

    match fx.scheduler.tick() {
        TickOutcome::Read { port, kind, line } => {
            assert_eq!(port, PORT);
            assert_eq!(kind, PayloadKind::Id);
            assert_eq!(line, "payload-7");
        }
        other => panic!("expected a read, got {other:?}"),
    }

    assert_eq!(device.writes(), vec![b"ID".to_vec()]);
    assert_eq!(fx.log.channel(LogChannel::Id), vec!["payload-7".to_string()]);
    assert_eq!(fx.link.lock().state(), SchedulerState::Idle);
    assert!(matches!(fx.scheduler.tick(), TickOutcome::Idle));
}

#[test]
fn test_data_line_merges_photosensor_samples() {
    let device = SimulatedDevice::new(PORT);
    device.push_response("101.3,22.5,\r\n");
    let mut fx = fixture(&[device]);
    fx.scheduler = fx
        .scheduler
        .with_photosensors(vec![Box::new(FixedSensor { name: "lux1", value: 12.5 }) as Box<dyn Photosensor>]);

    fx.link.request(PORT, PayloadKind::Data);
    fx.scheduler.tick();
    fx.scheduler.tick();

    assert_eq!(fx.log.channel(LogChannel::Data), vec!["101.3,22.5,lux1,12.5".to_string()]);
}

#[test]
fn test_header_is_tagged_and_extended() {
    let device = SimulatedDevice::new(PORT);
    device.push_response("pressure,temp\r\n");
    let mut fx = fixture(&[device]);
    fx.scheduler = fx
        .scheduler
        .with_photosensors(vec![Box::new(FixedSensor { name: "lux1", value: 0.0 }) as Box<dyn Photosensor>]);

    fx.link.request(PORT, PayloadKind::Header);
    fx.scheduler.tick();
    fx.scheduler.tick();

    assert_eq!(
        fx.log.channel(LogChannel::Header),
        vec!["PiTS,pressure,temp,lux1_name,lux1".to_string()]
    );
}

#[test]
fn test_rx_reply_is_published_as_uplink() {
    let device = SimulatedDevice::new(PORT);
    device.push_response("CUT,NOW\r\n");
    let mut fx = fixture(&[device]);

    fx.link.request(PORT, PayloadKind::Rx);
    fx.scheduler.tick();
    fx.scheduler.tick();

    assert_eq!(
        fx.uplink.take_if_pending(),
        Some(vec!["CUT".to_string(), "NOW".to_string()])
    );
    assert_eq!(fx.log.channel(LogChannel::Rx), vec!["CUT,NOW".to_string()]);
    assert_eq!(fx.scheduler.get_stats().uplinks_received, 1);
}

#[test]
fn test_silent_rx_poll_is_not_a_fault() {
    let device = SimulatedDevice::new(PORT);
    let mut fx = fixture(&[device]);

    fx.link.request(PORT, PayloadKind::Rx);
    fx.scheduler.tick();
    assert!(matches!(fx.scheduler.tick(), TickOutcome::Read { ref line, .. } if line.is_empty()));

    assert_eq!(fx.scheduler.get_stats().link_faults, 0);
    assert_eq!(fx.uplink.take_if_pending(), None);
    assert!(fx.log.channel(LogChannel::Rx).is_empty());
    assert!(fx.link.ports_good());
}

#[test]
fn test_downlink_frame_goes_out_raw() {
    let device = SimulatedDevice::new(PORT);
    device.push_response("TX ok\r\n");
    let mut fx = fixture(&[device.clone()]);

    fx.link.lock().push_exchange(
        WriteRequest::downlink(PORT, &[0x00, 0xFF, 0x0A]),
        ReadRequest::new(PORT, PayloadKind::Tx),
    );
    assert!(matches!(fx.scheduler.tick(), TickOutcome::Wrote { bytes: 5, .. }));
    fx.scheduler.tick();

    assert_eq!(device.writes(), vec![b"TX\x00\xFF\x0A".to_vec()]);
    assert_eq!(fx.log.channel(LogChannel::Tx), vec!["TX ok".to_string()]);
}

#[test]
fn test_writes_and_reads_alternate() {
    let device = SimulatedDevice::new(PORT);
    device.set_responder(|written: &[u8]| Some([written, &b"\r\n"[..]].concat()));
    let mut fx = fixture(&[device]);

    for kind in [PayloadKind::Id, PayloadKind::Header, PayloadKind::Data, PayloadKind::Tx] {
        fx.link.request(PORT, kind);
    }

    let mut serviced = Vec::new();
    for _ in 0..10 {
        match fx.scheduler.tick() {
            TickOutcome::Wrote { .. } => serviced.push('W'),
            TickOutcome::Read { .. } => serviced.push('R'),
            TickOutcome::Idle => break,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(serviced.iter().collect::<String>(), "WRWRWRWR");
}

#[test]
fn test_read_without_write_never_serviced() {
    let device = SimulatedDevice::new(PORT);
    device.push_response("unsolicited\r\n");
    let mut fx = fixture(&[device.clone()]);

    fx.link.lock().push_read(ReadRequest::new(PORT, PayloadKind::Data));
    for _ in 0..3 {
        assert!(matches!(fx.scheduler.tick(), TickOutcome::Idle));
    }
    assert_eq!(device.pending_responses(), 1);
    assert_eq!(fx.link.lock().read_queue_len(), 1);
}

#[test]
fn test_read_timeout_triggers_exactly_one_reconnection() {
    let device = SimulatedDevice::new(PORT);
    let mut fx = fixture(&[device.clone()]);

    fx.link.lock().set_bypass_call_response(true);
    fx.link.request(PORT, PayloadKind::Data);
    fx.link.request(PORT, PayloadKind::Rx);
    fx.link.request(PORT, PayloadKind::Header);
    device.inject_fault(InjectedFault::ReadTimeout);

    assert!(matches!(fx.scheduler.tick(), TickOutcome::Wrote { .. }));
    assert!(matches!(
        fx.scheduler.tick(),
        TickOutcome::Reconnected(LinkError::ReadTimeout { ref port }) if port == PORT
    ));

    {
        let state = fx.link.lock();
        assert_eq!(state.read_queue_len(), 0);
        assert_eq!(state.write_queue_len(), 0);
        assert!(!state.bypass_call_response());
        assert!(!state.ports_good());
        assert_eq!(state.state(), SchedulerState::Idle);
    }
    assert_eq!(fx.scheduler.supervisor().cycles(), 1);
    assert_eq!(fx.scheduler.get_stats().link_faults, 1);
    assert_eq!(fx.reset_line.levels(), vec![Level::Low, Level::High]);
    assert_eq!(device.buffer_clears(), 1);
    assert_eq!(fx.log.channel(LogChannel::Error).len(), 1);

    // The next tick rediscovers and the link is usable again.
    assert!(matches!(fx.scheduler.tick(), TickOutcome::Rearmed(_)));
    assert!(fx.link.ports_good());
    assert_eq!(fx.scheduler.supervisor().cycles(), 1);
}

#[test]
fn test_write_failure_escalates() {
    let device = SimulatedDevice::new(PORT);
    let mut fx = fixture(&[device.clone()]);

    device.inject_fault(InjectedFault::WriteFailure);
    fx.link.request(PORT, PayloadKind::Id);

    assert!(matches!(
        fx.scheduler.tick(),
        TickOutcome::Reconnected(LinkError::WriteFailure { .. })
    ));
    // The failed write leaves no read owed.
    assert_eq!(fx.link.lock().state(), SchedulerState::Idle);
    assert_eq!(fx.link.lock().read_queue_len(), 0);
}

#[test]
fn test_empty_reply_escalates() {
    let device = SimulatedDevice::new(PORT);
    device.push_response("\r\n");
    let mut fx = fixture(&[device]);

    fx.link.request(PORT, PayloadKind::Id);
    fx.scheduler.tick();
    assert!(matches!(
        fx.scheduler.tick(),
        TickOutcome::Reconnected(LinkError::EmptyFrame { kind: PayloadKind::Id, .. })
    ));
}

#[test]
fn test_garbled_reply_escalates() {
    let device = SimulatedDevice::new(PORT);
    device.inject_fault(InjectedFault::Garbage);
    let mut fx = fixture(&[device]);

    fx.link.request(PORT, PayloadKind::Data);
    fx.scheduler.tick();
    assert!(matches!(
        fx.scheduler.tick(),
        TickOutcome::Reconnected(LinkError::GarbledFrame { .. })
    ));
}

#[test]
fn test_request_for_unknown_port_is_a_link_fault() {
    let device = SimulatedDevice::new(PORT);
    let mut fx = fixture(&[device]);

    fx.link.request("/dev/ttyUSB9", PayloadKind::Id);
    assert!(matches!(
        fx.scheduler.tick(),
        TickOutcome::Reconnected(LinkError::UnknownPort(ref port)) if port == "/dev/ttyUSB9"
    ));
}

#[test]
fn test_reset_line_failure_does_not_stop_recovery() {
    let device = SimulatedDevice::new(PORT);
    let mut ports = SimulatedPorts::new();
    ports.add(device.clone());
    let link = LinkHandle::new();
    let mut scheduler = DuplexScheduler::new(
        PortRegistry::new(Box::new(ports)),
        link.clone(),
        Arc::new(UplinkCommandStore::new()),
        Arc::new(MemoryLog::new()),
        ReconnectionSupervisor::new(Box::new(FailingResetLine), Duration::ZERO),
        LineSettings::new(9600, Duration::from_millis(50)),
    );
    scheduler.rearm().unwrap();

    device.inject_fault(InjectedFault::WriteFailure);
    link.request(PORT, PayloadKind::Id);
    scheduler.tick();

    assert_eq!(scheduler.supervisor().cycles(), 1);
    assert_eq!(device.buffer_clears(), 1);
    assert!(!link.ports_good());
}

// Known edge case, kept on purpose: recovery never escalates and never gives
// up. Every fault runs the same fixed cycle, however many came before it.
#[test]
fn test_repeated_faults_reconnect_forever_without_escalation() {
    let device = SimulatedDevice::new(PORT);
    let mut fx = fixture(&[device.clone()]);
    let backoff = fx.scheduler.supervisor().backoff();

    for cycle in 1..=6u64 {
        device.inject_fault(InjectedFault::ReadTimeout);
        fx.link.request(PORT, PayloadKind::Data);

        assert!(matches!(fx.scheduler.tick(), TickOutcome::Wrote { .. }));
        assert!(matches!(fx.scheduler.tick(), TickOutcome::Reconnected(_)));
        assert_eq!(fx.scheduler.supervisor().cycles(), cycle);
        assert_eq!(fx.scheduler.supervisor().backoff(), backoff);

        assert!(matches!(fx.scheduler.tick(), TickOutcome::Rearmed(_)));
    }

    let pulses = fx.reset_line.levels();
    assert_eq!(pulses.len(), 12);
    assert!(pulses.chunks(2).all(|pulse| pulse == [Level::Low, Level::High]));
    assert_eq!(fx.scheduler.get_stats().reconnections, 6);
}
