use crate::capabilities::{FlightLog, LogChannel};
use crate::codec::TelemetryCodec;
use crate::scheduler::{LinkHandle, PayloadKind, PollOutcome, ReadRequest, WriteRequest};
use crate::uplink::UplinkCommandStore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CadenceSettings {
    pub downlink_interval: Duration,
    /// Pause between enqueue steps.
    pub buffering_delay: Duration,
    pub enabled: bool,
}

impl Default for CadenceSettings {
    fn default() -> Self {
        Self {
            downlink_interval: Duration::from_secs(9),
            buffering_delay: Duration::from_millis(50),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceStats {
    pub polls_enqueued: u32,
    pub polls_coalesced: u32,
    pub downlinks_enqueued: u32,
    pub downlinks_skipped: u32,
    pub uplink_resets: u32,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CadenceTick {
    pub polls: usize,
    /// Length of the frame queued for downlink, without the `TX` tag.
    pub downlink: Option<usize>,
    pub uplink_reset: bool,
}

/// Asks the payload controller for its identity and header once per link
/// session, then for a measurement line at a fixed rate.
#[derive(Debug)]
pub struct AcquisitionPoller {
    interval: Duration,
    last_poll: Option<Instant>,
    identified_session: Option<u64>,
}

impl AcquisitionPoller {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_poll: None,
            identified_session: None,
        }
    }

    /// Returns how many requests were queued.
    pub fn tick(&mut self, link: &LinkHandle, now: Instant) -> usize {
        let (ports, session) = {
            let state = link.lock();
            if !state.ports_good() {
                return 0;
            }
            (state.open_ports().to_vec(), state.session())
        };

        let mut queued = 0;
        if self.identified_session != Some(session) {
            for port in &ports {
                queued += usize::from(link.request(port, PayloadKind::Id));
                queued += usize::from(link.request(port, PayloadKind::Header));
            }
            self.identified_session = Some(session);
        }

        let due = self
            .last_poll
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval);
        if due {
            for port in &ports {
                queued += usize::from(link.poll(port, PayloadKind::Data) == PollOutcome::Queued);
            }
            self.last_poll = Some(now);
        }
        queued
    }
}

/// Polls every open port for uplink and, once per downlink interval, sends
/// the newest data record to the first port as a `TX` frame. Only enqueues:
/// all serial I/O happens on the scheduler thread.
pub struct DownlinkCadenceController {
    link: LinkHandle,
    uplink: Arc<UplinkCommandStore>,
    log: Arc<dyn FlightLog>,
    codec: TelemetryCodec,
    settings: CadenceSettings,
    acquisition: Option<AcquisitionPoller>,
    last_downlink: Instant,
    stats: CadenceStats,
}

impl DownlinkCadenceController {
    /// The downlink interval is measured from `started`.
    pub fn new(
        link: LinkHandle,
        uplink: Arc<UplinkCommandStore>,
        log: Arc<dyn FlightLog>,
        codec: TelemetryCodec,
        settings: CadenceSettings,
        started: Instant,
    ) -> Self {
        Self {
            link,
            uplink,
            log,
            codec,
            settings,
            acquisition: None,
            last_downlink: started,
            stats: CadenceStats::default(),
        }
    }

    pub fn with_acquisition(mut self, poller: AcquisitionPoller) -> Self {
        self.acquisition = Some(poller);
        self
    }

    pub fn codec(&self) -> &TelemetryCodec {
        &self.codec
    }

    pub fn get_stats(&self) -> &CadenceStats {
        &self.stats
    }

    pub fn run(&mut self, running: &AtomicBool, interval: Duration) {
        info!("Telemetry cadence starting");
        while running.load(Ordering::Relaxed) {
            self.tick(Instant::now());
            thread::sleep(interval);
        }
        info!("Telemetry cadence exiting");
    }

    pub fn tick(&mut self, now: Instant) -> CadenceTick {
        let mut outcome = CadenceTick::default();

        if self.settings.enabled && self.link.ports_good() {
            if let Some(poller) = self.acquisition.as_mut() {
                poller.tick(&self.link, now);
            }

            let ports = self.link.open_ports();
            for (index, port) in ports.iter().enumerate() {
                if self.enqueue_poll(port) {
                    outcome.polls += 1;
                }
                if index == 0 && self.downlink_due(now) {
                    self.last_downlink = now;
                    outcome.downlink = self.enqueue_downlink(port);
                }
            }
        }

        // Uplink lock, taken only after the serial lock is released.
        if self.uplink.reset_if_stale() {
            self.stats.uplink_resets += 1;
            outcome.uplink_reset = true;
        }
        outcome
    }

    fn downlink_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_downlink) >= self.settings.downlink_interval
    }

    fn pace(&self) {
        if !self.settings.buffering_delay.is_zero() {
            thread::sleep(self.settings.buffering_delay);
        }
    }

    fn enqueue_poll(&mut self, port: &str) -> bool {
        self.pace();
        let outcome = self.link.poll(port, PayloadKind::Rx);
        self.pace();
        match outcome {
            PollOutcome::Queued => self.stats.polls_enqueued += 1,
            PollOutcome::Coalesced => self.stats.polls_coalesced += 1,
            PollOutcome::Refused => {}
        }
        outcome == PollOutcome::Queued
    }

    fn enqueue_downlink(&mut self, port: &str) -> Option<usize> {
        let line = match self.log.latest_line() {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("No data recorded yet, skipping downlink");
                self.stats.downlinks_skipped += 1;
                return None;
            }
            Err(e) => {
                warn!("Could not read the newest data record: {}", e);
                self.stats.downlinks_skipped += 1;
                return None;
            }
        };

        self.pace();
        let frame = match self.codec.encode(line.trim_matches('\n')) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Telemetry frame not sent: {}", e);
                self.log.append(LogChannel::Error, &format!("Telemetry frame not sent [{e}]"));
                self.stats.downlinks_skipped += 1;
                return None;
            }
        };

        let queued = self.link.lock().push_exchange(
            WriteRequest::downlink(port, &frame),
            ReadRequest::new(port, PayloadKind::Tx),
        );
        self.pace();
        if !queued {
            self.stats.downlinks_skipped += 1;
            return None;
        }

        debug!("Queued {} byte telemetry frame for {}", frame.len(), port);
        self.stats.downlinks_enqueued += 1;
        Some(frame.len())
    }
}

impl std::fmt::Debug for DownlinkCadenceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownlinkCadenceController")
            .field("settings", &self.settings)
            .field("acquisition", &self.acquisition)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
