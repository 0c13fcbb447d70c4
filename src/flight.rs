use crate::cadence::{AcquisitionPoller, CadenceStats, DownlinkCadenceController};
use crate::capabilities::{FlightLog, LogChannel, Photosensor};
use crate::codec::{SchemaError, TelemetryCodec};
use crate::config::{ConfigError, FlightConfig};
use crate::ports::{PortError, PortId, PortOpener, PortRegistry};
use crate::reconnect::{ReconnectionSupervisor, ResetLine};
use crate::scheduler::{DuplexScheduler, LinkHandle, SchedulerStats};
use crate::uplink::UplinkCommandStore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum FlightError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("flight workers already ran")]
    AlreadyRun,
    #[error("could not start the {0} worker: {1}")]
    Spawn(&'static str, std::io::Error),
    #[error("the {0} worker panicked")]
    WorkerPanicked(&'static str),
}

/// Clears the shared run flag. Loops notice at their next tick.
#[derive(Debug, Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlightReport {
    pub scheduler: SchedulerStats,
    pub cadence: CadenceStats,
    pub reconnection_cycles: u64,
    pub dropped_requests: u32,
}

pub struct FlightSystem {
    config: FlightConfig,
    link: LinkHandle,
    uplink: Arc<UplinkCommandStore>,
    log: Arc<dyn FlightLog>,
    running: Arc<AtomicBool>,
    ports: Vec<PortId>,
    workers: Option<(DuplexScheduler, DownlinkCadenceController)>,
}

impl FlightSystem {
    /// Validate the schema, discover ports and build both workers. If no
    /// port opens the scheduler keeps retrying discovery once running.
    pub fn new(
        config: FlightConfig,
        opener: Box<dyn PortOpener>,
        reset_line: Box<dyn ResetLine>,
        log: Arc<dyn FlightLog>,
        photosensors: Vec<Box<dyn Photosensor>>,
    ) -> Result<Self, FlightError> {
        let codec = TelemetryCodec::with_mode(config.schema()?, config.packing);
        info!(
            "Telemetry schema has {} fields, {} byte frames",
            codec.schema().len(),
            codec.frame_len()
        );

        let link = LinkHandle::new();
        let uplink = Arc::new(UplinkCommandStore::new());
        let registry =
            PortRegistry::with_exclusions(opener, config.serial_communication.excluded_ports.clone());
        let supervisor = ReconnectionSupervisor::new(reset_line, config.reconnection_wait());

        let mut scheduler = DuplexScheduler::new(
            registry,
            link.clone(),
            Arc::clone(&uplink),
            Arc::clone(&log),
            supervisor,
            config.line_settings(),
        )
        .with_photosensors(photosensors);
        let ports = scheduler.rearm()?;
        log.append(LogChannel::Info, &format!("Serial ports open: {ports:?}"));

        let mut cadence = DownlinkCadenceController::new(
            link.clone(),
            Arc::clone(&uplink),
            Arc::clone(&log),
            codec,
            config.cadence_settings(),
            Instant::now(),
        );
        if config.acquisition.enabled {
            cadence = cadence.with_acquisition(AcquisitionPoller::new(config.data_poll_interval()));
        }

        Ok(Self {
            config,
            link,
            uplink,
            log,
            running: Arc::new(AtomicBool::new(true)),
            ports,
            workers: Some((scheduler, cadence)),
        })
    }

    pub fn config(&self) -> &FlightConfig {
        &self.config
    }

    /// Ports open after the initial discovery.
    pub fn ports(&self) -> &[PortId] {
        &self.ports
    }

    pub fn link(&self) -> &LinkHandle {
        &self.link
    }

    /// Where flight control picks up uplinked commands.
    pub fn uplink(&self) -> Arc<UplinkCommandStore> {
        Arc::clone(&self.uplink)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: Arc::clone(&self.running),
        }
    }

    pub fn stop(&self) {
        self.stop_handle().stop();
    }

    /// Run the scheduler and cadence loops on their own threads until
    /// stopped. Can be called once.
    pub fn run(&mut self) -> Result<FlightReport, FlightError> {
        let (mut scheduler, mut cadence) = self.workers.take().ok_or(FlightError::AlreadyRun)?;
        let scheduler_tick = self.config.scheduler_tick();
        let cadence_tick = self.config.cadence_tick();
        self.log.append(LogChannel::Info, "Starting flight link");

        let running = Arc::clone(&self.running);
        let scheduler_thread = thread::Builder::new()
            .name("serial".to_string())
            .spawn(move || {
                scheduler.run(&running, scheduler_tick);
                scheduler
            })
            .map_err(|e| FlightError::Spawn("serial", e))?;

        let running = Arc::clone(&self.running);
        let cadence_thread = thread::Builder::new()
            .name("telemetry".to_string())
            .spawn(move || {
                cadence.run(&running, cadence_tick);
                cadence
            });
        let cadence_thread = match cadence_thread {
            Ok(handle) => handle,
            Err(e) => {
                self.stop();
                // Joined only to stop it cleanly; the spawn error is what matters.
                let _ = scheduler_thread.join();
                return Err(FlightError::Spawn("telemetry", e));
            }
        };

        let scheduler = scheduler_thread.join().map_err(|_| {
            self.stop();
            FlightError::WorkerPanicked("serial")
        })?;
        let cadence = cadence_thread
            .join()
            .map_err(|_| FlightError::WorkerPanicked("telemetry"))?;

        self.log.append(LogChannel::Info, "Flight link stopped");
        Ok(FlightReport {
            scheduler: scheduler.get_stats().clone(),
            cadence: cadence.get_stats().clone(),
            reconnection_cycles: scheduler.supervisor().cycles(),
            dropped_requests: self.link.lock().dropped_requests(),
        })
    }
}

impl std::fmt::Debug for FlightSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlightSystem")
            .field("system_name", &self.config.system_name)
            .field("ports", &self.ports)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
