//! # PiTS flight link
//!
//! Serial link and telemetry core for a balloon payload flight computer. The
//! flight computer talks to one or more payload microcontrollers over
//! half-duplex serial lines, records what they report, polls them for uplinked
//! commands, and periodically downlinks a compact bit-packed frame of the
//! newest measurement.
//!
//! ## Features
//!
//! - **Port discovery**: platform candidate enumeration, probing and exclusion
//! - **Call-and-response scheduling**: one request in flight, strict ordering
//! - **Self-healing link**: fixed backoff, hardware reset pulse, queue flush
//! - **Telemetry codec**: schema-driven bit packing with quantization and wrap
//! - **Uplink mailbox**: single-slot command store shared with flight control
//! - **Bench mode**: simulated serial devices with fault injection
//!
//! ## Quick Start
//!
//! ```rust
//! use pits::codec::{FieldDescriptor, Schema, TelemetryCodec};
//!
//! let schema = Schema::new(vec![
//!     FieldDescriptor::new("time", 0.0, 0, 17, 0.0),
//!     FieldDescriptor::new("pressure", 10.0, 0, 16, 0.0),
//! ])?;
//! let codec = TelemetryCodec::new(schema);
//!
//! let frame = codec.encode("20180702_08:32:39.021639,101.3")?;
//! assert_eq!(frame.len(), 5);
//!
//! let rebuilt = codec.decode(&frame)?;
//! assert_eq!(rebuilt.value("pressure"), Some(101.3));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - [`ports`] - Serial port discovery and the hardware seams
//! - [`scheduler`] - Call-and-response request scheduler
//! - [`reconnect`] - Link recovery and the reset line
//! - [`cadence`] - Uplink polling and downlink pacing
//! - [`codec`] - Telemetry frame packing
//! - [`uplink`] - Uplink command store
//! - [`flight`] - Composition root that runs both workers
//! - [`config`], [`logbook`], [`capabilities`], [`sim`] - Support

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::missing_errors_doc)]

pub mod cadence;
pub mod capabilities;
pub mod codec;
pub mod config;
pub mod flight;
pub mod logbook;
pub mod ports;
pub mod reconnect;
pub mod scheduler;
pub mod sim;
pub mod uplink;

// Re-export main public types for convenience
pub use cadence::DownlinkCadenceController;
pub use codec::TelemetryCodec;
pub use config::FlightConfig;
pub use flight::FlightSystem;
pub use ports::PortRegistry;
pub use reconnect::ReconnectionSupervisor;
pub use scheduler::DuplexScheduler;
pub use uplink::UplinkCommandStore;
