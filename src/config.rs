use crate::cadence::CadenceSettings;
use crate::codec::{FieldDescriptor, PackingMode, Schema, SchemaError};
use crate::ports::{LineSettings, FALSE_POSITIVE_PORT};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid field schema: {0}")]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlightConfig {
    pub system_name: String,
    pub serial_communication: SerialConfig,
    pub telemetry: TelemetryConfig,
    pub acquisition: AcquisitionConfig,
    pub logging: LoggingConfig,
    pub packing: PackingMode,
    pub schema: Vec<FieldDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub default_baud_rate: u32,
    /// Seconds, bounds each read and write.
    pub default_timeout: f64,
    /// Seconds of backoff before the reset pulse; the pulse holds half of it.
    pub reconnection_wait: f64,
    /// Scheduler tick, seconds.
    pub main_delay: f64,
    /// BCM numbering. `None` runs without a reset line.
    pub arduino_reset_pin: Option<u32>,
    pub excluded_ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub data_downlink_delay: f64,
    pub buffering_delay: f64,
    /// Cadence tick, seconds.
    pub main_delay: f64,
    pub enable_telemetry: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub enabled: bool,
    /// Seconds between `DATA` requests.
    pub data_poll_delay: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub directory: PathBuf,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            system_name: "MajorTom".to_string(),
            serial_communication: SerialConfig::default(),
            telemetry: TelemetryConfig::default(),
            acquisition: AcquisitionConfig::default(),
            logging: LoggingConfig::default(),
            packing: PackingMode::default(),
            schema: default_schema(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            default_baud_rate: 9600,
            default_timeout: 8.0,
            reconnection_wait: 5.0,
            main_delay: 0.5,
            arduino_reset_pin: Some(23),
            excluded_ports: vec![FALSE_POSITIVE_PORT.to_string()],
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            data_downlink_delay: 9.0,
            buffering_delay: 0.05,
            main_delay: 0.5,
            enable_telemetry: true,
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_poll_delay: 1.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
        }
    }
}

/// The balloon payload's measurement line: timestamp, then the controller's
/// sensors in the order it reports them.
fn default_schema() -> Vec<FieldDescriptor> {
    vec![
        FieldDescriptor::new("time", 0.0, 0, 17, 0.0),
        FieldDescriptor::new("pressure_kpa", 100.0, 0, 14, 0.0),
        FieldDescriptor::new("temp_internal_c", 10.0, 0, 10, 50.0),
        FieldDescriptor::new("temp_external_c", 10.0, 0, 11, 100.0),
        FieldDescriptor::new("humidity_pct", 10.0, 0, 10, 0.0),
        FieldDescriptor::new("accel_x_g", -100.0, 0, 12, 0.0),
        FieldDescriptor::new("accel_y_g", -100.0, 0, 12, 0.0),
        FieldDescriptor::new("accel_z_g", -100.0, 0, 12, 0.0),
        FieldDescriptor::new("gps_lat", -10000.0, 0, 22, 0.0),
        FieldDescriptor::new("gps_lon", -10000.0, 0, 23, 0.0),
        FieldDescriptor::new("gps_alt_m", 1.0, 0, 16, 0.0),
        FieldDescriptor::new("battery_v", 100.0, 0, 10, 0.0),
        FieldDescriptor::new("status", 0.0, 0, 0, 0.0),
    ]
}

impl FlightConfig {
    /// Read and parse `path`. The schema is validated too, so a config that
    /// loads can always build a codec.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// `path` when given, built-in defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: FlightConfig = toml::from_str(text)?;
        config.schema()?;
        Ok(config)
    }

    pub fn schema(&self) -> Result<Schema, SchemaError> {
        Schema::new(self.schema.clone())
    }

    pub fn line_settings(&self) -> LineSettings {
        LineSettings::new(
            self.serial_communication.default_baud_rate,
            seconds(self.serial_communication.default_timeout),
        )
    }

    pub fn reconnection_wait(&self) -> Duration {
        seconds(self.serial_communication.reconnection_wait)
    }

    pub fn scheduler_tick(&self) -> Duration {
        seconds(self.serial_communication.main_delay)
    }

    pub fn cadence_tick(&self) -> Duration {
        seconds(self.telemetry.main_delay)
    }

    pub fn data_poll_interval(&self) -> Duration {
        seconds(self.acquisition.data_poll_delay)
    }

    pub fn cadence_settings(&self) -> CadenceSettings {
        CadenceSettings {
            downlink_interval: seconds(self.telemetry.data_downlink_delay),
            buffering_delay: seconds(self.telemetry.buffering_delay),
            enabled: self.telemetry.enable_telemetry,
        }
    }
}

/// Out-of-range values clamp instead of panicking.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = FlightConfig::from_toml("").unwrap();
        assert_eq!(config, FlightConfig::default());
        assert_eq!(config.line_settings().baud_rate, 9600);
        assert_eq!(config.line_settings().timeout, Duration::from_secs(8));
        assert_eq!(config.reconnection_wait(), Duration::from_secs(5));
        assert_eq!(config.cadence_settings().downlink_interval, Duration::from_secs(9));
        assert_eq!(config.serial_communication.excluded_ports, vec!["/dev/ttyAMA0".to_string()]);
        assert!(config.schema().is_ok());
    }

    #[test]
    fn test_partial_sections_override() {
        let config = FlightConfig::from_toml(
            r#"
            system_name = "Bowie"

            [serial_communication]
            default_baud_rate = 115200
            reconnection_wait = 0.25

            [telemetry]
            enable_telemetry = false
            "#,
        )
        .unwrap();

        assert_eq!(config.system_name, "Bowie");
        assert_eq!(config.serial_communication.default_baud_rate, 115_200);
        assert_eq!(config.reconnection_wait(), Duration::from_millis(250));
        assert_eq!(config.serial_communication.main_delay, 0.5);
        assert!(!config.cadence_settings().enabled);
    }

    #[test]
    fn test_schema_table() {
        let config = FlightConfig::from_toml(
            r#"
            [[schema]]
            name = "time"
            multiplier = 0
            bits = 17

            [[schema]]
            name = "pressure"
            multiplier = 10
            digits = 0
            bits = 16
            offset = 0
            "#,
        )
        .unwrap();

        let schema = config.schema().unwrap();
        assert_eq!(schema.len(), 2);
        assert_eq!(schema.frame_len(PackingMode::Bitwise), 5);
    }

    #[test]
    fn test_malformed_schema_rejected_at_load() {
        let result = FlightConfig::from_toml(
            r#"
            [[schema]]
            name = "time"
            multiplier = 0
            bits = 17

            [[schema]]
            name = "pressure"
            multiplier = 0
            bits = 16
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Schema(_))));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            FlightConfig::from_toml("[telemetry]\nmain_delay = \"fast\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_seconds_clamps() {
        assert_eq!(seconds(-1.0), Duration::ZERO);
        assert_eq!(seconds(f64::INFINITY), Duration::MAX);
    }
}
