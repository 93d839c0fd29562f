//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for the
//! measurement. Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with `ITDAQ_`, `__` separates keys)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! ITDAQ_APPLICATION__LOG_LEVEL=debug
//! ITDAQ_MEASUREMENT__BIAS_VOLTAGE=-600
//! ITDAQ_MEASUREMENT__OPERATOR="Jane Doe"
//! ```
//!
//! # Example
//!
//! ```no_run
//! use it_daq::config::Settings;
//!
//! let settings = Settings::load_from("config/it_daq.toml")?;
//! println!("Bias: {} V", settings.measurement.bias_voltage);
//! println!("Single compliance: {} A", settings.measurement.single_compliance());
//! # Ok::<(), it_daq::error::DaqError>(())
//! ```

use crate::error::{DaqError, DaqResult};
use crate::limits::{
    DEFAULT_RESOURCE_TIMEOUT, ENVIRONMENT_FAILURE_TIMEOUT, ENVIRONMENT_POLL_INTERVAL, SENSOR_COUNT,
};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Instrument resources by name
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceConfig>,
    /// Which resource plays which role
    #[serde(default)]
    pub instruments: InstrumentRoles,
    /// Measurement parameters
    #[serde(default)]
    pub measurement: MeasurementConfig,
    /// Source-measure unit settings
    #[serde(default)]
    pub smu: SmuConfig,
    /// Scanning multimeter settings
    #[serde(default)]
    pub dmm: DmmConfig,
    /// Climate chamber polling
    #[serde(default)]
    pub environment: EnvironmentConfig,
    /// Persisted sensor setup
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines
    #[serde(default)]
    pub log_json: bool,
}

/// Connection parameters of one instrument resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// `tcp://host:port` or `serial://port?baud=9600`
    pub address: String,
    /// Read/write timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Line terminator appended to commands
    #[serde(default = "default_termination")]
    pub termination: String,
}

impl ResourceConfig {
    /// Resource with default timeout and terminator.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout_ms: default_timeout_ms(),
            termination: default_termination(),
        }
    }

    /// Read/write timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Resource names of the four instrument roles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentRoles {
    /// Resource name of the source-measure unit
    #[serde(default = "default_smu_name")]
    pub smu: String,
    /// Resource name of the scanning multimeter
    #[serde(default = "default_dmm_name")]
    pub dmm: String,
    /// Resource name of the relay box
    #[serde(default = "default_relay_box_name")]
    pub relay_box: String,
    /// Resource name of the climate chamber
    #[serde(default = "default_chamber_name")]
    pub chamber: String,
}

/// Operator supplied measurement parameters.
///
/// Voltages in V, currents in A, times in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementConfig {
    /// Ramp-up target voltage
    pub end_voltage: f64,
    /// Ramp step size (magnitude, sign is chosen toward the target)
    pub voltage_step: f64,
    /// Settling delay after every ramp step
    pub waiting_time: f64,
    /// Long-term bias voltage
    pub bias_voltage: f64,
    /// SMU current compliance
    pub total_compliance: f64,
    /// Per-sensor current limit, never effective above `total_compliance`
    pub single_compliance: f64,
    /// Keep measuring while the SMU reports compliance
    #[serde(default)]
    pub continue_in_compliance: bool,
    /// Long-term duration, 0 runs until aborted
    #[serde(default)]
    pub duration: f64,
    /// Long-term sampling interval
    pub interval: f64,
    /// Directory receiving the log files
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
    /// Operator name written to every log file
    #[serde(default)]
    pub operator: String,
    /// Switch sensor HV relays and read PT100 channels through the relay box
    #[serde(default)]
    pub use_relay_box: bool,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            end_voltage: 800.0,
            voltage_step: 5.0,
            waiting_time: 1.0,
            bias_voltage: 600.0,
            total_compliance: 80e-6,
            single_compliance: 25e-6,
            continue_in_compliance: false,
            duration: 0.0,
            interval: 10.0,
            output_path: default_output_path(),
            operator: String::new(),
            use_relay_box: false,
        }
    }
}

impl MeasurementConfig {
    /// SMU compliance limit.
    pub fn total_compliance(&self) -> f64 {
        self.total_compliance.abs()
    }

    /// Effective per-sensor limit, clamped to the total compliance.
    pub fn single_compliance(&self) -> f64 {
        self.single_compliance.abs().min(self.total_compliance())
    }

    /// Settling delay after every ramp step.
    pub fn waiting_time(&self) -> Duration {
        Duration::from_secs_f64(self.waiting_time.max(0.0))
    }

    /// Long-term sampling interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval.max(0.0))
    }

    /// Long-term duration, `None` when unbounded.
    pub fn duration(&self) -> Option<Duration> {
        (self.duration > 0.0).then(|| Duration::from_secs_f64(self.duration))
    }

    /// Validate parameter ranges and the reachability of the bias voltage.
    ///
    /// The bias voltage must lie between 0 V and the end voltage (inclusive,
    /// same polarity). Ramp-to-bias then always moves back toward zero and
    /// never overshoots the ramp-up target.
    pub fn validate(&self) -> DaqResult<()> {
        let finite = [
            ("end_voltage", self.end_voltage),
            ("voltage_step", self.voltage_step),
            ("waiting_time", self.waiting_time),
            ("bias_voltage", self.bias_voltage),
            ("total_compliance", self.total_compliance),
            ("single_compliance", self.single_compliance),
            ("duration", self.duration),
            ("interval", self.interval),
        ];
        for (name, value) in finite {
            if !value.is_finite() {
                return Err(DaqError::Configuration(format!(
                    "measurement.{} must be a finite number, got {}",
                    name, value
                )));
            }
        }
        if self.voltage_step.abs() <= 0.0 {
            return Err(DaqError::Configuration(
                "measurement.voltage_step must be non-zero".into(),
            ));
        }
        if self.waiting_time < 0.0 || self.duration < 0.0 {
            return Err(DaqError::Configuration(
                "measurement.waiting_time and measurement.duration must not be negative".into(),
            ));
        }
        if self.interval <= 0.0 {
            return Err(DaqError::Configuration(
                "measurement.interval must be positive".into(),
            ));
        }
        if self.total_compliance() <= 0.0 || self.single_compliance.abs() <= 0.0 {
            return Err(DaqError::Configuration(
                "measurement compliances must be positive".into(),
            ));
        }
        let same_polarity = self.bias_voltage == 0.0
            || self.bias_voltage.signum() == self.end_voltage.signum();
        if !same_polarity || self.bias_voltage.abs() > self.end_voltage.abs() {
            return Err(DaqError::Configuration(format!(
                "measurement.bias_voltage {} V is not reachable by ramping back from end_voltage {} V",
                self.bias_voltage, self.end_voltage
            )));
        }
        Ok(())
    }
}

/// Averaging filter type shared by SMU and DMM
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    /// Average a fixed block of readings
    #[default]
    Repeat,
    /// Sliding average over the last readings
    Moving,
}

/// Averaging filter settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterConfig {
    /// Averaging on or off
    #[serde(default)]
    pub enable: bool,
    /// Averaging mode
    #[serde(default, rename = "type")]
    pub filter_type: FilterType,
    /// Readings per average, 1 to 100
    #[serde(default = "default_filter_count")]
    pub count: u32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enable: false,
            filter_type: FilterType::Repeat,
            count: default_filter_count(),
        }
    }
}

impl FilterConfig {
    fn validate(&self, owner: &str) -> DaqResult<()> {
        if !(1..=100).contains(&self.count) {
            return Err(DaqError::Configuration(format!(
                "{}.filter.count must be within 1..=100, got {}",
                owner, self.count
            )));
        }
        Ok(())
    }
}

/// SMU output terminals
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Terminals {
    /// Front panel jacks
    #[default]
    Front,
    /// Rear panel jacks
    Rear,
}

/// Source-measure unit settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmuConfig {
    /// Output terminals in use
    #[serde(default)]
    pub terminals: Terminals,
    /// Current averaging
    #[serde(default)]
    pub filter: FilterConfig,
}

/// Scanning multimeter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmmConfig {
    /// Voltage averaging
    #[serde(default)]
    pub filter: FilterConfig,
    /// Scanner card slot
    #[serde(default = "default_channel_slot")]
    pub channel_slot: u32,
    /// Offset added to the sensor index within the slot
    #[serde(default)]
    pub channel_offset: u32,
    /// Let the instrument choose the trigger delay
    #[serde(default = "default_true")]
    pub trigger_delay_auto: bool,
    /// Fixed trigger delay in seconds (used when auto is off)
    #[serde(default)]
    pub trigger_delay: f64,
}

impl Default for DmmConfig {
    fn default() -> Self {
        Self {
            filter: FilterConfig::default(),
            channel_slot: default_channel_slot(),
            channel_offset: 0,
            trigger_delay_auto: true,
            trigger_delay: 0.0,
        }
    }
}

impl DmmConfig {
    /// Scanner channel address of a sensor: `slot * 100 + offset + index`.
    pub fn channel_address(&self, index: u8) -> u32 {
        self.channel_slot * 100 + self.channel_offset + u32::from(index)
    }
}

/// Climate chamber polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Start the poller with the application
    #[serde(default)]
    pub enabled: bool,
    /// Seconds between two readouts
    #[serde(default = "default_environment_interval")]
    pub interval: f64,
    /// Seconds to back off after a failed readout
    #[serde(default = "default_environment_failure_timeout")]
    pub failure_timeout: f64,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_environment_interval(),
            failure_timeout: default_environment_failure_timeout(),
        }
    }
}

impl EnvironmentConfig {
    /// Polling period.
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval.max(0.0))
    }

    /// Back-off after a failed readout.
    pub fn failure_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.failure_timeout.max(0.0))
    }
}

/// Persisted state of one sensor slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Slot index, 1 based
    pub index: u8,
    /// Display name, defaults to `Unnamed<index>`
    #[serde(default)]
    pub name: Option<String>,
    /// Measured in the next run
    #[serde(default)]
    pub enabled: bool,
    /// Calibration resistance in Ohm
    #[serde(default = "default_resistivity")]
    pub resistivity: f64,
    /// Correction added to the PT100 temperature
    #[serde(default)]
    pub temperature_offset: f64,
    /// Display hint
    #[serde(default)]
    pub color: Option<String>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_RESOURCE_TIMEOUT.as_millis() as u64
}

fn default_termination() -> String {
    "\r\n".to_string()
}

fn default_smu_name() -> String {
    "smu".to_string()
}

fn default_dmm_name() -> String {
    "dmm".to_string()
}

fn default_relay_box_name() -> String {
    "relay_box".to_string()
}

fn default_chamber_name() -> String {
    "chamber".to_string()
}

fn default_output_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_filter_count() -> u32 {
    10
}

fn default_channel_slot() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_environment_interval() -> f64 {
    ENVIRONMENT_POLL_INTERVAL.as_secs_f64()
}

fn default_environment_failure_timeout() -> f64 {
    ENVIRONMENT_FAILURE_TIMEOUT.as_secs_f64()
}

fn default_resistivity() -> f64 {
    470_000.0
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

impl Default for InstrumentRoles {
    fn default() -> Self {
        Self {
            smu: default_smu_name(),
            dmm: default_dmm_name(),
            relay_box: default_relay_box_name(),
            chamber: default_chamber_name(),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from a TOML file and `ITDAQ_` environment variables.
    ///
    /// Environment variables take precedence over the file. The result is
    /// validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("ITDAQ_").split("__")),
        )
    }

    /// Extract and validate settings from an assembled figment.
    pub fn from_figment(figment: Figment) -> DaqResult<Self> {
        let settings: Self = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Resources for every used instrument role exist
    /// - Measurement parameters are in range
    /// - Filter counts are within 1..=100
    /// - Sensor indices are unique and within 1..=10, resistivities positive
    pub fn validate(&self) -> DaqResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let mut required = vec![&self.instruments.smu, &self.instruments.dmm];
        if self.measurement.use_relay_box {
            required.push(&self.instruments.relay_box);
        }
        if self.environment.enabled {
            required.push(&self.instruments.chamber);
        }
        for name in required {
            if !self.resources.contains_key(name) {
                return Err(DaqError::Configuration(format!(
                    "No [resources.{}] section for a required instrument",
                    name
                )));
            }
        }

        self.measurement.validate()?;
        self.smu.filter.validate("smu")?;
        self.dmm.filter.validate("dmm")?;
        if self.dmm.trigger_delay < 0.0 {
            return Err(DaqError::Configuration(
                "dmm.trigger_delay must not be negative".into(),
            ));
        }
        if self.environment.interval <= 0.0 {
            return Err(DaqError::Configuration(
                "environment.interval must be positive".into(),
            ));
        }

        let mut indices = HashSet::new();
        for sensor in &self.sensors {
            if sensor.index == 0 || usize::from(sensor.index) > SENSOR_COUNT {
                return Err(DaqError::Configuration(format!(
                    "Sensor index {} out of range 1..={}",
                    sensor.index, SENSOR_COUNT
                )));
            }
            if !indices.insert(sensor.index) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate sensor index: {}",
                    sensor.index
                )));
            }
            if !(sensor.resistivity > 0.0) {
                return Err(DaqError::Configuration(format!(
                    "Sensor {} resistivity must be positive",
                    sensor.index
                )));
            }
        }

        Ok(())
    }
}
