//! Configuration system using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, see `config/default.toml`)
//! 2. Environment variables (prefixed with `SPECDAQ_`, nested keys separated by `__`)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! SPECDAQ_LOGGING__LEVEL=debug
//! SPECDAQ_MECH__ADDRESS=10.25.1.140
//! SPECDAQ_ALERTS__INTERVAL_MS=30000
//! ```
//!
//! # Example
//!
//! ```no_run
//! use spectro_daq::config::Settings;
//!
//! let settings = Settings::load_from("config/default.toml")?;
//! println!("Mech at {}:{}", settings.mech.address, settings.mech.port);
//! # Ok::<(), spectro_daq::error::DaqError>(())
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};
use crate::header::{schema, KeywordDefinition};
use crate::motion::MotorId;
use crate::storage::ChecksumAlgorithm;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Logging output
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Mech controller connection
    pub mech: MechConfig,
    /// Collimator motor calibration
    pub motors: MotorsConfig,
    /// Exposure phase deadlines
    #[serde(default)]
    pub exposure: ExposureConfig,
    /// Health alert thresholds
    pub alerts: AlertsConfig,
    /// Data file output
    pub output: OutputConfig,
    /// Configured header keywords
    #[serde(default)]
    pub header: HeaderConfig,
    /// CCD controllers and the detectors they read out
    pub controllers: Vec<ControllerConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Mech controller connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MechConfig {
    /// Host name or IP of the mech controller
    pub address: String,
    /// TCP port
    #[serde(default = "default_mech_port")]
    pub port: u16,
    /// Default per-command reply timeout in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
    /// Connection (and reconnection) timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Maximum wait for the single-writer slot in milliseconds
    #[serde(default = "default_lease_timeout")]
    pub lease_timeout_ms: u64,
    /// Path of the durable exchange log. No log is written when unset.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Interval between mech clock synchronisations in seconds
    #[serde(default = "default_clock_sync_interval")]
    pub clock_sync_interval_secs: u64,
    /// Retry interval after a failed clock synchronisation in seconds
    #[serde(default = "default_clock_retry")]
    pub clock_retry_secs: u64,
}

impl MechConfig {
    /// Default per-command reply timeout
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Connection timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Single-writer slot acquisition timeout
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }
}

/// Calibration of one collimator motor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorCalibration {
    /// Lowest accepted raw position
    pub min_raw: i64,
    /// Highest accepted raw position
    pub max_raw: i64,
    /// Physical position at `min_raw`
    pub min_microns: f64,
    /// Physical position at `max_raw`
    pub max_microns: f64,
    /// Home/center raw position
    pub center_raw: i64,
}

/// Calibration of the three collimator motors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotorsConfig {
    /// Motor A
    pub a: MotorCalibration,
    /// Motor B
    pub b: MotorCalibration,
    /// Motor C
    pub c: MotorCalibration,
    /// Reply timeout for move commands in milliseconds
    #[serde(default = "default_move_timeout")]
    pub move_timeout_ms: u64,
}

impl MotorsConfig {
    /// Calibration for one motor
    pub fn calibration(&self, motor: MotorId) -> &MotorCalibration {
        match motor {
            MotorId::A => &self.a,
            MotorId::B => &self.b,
            MotorId::C => &self.c,
        }
    }

    /// Reply timeout for move commands
    pub fn move_timeout(&self) -> Duration {
        Duration::from_millis(self.move_timeout_ms)
    }
}

/// Exposure phase deadlines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureConfig {
    /// Flush deadline in milliseconds
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout_ms: u64,
    /// Purge deadline in milliseconds
    #[serde(default = "default_purge_timeout")]
    pub purge_timeout_ms: u64,
    /// Deadline for the controller to start integrating, in milliseconds
    #[serde(default = "default_integration_start_timeout")]
    pub integration_start_timeout_ms: u64,
    /// Readout soft deadline in milliseconds (warning when exceeded)
    #[serde(default = "default_readout_expected")]
    pub readout_expected_ms: u64,
    /// Readout hard deadline in milliseconds (fatal when exceeded)
    #[serde(default = "default_readout_max")]
    pub readout_max_ms: u64,
    /// Fetch soft deadline in milliseconds
    #[serde(default = "default_fetch_expected")]
    pub fetch_expected_ms: u64,
    /// Fetch hard deadline in milliseconds
    #[serde(default = "default_fetch_max")]
    pub fetch_max_ms: u64,
    /// Shutter and Hartmann door acknowledgement timeout in milliseconds
    #[serde(default = "default_shutter_timeout")]
    pub shutter_timeout_ms: u64,
    /// Poll interval for door state and readout completion in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Timeout for each housekeeping query in milliseconds
    #[serde(default = "default_housekeeping_timeout")]
    pub housekeeping_timeout_ms: u64,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            flush_timeout_ms: default_flush_timeout(),
            purge_timeout_ms: default_purge_timeout(),
            integration_start_timeout_ms: default_integration_start_timeout(),
            readout_expected_ms: default_readout_expected(),
            readout_max_ms: default_readout_max(),
            fetch_expected_ms: default_fetch_expected(),
            fetch_max_ms: default_fetch_max(),
            shutter_timeout_ms: default_shutter_timeout(),
            poll_interval_ms: default_poll_interval(),
            housekeeping_timeout_ms: default_housekeeping_timeout(),
        }
    }
}

impl ExposureConfig {
    /// Flush deadline
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Purge deadline
    pub fn purge_timeout(&self) -> Duration {
        Duration::from_millis(self.purge_timeout_ms)
    }

    /// Integration start deadline
    pub fn integration_start_timeout(&self) -> Duration {
        Duration::from_millis(self.integration_start_timeout_ms)
    }

    /// Readout (soft, hard) deadlines
    pub fn readout_deadlines(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.readout_expected_ms),
            Duration::from_millis(self.readout_max_ms),
        )
    }

    /// Fetch (soft, hard) deadlines
    pub fn fetch_deadlines(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.fetch_expected_ms),
            Duration::from_millis(self.fetch_max_ms),
        )
    }

    /// Door acknowledgement timeout
    pub fn shutter_timeout(&self) -> Duration {
        Duration::from_millis(self.shutter_timeout_ms)
    }

    /// Poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Housekeeping query timeout
    pub fn housekeeping_timeout(&self) -> Duration {
        Duration::from_millis(self.housekeeping_timeout_ms)
    }
}

/// Where a CCD temperature setpoint comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SetpointSource {
    /// A fixed temperature
    Fixed(f64),
    /// A parameter name in the controller configuration
    Parameter(String),
}

/// Alerted quantities of one detector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorAlertConfig {
    /// Controller that reads out the detector
    pub controller: String,
    /// Detector name (e.g. `r2`)
    pub detector: String,
    /// Status key of the CCD temperature
    pub ccd_status_param: String,
    /// Status key of the cryogen can temperature
    pub ln2_status_param: String,
    /// CCD temperature setpoint
    pub setpoint: SetpointSource,
}

/// An enumerated vent or thermistor state reported by the mech
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VentAlertConfig {
    /// Alert name
    pub name: String,
    /// Field of the `LN2` sentence (e.g. `red_vent`)
    pub field: String,
    /// States that raise the alert
    pub bad_states: Vec<String>,
}

/// Health alert configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Polling interval in milliseconds
    #[serde(default = "default_alert_interval")]
    pub interval_ms: u64,
    /// Staleness window for the heartbeat alerts in milliseconds
    #[serde(default = "default_staleness")]
    pub staleness_ms: u64,
    /// Consecutive out-of-bounds (or in-bounds) readings needed to change a temperature alert
    #[serde(default = "default_consecutive_readings")]
    pub consecutive_readings: usize,
    /// Allowed CCD temperature excess over the setpoint
    pub ccd_temperature_max_increase: f64,
    /// Cryogen can base temperature
    pub ln2_base_temperature: f64,
    /// Allowed cryogen can temperature excess over the base temperature
    pub ln2_temperature_max_increase: f64,
    /// Monitored detectors
    #[serde(default)]
    pub detectors: Vec<DetectorAlertConfig>,
    /// Monitored vents and thermistors
    #[serde(default)]
    pub vents: Vec<VentAlertConfig>,
}

impl AlertsConfig {
    /// Polling interval
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Staleness window
    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.staleness_ms)
    }
}

/// Data file output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Root directory for data and the exposure counter
    pub data_dir: PathBuf,
    /// Directory template relative to `data_dir`
    #[serde(default = "default_path_template")]
    pub path_template: String,
    /// File name template
    #[serde(default = "default_file_template")]
    pub file_template: String,
    /// Digest algorithm of the checksum sidecar
    #[serde(default)]
    pub checksum: ChecksumAlgorithm,
    /// Name of the exposure counter file inside `data_dir`
    #[serde(default = "default_counter_file")]
    pub counter_file: String,
}

/// Configured header keywords
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderConfig {
    /// Keywords appended after the core and housekeeping cards
    #[serde(default)]
    pub keywords: Vec<KeywordDefinition>,
}

/// One CCD controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Controller name (e.g. `sp2`)
    pub name: String,
    /// Detectors read out by the controller
    pub detectors: Vec<String>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_mech_port() -> u16 {
    23
}

fn default_command_timeout() -> u64 {
    5000
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_lease_timeout() -> u64 {
    2000
}

fn default_clock_sync_interval() -> u64 {
    86_400
}

fn default_clock_retry() -> u64 {
    60
}

fn default_move_timeout() -> u64 {
    10_000
}

fn default_flush_timeout() -> u64 {
    20_000
}

fn default_purge_timeout() -> u64 {
    10_000
}

fn default_integration_start_timeout() -> u64 {
    5000
}

fn default_readout_expected() -> u64 {
    40_000
}

fn default_readout_max() -> u64 {
    60_000
}

fn default_fetch_expected() -> u64 {
    5000
}

fn default_fetch_max() -> u64 {
    10_000
}

fn default_shutter_timeout() -> u64 {
    5000
}

fn default_poll_interval() -> u64 {
    250
}

fn default_housekeeping_timeout() -> u64 {
    3000
}

fn default_alert_interval() -> u64 {
    60_000
}

fn default_staleness() -> u64 {
    180_000
}

fn default_consecutive_readings() -> usize {
    1
}

fn default_path_template() -> String {
    "{mjd}".to_string()
}

fn default_file_template() -> String {
    "sdR-{ccd}-{exposure_no:0>8}.fit".to_string()
}

fn default_counter_file() -> String {
    "nextExposureNumber".to_string()
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from a TOML file and `SPECDAQ_` environment variables
    ///
    /// Environment variables take precedence over the file. The merged
    /// configuration is validated before it is returned.
    ///
    /// # Errors
    ///
    /// Returns `DaqError::Config` if the file cannot be loaded or deserialized and
    /// `DaqError::Configuration` if validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SPECDAQ_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse configuration from a TOML string (no environment overrides)
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let settings: Self = Figment::new().merge(Toml::string(toml)).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid
    /// - Motor calibrations are ordered and the center lies within bounds
    /// - Soft deadlines do not exceed hard deadlines
    /// - Polling intervals are non-zero
    /// - Output templates are non-empty
    /// - Controller names are unique and alerts reference known controllers/detectors
    /// - Every configured header keyword is part of the header schema
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.mech.address.is_empty() {
            return Err(DaqError::Configuration(
                "mech.address cannot be empty".to_string(),
            ));
        }

        for motor in MotorId::ALL {
            let cal = self.motors.calibration(motor);
            if cal.min_raw < 0 {
                return Err(DaqError::Configuration(format!(
                    "Motor {motor}: min_raw {} must be non-negative",
                    cal.min_raw
                )));
            }
            if cal.min_raw >= cal.max_raw {
                return Err(DaqError::Configuration(format!(
                    "Motor {motor}: min_raw {} must be below max_raw {}",
                    cal.min_raw, cal.max_raw
                )));
            }
            if cal.min_microns == cal.max_microns {
                return Err(DaqError::Configuration(format!(
                    "Motor {motor}: min_microns and max_microns must differ"
                )));
            }
            if cal.center_raw < cal.min_raw || cal.center_raw > cal.max_raw {
                return Err(DaqError::Configuration(format!(
                    "Motor {motor}: center_raw {} outside [{}, {}]",
                    cal.center_raw, cal.min_raw, cal.max_raw
                )));
            }
        }

        let exposure = &self.exposure;
        if exposure.readout_expected_ms > exposure.readout_max_ms {
            return Err(DaqError::Configuration(
                "exposure.readout_expected_ms exceeds readout_max_ms".to_string(),
            ));
        }
        if exposure.fetch_expected_ms > exposure.fetch_max_ms {
            return Err(DaqError::Configuration(
                "exposure.fetch_expected_ms exceeds fetch_max_ms".to_string(),
            ));
        }
        if exposure.poll_interval_ms == 0 || self.alerts.interval_ms == 0 {
            return Err(DaqError::Configuration(
                "Polling intervals must be greater than zero".to_string(),
            ));
        }
        if self.alerts.consecutive_readings == 0 {
            return Err(DaqError::Configuration(
                "alerts.consecutive_readings must be at least 1".to_string(),
            ));
        }

        if self.output.file_template.trim().is_empty() {
            return Err(DaqError::Configuration(
                "output.file_template cannot be empty".to_string(),
            ));
        }
        if self.output.counter_file.trim().is_empty() {
            return Err(DaqError::Configuration(
                "output.counter_file cannot be empty".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for controller in &self.controllers {
            if !names.insert(controller.name.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate controller name: '{}'",
                    controller.name
                )));
            }
            if controller.detectors.is_empty() {
                return Err(DaqError::Configuration(format!(
                    "Controller '{}' has no detectors",
                    controller.name
                )));
            }
        }

        for detector in &self.alerts.detectors {
            let known = self
                .controllers
                .iter()
                .find(|c| c.name == detector.controller)
                .map(|c| c.detectors.contains(&detector.detector))
                .unwrap_or(false);
            if !known {
                return Err(DaqError::Configuration(format!(
                    "Alert detector '{}' is not read out by controller '{}'",
                    detector.detector, detector.controller
                )));
            }
        }

        schema::validate_definitions(&self.header.keywords)
    }

    /// Look up a controller by name
    pub fn controller(&self, name: &str) -> Option<&ControllerConfig> {
        self.controllers.iter().find(|c| c.name == name)
    }
}
