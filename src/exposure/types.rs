//! Exposure requests, phases and state snapshots.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppResult, DaqError};
use crate::mech::Door;

/// Phase of the exposure state machine.
///
/// `IDLE → PREPARING → INTEGRATING → READING → FETCHING → WRITING → IDLE`, with
/// `ABORTED` and `FAILED` reachable from every non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExposurePhase {
    /// No exposure running
    Idle,
    /// Configuring, flushing and purging the detectors
    Preparing,
    /// Shutter sequence and integration timer
    Integrating,
    /// Detector readout
    Reading,
    /// Pixel transfer
    Fetching,
    /// Header assembly, file write and checksum
    Writing,
    /// Stopped on request
    Aborted,
    /// Stopped by a fatal error
    Failed,
}

impl ExposurePhase {
    /// Upper-case name used in logs and status output.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExposurePhase::Idle => "IDLE",
            ExposurePhase::Preparing => "PREPARING",
            ExposurePhase::Integrating => "INTEGRATING",
            ExposurePhase::Reading => "READING",
            ExposurePhase::Fetching => "FETCHING",
            ExposurePhase::Writing => "WRITING",
            ExposurePhase::Aborted => "ABORTED",
            ExposurePhase::Failed => "FAILED",
        }
    }

    /// Whether an exposure in this phase is still running.
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            ExposurePhase::Idle | ExposurePhase::Aborted | ExposurePhase::Failed
        )
    }
}

impl fmt::Display for ExposurePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureFlavour {
    /// Zero-second readout
    Bias,
    /// Shutter closed
    Dark,
    /// On-sky science exposure
    Object,
    /// Flat-field lamp
    Flat,
    /// Arc lamp
    Arc,
}

impl ExposureFlavour {
    /// Lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExposureFlavour::Bias => "bias",
            ExposureFlavour::Dark => "dark",
            ExposureFlavour::Object => "object",
            ExposureFlavour::Flat => "flat",
            ExposureFlavour::Arc => "arc",
        }
    }

    /// Value of the `FLAVOR` header card.
    pub fn header_value(&self) -> &'static str {
        match self {
            ExposureFlavour::Object => "science",
            other => other.as_str(),
        }
    }

    /// Whether this flavour ever opens the shutter.
    pub fn uses_shutter(&self) -> bool {
        !matches!(self, ExposureFlavour::Bias | ExposureFlavour::Dark)
    }
}

impl fmt::Display for ExposureFlavour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExposureFlavour {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bias" => Ok(ExposureFlavour::Bias),
            "dark" => Ok(ExposureFlavour::Dark),
            "object" | "science" => Ok(ExposureFlavour::Object),
            "flat" => Ok(ExposureFlavour::Flat),
            "arc" => Ok(ExposureFlavour::Arc),
            other => Err(DaqError::Configuration(format!(
                "Unknown exposure flavour '{other}'"
            ))),
        }
    }
}

/// Readout window.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum WindowMode {
    /// Full frame
    #[default]
    Full,
    /// Named reduced window
    Reduced {
        /// Window name (e.g. `hartmann`)
        name: String,
        /// Rows read out
        lines: u32,
        /// Columns read out
        pixels: u32,
        /// Rows skipped before the window
        preskip_lines: u32,
    },
}

impl WindowMode {
    /// Value of the `WINMODE` header card.
    pub fn name(&self) -> &str {
        match self {
            WindowMode::Full => "full",
            WindowMode::Reduced { name, .. } => name,
        }
    }

    /// Reduced windows flush binned.
    pub fn is_reduced(&self) -> bool {
        matches!(self, WindowMode::Reduced { .. })
    }
}

/// Which Hartmann door covers half of the beam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HartmannSide {
    /// Close the left door
    Left,
    /// Close the right door
    Right,
}

impl HartmannSide {
    /// Door closed during the exposure.
    pub fn closed_door(&self) -> Door {
        match self {
            HartmannSide::Left => Door::Left,
            HartmannSide::Right => Door::Right,
        }
    }

    /// Door kept open during the exposure.
    pub fn open_door(&self) -> Door {
        match self {
            HartmannSide::Left => Door::Right,
            HartmannSide::Right => Door::Left,
        }
    }
}

/// An exposure to take. Immutable once accepted by the sequencer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureRequest {
    /// Controller that reads out the detectors
    pub controller: String,
    /// Detectors to write. Empty means every detector of the controller.
    #[serde(default)]
    pub detectors: Vec<String>,
    /// Integration time
    pub exposure_time: Duration,
    /// Flavour
    pub flavour: ExposureFlavour,
    /// Readout window
    #[serde(default)]
    pub window: WindowMode,
    /// Hartmann door to close, for Hartmann exposures
    #[serde(default)]
    pub hartmann: Option<HartmannSide>,
    /// File name template overriding the configured one
    #[serde(default)]
    pub file_template: Option<String>,
}

impl ExposureRequest {
    /// Full-frame exposure of every detector of `controller`.
    pub fn new(controller: &str, flavour: ExposureFlavour, exposure_time: Duration) -> Self {
        Self {
            controller: controller.to_string(),
            detectors: Vec::new(),
            exposure_time,
            flavour,
            window: WindowMode::Full,
            hartmann: None,
            file_template: None,
        }
    }

    /// Restrict the exposure to some detectors.
    pub fn with_detectors(mut self, detectors: &[&str]) -> Self {
        self.detectors = detectors.iter().map(|d| d.to_string()).collect();
        self
    }

    /// Read out a reduced window.
    pub fn with_window(mut self, window: WindowMode) -> Self {
        self.window = window;
        self
    }

    /// Make this a Hartmann exposure.
    pub fn with_hartmann(mut self, side: HartmannSide) -> Self {
        self.hartmann = Some(side);
        self
    }

    /// Override the file name template.
    pub fn with_file_template(mut self, template: &str) -> Self {
        self.file_template = Some(template.to_string());
        self
    }

    /// Whether the shutter opens during this exposure.
    pub fn opens_shutter(&self) -> bool {
        self.flavour.uses_shutter() && !self.exposure_time.is_zero()
    }

    /// Reject inconsistent requests before anything moves.
    pub fn validate(&self) -> AppResult<()> {
        if self.hartmann.is_some() && !self.opens_shutter() {
            return Err(DaqError::Configuration(format!(
                "A Hartmann exposure must open the shutter ({} exposure of {:?} requested)",
                self.flavour, self.exposure_time
            )));
        }
        if self.flavour == ExposureFlavour::Bias && !self.exposure_time.is_zero() {
            return Err(DaqError::Configuration(
                "Bias exposures have zero exposure time".to_string(),
            ));
        }
        Ok(())
    }
}

/// How an exposure ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExposureResult {
    /// Every file written
    Success,
    /// Stopped by `abort`
    Aborted,
    /// Fatal error, with its description
    Failed(String),
}

/// One written data file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrittenFile {
    /// Detector
    pub detector: String,
    /// Data file
    pub path: PathBuf,
    /// Checksum sidecar
    pub checksum_path: PathBuf,
    /// Hex digest of the data file
    pub digest: String,
}

/// Summary of a finished exposure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureOutcome {
    /// Exposure number
    pub exposure_no: u32,
    /// Files written, one per detector
    pub files: Vec<WrittenFile>,
    /// Non-fatal problems (late phases, unacknowledged doors, missing housekeeping)
    pub warnings: Vec<String>,
}

/// Snapshot of the exposure state of one controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureState {
    /// Unique id of this exposure attempt
    pub id: Uuid,
    /// Request being executed
    pub request: ExposureRequest,
    /// Exposure number reserved on accept
    pub exposure_no: u32,
    /// Current phase
    pub phase: ExposurePhase,
    /// When the current phase started
    pub phase_started: DateTime<Utc>,
    /// Hard deadline of the current phase, if it has one
    pub deadline: Option<DateTime<Utc>>,
    /// Last phase that completed successfully
    pub checkpoint: Option<ExposurePhase>,
    /// Non-fatal problems so far
    pub warnings: Vec<String>,
    /// Set once the exposure has ended
    pub result: Option<ExposureResult>,
    /// Files written so far
    pub files: Vec<WrittenFile>,
    /// Shutter open time
    pub integration_started: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutter_policy() {
        let dark = ExposureRequest::new("sp2", ExposureFlavour::Dark, Duration::from_secs(900));
        assert!(!dark.opens_shutter());

        let zero = ExposureRequest::new("sp2", ExposureFlavour::Object, Duration::ZERO);
        assert!(!zero.opens_shutter());

        let arc = ExposureRequest::new("sp2", ExposureFlavour::Arc, Duration::from_secs(4));
        assert!(arc.opens_shutter());
    }

    #[test]
    fn test_hartmann_requires_open_shutter() {
        let request = ExposureRequest::new("sp2", ExposureFlavour::Dark, Duration::from_secs(4))
            .with_hartmann(HartmannSide::Left);
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_flavour_header_value() {
        assert_eq!(ExposureFlavour::Object.header_value(), "science");
        assert_eq!("science".parse::<ExposureFlavour>().unwrap(), ExposureFlavour::Object);
        assert_eq!(ExposureFlavour::Arc.header_value(), "arc");
    }

    #[test]
    fn test_state_serializes_for_status_reports() {
        let state = ExposureState {
            id: Uuid::new_v4(),
            request: ExposureRequest::new("sp2", ExposureFlavour::Flat, Duration::from_secs(30)),
            exposure_no: 12,
            phase: ExposurePhase::Integrating,
            phase_started: Utc::now(),
            deadline: None,
            checkpoint: Some(ExposurePhase::Preparing),
            warnings: vec![],
            result: None,
            files: vec![],
            integration_started: None,
        };

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["phase"], "INTEGRATING");
        assert_eq!(json["checkpoint"], "PREPARING");
        assert_eq!(json["request"]["flavour"], "flat");
        assert_eq!(json["request"]["window"]["mode"], "full");
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(ExposurePhase::Integrating.to_string(), "INTEGRATING");
        assert!(ExposurePhase::Writing.is_active());
        assert!(!ExposurePhase::Failed.is_active());
    }
}
