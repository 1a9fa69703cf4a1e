//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures that can occur while driving the spectrograph.
//!
//! ## Error Hierarchy
//!
//! `DaqError` groups its variants by the layer that raises them:
//!
//! - **Mech transport** (`LinkTimeout`, `LinkDisconnected`, `Protocol`, `MechReported`,
//!   `MechRebooted`): raised by the mech link. They are surfaced to the caller
//!   immediately and never retried silently.
//! - **Motion safety** (`OutOfRange`, `UnsafeCompoundMove`, `MotorBusy`): raised by the
//!   motor controller *before* anything is written to the link.
//! - **Sequencing** (`ExposureInProgress`, `ReadoutTimeout`, `FetchTimeout`,
//!   `ExposureFailed`, `ExposureAborted`): raised by the exposure sequencer.
//!   `ExposureFailed` always carries the phase in which the failure happened and the
//!   last phase that completed successfully.
//! - **Housekeeping** (`Housekeeping`): per-field failures while collecting header
//!   telemetry. They are logged and the field is omitted; they never fail an exposure.
//! - **Configuration** (`Config`, `Configuration`): load and validation errors.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying I/O, figment
//! and `fitsio` errors, so the `?` operator works throughout the crate.

use std::time::Duration;

use thiserror::Error;

use crate::exposure::ExposurePhase;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type of the crate.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FITS error: {0}")]
    Fits(#[from] fitsio::errors::Error),

    #[error("Mech link timed out after {timeout:?} waiting for reply to {command:?}")]
    LinkTimeout { command: String, timeout: Duration },

    #[error("Mech link busy (held by {owner:?}) after waiting {waited:?}")]
    LinkBusy {
        owner: Option<String>,
        waited: Duration,
    },

    #[error("Mech link disconnected: {0}")]
    LinkDisconnected(String),

    #[error("Mech protocol error: {0}")]
    Protocol(String),

    #[error("Mech reported error {code}: {message:?}")]
    MechReported { code: i64, message: String },

    #[error("Mech controller has rebooted. Acknowledge the reboot before continuing")]
    MechRebooted,

    #[error("Motor {motor}: target {target} outside raw range [{min}, {max}]")]
    OutOfRange {
        motor: String,
        target: i64,
        min: i64,
        max: i64,
    },

    #[error("Absolute moves requested for more than one motor ({0}) in a single command")]
    UnsafeCompoundMove(String),

    #[error("Motor {0} is already moving")]
    MotorBusy(String),

    #[error("Controller {0} already has an exposure in progress")]
    ExposureInProgress(String),

    #[error("Readout did not complete within {0:?}")]
    ReadoutTimeout(Duration),

    #[error("Fetch did not complete within {0:?}")]
    FetchTimeout(Duration),

    #[error("Failed collecting housekeeping field {field}: {reason}")]
    Housekeeping { field: String, reason: String },

    #[error("Controller {controller} error: {message}")]
    Controller { controller: String, message: String },

    #[error("Exposure failed during {phase} (last checkpoint: {checkpoint}): {source}")]
    ExposureFailed {
        phase: ExposurePhase,
        checkpoint: Checkpoint,
        #[source]
        source: Box<DaqError>,
    },

    #[error("Exposure aborted during {0}")]
    ExposureAborted(ExposurePhase),

    #[error("Unknown controller {0:?}")]
    UnknownController(String),
}

/// Last phase of an exposure that completed successfully.
///
/// Wrapping the `Option` gives the checkpoint a readable `Display` in error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(pub Option<ExposurePhase>);

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(phase) => write!(f, "{phase}"),
            None => f.write_str("none"),
        }
    }
}

impl DaqError {
    /// Whether this error comes from the mech transport layer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            DaqError::LinkTimeout { .. }
                | DaqError::LinkBusy { .. }
                | DaqError::LinkDisconnected(_)
                | DaqError::Protocol(_)
                | DaqError::MechReported { .. }
                | DaqError::MechRebooted
        )
    }
}
