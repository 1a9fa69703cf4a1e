//! Data acquisition for a CCD spectrograph.
//!
//! The crate drives one spectrograph: it sequences exposures on the CCD
//! controllers, talks to the mech controller that owns the shutter, Hartmann doors
//! and collimator motors, watches detector and dewar health, and writes every
//! readout as a FITS file with a checksum sidecar.
//!
//! - [`mech`]: line protocol, shared link, clock synchronisation
//! - [`motion`]: calibrated, range-checked collimator moves
//! - [`ccd`]: CCD controller contract
//! - [`exposure`]: the exposure state machine
//! - [`header`]: header keyword schema and assembly
//! - [`storage`]: file naming, FITS output, checksums
//! - [`alerts`]: temperature, vent and heartbeat alerts
//! - [`telemetry`]: values published by peer instruments

pub mod alerts;
pub mod ccd;
pub mod config;
pub mod error;
pub mod exposure;
pub mod header;
pub mod logging;
pub mod mech;
pub mod motion;
pub mod storage;
pub mod telemetry;
pub mod value;

pub use error::{AppResult, DaqError};
