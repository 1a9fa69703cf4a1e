//! Contract of the external CCD controller.
//!
//! The controller's own wire protocol is not modelled here. The sequencer and the
//! alert monitor only need the operations below; like the camera adapters they
//! return `anyhow::Result`, and the sequencer maps failures into
//! `DaqError::Controller`.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::exposure::WindowMode;
use crate::value::FieldValue;

pub mod mock;

pub use mock::MockCcdController;

/// Status surface of a controller, keyed by parameter name.
pub type TelemetryMap = BTreeMap<String, FieldValue>;

/// Pixel data of one detector.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Detector name (e.g. `r2`)
    pub detector: String,
    /// Columns
    pub width: usize,
    /// Rows
    pub height: usize,
    /// Row-major 16-bit pixels
    pub data: Vec<u16>,
}

impl Frame {
    /// Whether `data` matches the declared geometry.
    pub fn is_consistent(&self) -> bool {
        self.data.len() == self.width * self.height
    }
}

/// Pixel data of every detector read out by one exposure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PixelBuffer {
    /// One frame per detector
    pub frames: Vec<Frame>,
}

impl PixelBuffer {
    /// Frame of one detector.
    pub fn frame(&self, detector: &str) -> Option<&Frame> {
        self.frames.iter().find(|f| f.detector == detector)
    }
}

/// Operations the sequencer and alert monitor need from a CCD controller.
#[async_trait]
pub trait CcdController: Send + Sync {
    /// Controller name (e.g. `sp2`)
    fn name(&self) -> &str;

    /// Detectors read out by this controller
    fn detectors(&self) -> Vec<String>;

    /// Load the readout window
    async fn configure(&self, window: &WindowMode) -> Result<()>;

    /// Clear accumulated charge
    async fn flush(&self, binned: bool) -> Result<()>;

    /// Purge residual charge after a flush
    async fn purge(&self) -> Result<()>;

    /// Start integrating. Returns once the controller confirms integration started.
    async fn start_integration(&self, exposure_time: Duration) -> Result<()>;

    /// Stop integrating and start reading the detectors out
    async fn start_readout(&self) -> Result<()>;

    /// Whether the readout started by `start_readout` has finished
    async fn readout_complete(&self) -> Result<bool>;

    /// Transfer the pixel data of the last readout
    async fn fetch(&self) -> Result<PixelBuffer>;

    /// Stop whatever the controller is doing
    async fn abort(&self) -> Result<()>;

    /// Current status values
    async fn status(&self) -> Result<TelemetryMap>;

    /// A numeric configuration parameter, such as a temperature setpoint
    async fn parameter(&self, key: &str) -> Result<Option<f64>>;
}
