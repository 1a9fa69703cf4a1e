//! Exposure sequencing.
//!
//! - [`types`]: requests, phases and state snapshots
//! - [`sequencer`]: the phase state machine
//! - [`deadline`]: expected/maximum phase durations
//! - [`lease`]: one active exposure per controller
//! - [`counter`]: persistent exposure numbers

pub mod counter;
pub mod deadline;
pub mod lease;
pub mod sequencer;
pub mod types;

pub use counter::ExposureCounter;
pub use deadline::{with_deadlines, DeadlineOutcome, Deadlines, HardDeadlineExceeded};
pub use lease::{ExposureLease, ExposureLocks};
pub use sequencer::ExposureSequencer;
pub use types::{
    ExposureFlavour, ExposureOutcome, ExposurePhase, ExposureRequest, ExposureResult,
    ExposureState, HartmannSide, WindowMode, WrittenFile,
};
