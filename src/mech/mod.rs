//! Mech link: the command channel to the mechanical/environmental controller.
//!
//! - [`protocol`]: command framing and typed reply sentences
//! - [`link`]: the single-writer connection with leases, timeouts and reconnection
//! - [`log`]: durable exchange log
//! - [`commands`]: typed commands and decoded status
//! - [`clock`]: daily clock synchronisation task
//! - [`mock`]: simulated controller for tests

pub mod clock;
pub mod commands;
pub mod link;
pub mod log;
pub mod mock;
pub mod protocol;

pub use clock::ClockSync;
pub use commands::{
    ClockStatus, DewarStatus, Door, DoorState, Environment, MechCommand, MotorId, MotorStatus,
    Orientation, PneumaticStatus, StatTarget,
};
pub use link::{LinkLease, MechConnector, MechLink, MechStream, TcpConnector};
pub use log::MechLog;
pub use protocol::{MechReply, MechResponse, SentenceKind};
