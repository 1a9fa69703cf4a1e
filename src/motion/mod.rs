//! Safety-checked motion of the collimator motors.
//!
//! Every rule is enforced before any move command is written to the mech link:
//!
//! - targets outside `[min_raw, max_raw]` are rejected with `DaqError::OutOfRange`;
//! - a logical command may give an absolute target to at most one motor
//!   (`DaqError::UnsafeCompoundMove`). Relative moves of several motors are allowed;
//! - a motor with a move outstanding rejects further moves (`DaqError::MotorBusy`).
//!
//! A move is outstanding from the moment it is accepted until the mech reports the
//! motor stopped (or the move timeout elapses).
//!
//! Relative targets are resolved against a fresh position query and sent as
//! absolute moves, so the bounds check holds even if the motor was moved by
//! someone else since the last status.
//!
//! # Example
//!
//! ```no_run
//! # use spectro_daq::motion::{MotorController, MotorId, MoveRequest, MoveTarget};
//! # async fn example(motors: MotorController) -> spectro_daq::error::AppResult<()> {
//! // Piston all three motors by +10 microns
//! motors
//!     .move_compound(&[
//!         MoveRequest::relative(MotorId::A, 10.0),
//!         MoveRequest::relative(MotorId::B, 10.0),
//!         MoveRequest::relative(MotorId::C, 10.0),
//!     ])
//!     .await?;
//!
//! motors.center(MotorId::A).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{MotorCalibration, MotorsConfig};
use crate::error::{AppResult, DaqError};
use crate::mech::{MechCommand, MechLink};

pub use crate::mech::MotorId;

const MOTION_POLL: Duration = Duration::from_millis(200);

/// Requested target of one motor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MoveTarget {
    /// Raw position
    Absolute(i64),
    /// Offset in microns
    Relative(f64),
}

/// One motor's part of a logical move command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveRequest {
    /// Motor to move
    pub motor: MotorId,
    /// Target
    pub target: MoveTarget,
}

impl MoveRequest {
    /// Absolute move to a raw position.
    pub fn absolute(motor: MotorId, raw: i64) -> Self {
        Self {
            motor,
            target: MoveTarget::Absolute(raw),
        }
    }

    /// Relative move in microns.
    pub fn relative(motor: MotorId, microns: f64) -> Self {
        Self {
            motor,
            target: MoveTarget::Relative(microns),
        }
    }
}

/// Snapshot of one motor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Motor {
    /// Motor
    pub id: MotorId,
    /// Last known raw position
    pub raw_position: i64,
    /// Last known position in microns
    pub microns: f64,
    /// Whether a move is outstanding
    pub in_motion: bool,
    /// Calibration in use
    pub calibration: MotorCalibration,
}

#[derive(Debug, Default, Clone, Copy)]
struct MotorState {
    in_motion: bool,
}

/// Linear micron/raw mapping from the two calibration pairs.
fn slope(cal: &MotorCalibration) -> f64 {
    (cal.max_raw - cal.min_raw) as f64 / (cal.max_microns - cal.min_microns)
}

/// Convert a physical position to raw steps.
pub fn microns_to_raw(cal: &MotorCalibration, microns: f64) -> i64 {
    cal.min_raw + ((microns - cal.min_microns) * slope(cal)).round() as i64
}

/// Convert raw steps to a physical position.
pub fn raw_to_microns(cal: &MotorCalibration, raw: i64) -> f64 {
    cal.min_microns + (raw - cal.min_raw) as f64 / slope(cal)
}

/// Marks motors busy for the lifetime of a move.
struct MotionGuard {
    state: Arc<Mutex<BTreeMap<MotorId, MotorState>>>,
    motors: Vec<MotorId>,
}

impl Drop for MotionGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for motor in &self.motors {
            if let Some(s) = state.get_mut(motor) {
                s.in_motion = false;
            }
        }
    }
}

/// Motion primitives for the collimator motors.
#[derive(Clone)]
pub struct MotorController {
    link: MechLink,
    config: MotorsConfig,
    state: Arc<Mutex<BTreeMap<MotorId, MotorState>>>,
}

impl MotorController {
    /// Create a controller on the shared mech link.
    pub fn new(link: MechLink, config: MotorsConfig) -> Self {
        let state = MotorId::ALL
            .iter()
            .map(|m| (*m, MotorState::default()))
            .collect();
        Self {
            link,
            config,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Calibration of a motor.
    pub fn calibration(&self, motor: MotorId) -> &MotorCalibration {
        self.config.calibration(motor)
    }

    /// Move one motor to a raw position.
    pub async fn move_absolute(&self, motor: MotorId, raw: i64) -> AppResult<()> {
        self.move_compound(&[MoveRequest::absolute(motor, raw)]).await
    }

    /// Move one motor by a distance in microns.
    pub async fn move_relative(&self, motor: MotorId, delta_microns: f64) -> AppResult<()> {
        self.move_compound(&[MoveRequest::relative(motor, delta_microns)])
            .await
    }

    /// Move a motor to its configured center position.
    pub async fn center(&self, motor: MotorId) -> AppResult<()> {
        let center = self.calibration(motor).center_raw;
        self.move_absolute(motor, center).await
    }

    /// Query the mech for the current state of a motor.
    pub async fn status(&self, motor: MotorId) -> AppResult<Motor> {
        let status = self
            .link
            .motor_status(motor, self.config.move_timeout())
            .await?;

        let in_motion = self
            .lock_state()
            .get(&motor)
            .map(|s| s.in_motion)
            .unwrap_or(false)
            || status.moving;

        let calibration = *self.calibration(motor);
        Ok(Motor {
            id: motor,
            raw_position: status.position,
            microns: raw_to_microns(&calibration, status.position),
            in_motion,
            calibration,
        })
    }

    /// Execute one logical move command on one or more motors.
    ///
    /// All requests are validated before any is sent. Motors move one after the
    /// other, each to completion.
    pub async fn move_compound(&self, requests: &[MoveRequest]) -> AppResult<()> {
        let absolute: Vec<String> = requests
            .iter()
            .filter(|r| matches!(r.target, MoveTarget::Absolute(_)))
            .map(|r| r.motor.to_string())
            .collect();
        if absolute.len() > 1 {
            return Err(DaqError::UnsafeCompoundMove(absolute.join(", ")));
        }

        let mut seen = HashSet::new();
        for request in requests {
            if !seen.insert(request.motor) {
                return Err(DaqError::UnsafeCompoundMove(format!(
                    "motor {} requested twice",
                    request.motor
                )));
            }
        }

        let _guard = self.claim(requests.iter().map(|r| r.motor).collect())?;

        let mut plan = Vec::with_capacity(requests.len());
        for request in requests {
            let cal = self.calibration(request.motor);
            let target = match request.target {
                MoveTarget::Absolute(raw) => raw,
                MoveTarget::Relative(microns) => {
                    let delta = (microns * slope(cal)).round() as i64;
                    let current = self
                        .link
                        .motor_status(request.motor, self.config.move_timeout())
                        .await?;
                    current.position + delta
                }
            };
            if target < cal.min_raw || target > cal.max_raw {
                return Err(DaqError::OutOfRange {
                    motor: request.motor.to_string(),
                    target,
                    min: cal.min_raw,
                    max: cal.max_raw,
                });
            }
            plan.push((request.motor, target));
        }

        for (motor, raw) in plan {
            let command = MechCommand::MoveAbsolute { motor, raw };
            tracing::info!(motor = %motor, target = raw, command = %command.to_wire(), "Moving motor");
            self.link
                .execute(&command, self.config.move_timeout())
                .await?;
            self.wait_stopped(motor).await?;
        }
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BTreeMap<MotorId, MotorState>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn claim(&self, motors: Vec<MotorId>) -> AppResult<MotionGuard> {
        let mut state = self.lock_state();
        if let Some(busy) = motors
            .iter()
            .find(|m| state.get(*m).map(|s| s.in_motion).unwrap_or(false))
        {
            return Err(DaqError::MotorBusy(busy.to_string()));
        }
        for motor in &motors {
            state.entry(*motor).or_default().in_motion = true;
        }
        Ok(MotionGuard {
            state: self.state.clone(),
            motors,
        })
    }

    async fn wait_stopped(&self, motor: MotorId) -> AppResult<()> {
        let timeout = self.config.move_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DaqError::LinkTimeout {
                    command: format!("r{motor}"),
                    timeout,
                });
            }
            let status = self.link.motor_status(motor, remaining).await?;
            if !status.moving {
                return Ok(());
            }
            tokio::time::sleep(MOTION_POLL).await;
        }
    }
}
