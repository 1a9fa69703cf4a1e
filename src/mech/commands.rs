//! Typed mech commands and decoded status sentences.
//!
//! [`MechCommand`] renders to the command text understood by the controller, and
//! the status structs decode the matching reply sentences. The helpers on
//! [`MechLink`] each hold the link only for a single exchange, so a slow door or a
//! long poll never starves other callers of the single-writer slot.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::link::MechLink;
use super::protocol::{MechReply, MechResponse, SentenceKind};
use crate::error::{AppResult, DaqError};

/// Collimator motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotorId {
    /// Motor A
    A,
    /// Motor B
    B,
    /// Motor C
    C,
}

impl MotorId {
    /// All motors, in header order.
    pub const ALL: [MotorId; 3] = [MotorId::A, MotorId::B, MotorId::C];

    /// Single-letter wire code.
    pub fn code(&self) -> char {
        match self {
            MotorId::A => 'a',
            MotorId::B => 'b',
            MotorId::C => 'c',
        }
    }
}

impl fmt::Display for MotorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for MotorId {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a" => Ok(MotorId::A),
            "b" => Ok(MotorId::B),
            "c" => Ok(MotorId::C),
            other => Err(DaqError::Protocol(format!("unknown motor {other:?}"))),
        }
    }
}

/// Pneumatically driven door.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Door {
    /// Exposure shutter
    Shutter,
    /// Left Hartmann door
    Left,
    /// Right Hartmann door
    Right,
}

impl Door {
    /// Single-letter wire code.
    pub fn code(&self) -> char {
        match self {
            Door::Shutter => 's',
            Door::Left => 'l',
            Door::Right => 'r',
        }
    }

    /// Field of the `PNU` sentence reporting this door.
    pub fn field(&self) -> &'static str {
        match self {
            Door::Shutter => "shutter",
            Door::Left => "left",
            Door::Right => "right",
        }
    }
}

impl fmt::Display for Door {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field())
    }
}

/// Reported door position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoorState {
    /// Open
    Open,
    /// Closed
    Closed,
    /// Moving between positions
    Transiting,
}

impl DoorState {
    fn from_code(code: &str) -> AppResult<Self> {
        match code {
            "o" => Ok(DoorState::Open),
            "c" => Ok(DoorState::Closed),
            "t" => Ok(DoorState::Transiting),
            other => Err(DaqError::Protocol(format!("unknown door state {other:?}"))),
        }
    }

    /// Wire code.
    pub fn code(&self) -> &'static str {
        match self {
            DoorState::Open => "o",
            DoorState::Closed => "c",
            DoorState::Transiting => "t",
        }
    }
}

impl fmt::Display for DoorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DoorState::Open => "open",
            DoorState::Closed => "closed",
            DoorState::Transiting => "transiting",
        })
    }
}

/// What a status query asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatTarget {
    /// Every status sentence
    All,
    /// One motor
    Motor(MotorId),
    /// Temperature and humidity sensors
    Environment,
    /// Accelerometer
    Orientation,
    /// Shutter, Hartmann doors and air pressure
    Pneumatics,
    /// Dewar vents and thermistors
    Dewar,
    /// Controller clock
    Time,
    /// Firmware version
    Version,
    /// Dewar vacuum
    Vacuum,
}

impl StatTarget {
    fn command(&self) -> String {
        match self {
            StatTarget::All => "rs".to_string(),
            StatTarget::Motor(motor) => format!("r{motor}"),
            StatTarget::Environment => "re".to_string(),
            StatTarget::Orientation => "ro".to_string(),
            StatTarget::Pneumatics => "rp".to_string(),
            StatTarget::Dewar => "rn".to_string(),
            StatTarget::Time => "rt".to_string(),
            StatTarget::Version => "rV".to_string(),
            StatTarget::Vacuum => "rv".to_string(),
        }
    }
}

/// A command understood by the mech controller.
#[derive(Debug, Clone, PartialEq)]
pub enum MechCommand {
    /// Status query
    Status(StatTarget),
    /// Move a motor to a raw position
    MoveAbsolute {
        /// Motor to move
        motor: MotorId,
        /// Target raw position (non-negative)
        raw: i64,
    },
    /// Open a door
    Open(Door),
    /// Close a door
    Close(Door),
    /// Set the controller clock
    SetTime(DateTime<Utc>),
}

impl MechCommand {
    /// Command text without framing.
    pub fn to_wire(&self) -> String {
        match self {
            MechCommand::Status(target) => target.command(),
            MechCommand::MoveAbsolute { motor, raw } => format!("m{motor}{raw}"),
            MechCommand::Open(door) => format!("o{}", door.code()),
            MechCommand::Close(door) => format!("c{}", door.code()),
            MechCommand::SetTime(now) => {
                format!("st{}", now.to_rfc3339_opts(SecondsFormat::Secs, true))
            }
        }
    }
}

/// Decoded `MTR` sentence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorStatus {
    /// Motor
    pub motor: MotorId,
    /// Raw position
    pub position: i64,
    /// Speed in raw units per second
    pub speed: i64,
    /// Drive current in mA
    pub current: i64,
    /// Whether the motor is moving
    pub moving: bool,
}

impl MotorStatus {
    /// Decode from a `MTR` sentence.
    pub fn from_reply(reply: &MechReply) -> AppResult<Self> {
        Ok(Self {
            motor: reply.str("motor")?.parse()?,
            position: reply.i64("position")?,
            speed: reply.i64("speed")?,
            current: reply.i64("current")?,
            moving: reply.str("moving")? == "1",
        })
    }
}

/// Decoded `PNU` sentence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PneumaticStatus {
    /// Shutter
    pub shutter: DoorState,
    /// Left Hartmann door
    pub left: DoorState,
    /// Right Hartmann door
    pub right: DoorState,
    /// Whether air pressure is present
    pub air_pressure: bool,
}

impl PneumaticStatus {
    /// Decode from a `PNU` sentence.
    pub fn from_reply(reply: &MechReply) -> AppResult<Self> {
        Ok(Self {
            shutter: DoorState::from_code(reply.str("shutter")?)?,
            left: DoorState::from_code(reply.str("left")?)?,
            right: DoorState::from_code(reply.str("right")?)?,
            air_pressure: reply.str("air")? == "1",
        })
    }

    /// State of one door.
    pub fn door(&self, door: Door) -> DoorState {
        match door {
            Door::Shutter => self.shutter,
            Door::Left => self.left,
            Door::Right => self.right,
        }
    }

    /// Value of the `HARTMANN` header card.
    ///
    /// Names the closed doors; `Out` when both are open and `?` while either moves.
    pub fn hartmann_card(&self) -> &'static str {
        match (self.left, self.right) {
            (DoorState::Closed, DoorState::Closed) => "Left,Right",
            (DoorState::Closed, DoorState::Open) => "Left",
            (DoorState::Open, DoorState::Closed) => "Right",
            (DoorState::Open, DoorState::Open) => "Out",
            _ => "?",
        }
    }
}

/// Decoded `ENV` sentence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Environment {
    /// Blue camera temperature
    pub t0: f64,
    /// Blue camera humidity
    pub h0: f64,
    /// Red camera temperature
    pub t1: f64,
    /// Red camera humidity
    pub h1: f64,
    /// Collimator temperature
    pub t2: f64,
    /// Collimator humidity
    pub h2: f64,
    /// Controller board temperature
    pub mech_t: f64,
}

impl Environment {
    /// Decode from an `ENV` sentence.
    pub fn from_reply(reply: &MechReply) -> AppResult<Self> {
        Ok(Self {
            t0: reply.f64("t0")?,
            h0: reply.f64("h0")?,
            t1: reply.f64("t1")?,
            h1: reply.f64("h1")?,
            t2: reply.f64("t2")?,
            h2: reply.f64("h2")?,
            mech_t: reply.f64("mech_t")?,
        })
    }
}

/// Decoded `ORI` sentence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Orientation {
    /// X acceleration
    pub x: f64,
    /// Y acceleration
    pub y: f64,
    /// Z acceleration
    pub z: f64,
}

impl Orientation {
    /// Decode from an `ORI` sentence.
    pub fn from_reply(reply: &MechReply) -> AppResult<Self> {
        Ok(Self {
            x: reply.f64("x")?,
            y: reply.f64("y")?,
            z: reply.f64("z")?,
        })
    }
}

/// Decoded `LN2` sentence: vent and thermistor states by field name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DewarStatus {
    states: BTreeMap<String, String>,
}

impl DewarStatus {
    /// Decode from an `LN2` sentence.
    pub fn from_reply(reply: &MechReply) -> AppResult<Self> {
        let mut states = BTreeMap::new();
        for field in ["blue_vent", "red_vent", "blue_thermistor", "red_thermistor"] {
            states.insert(field.to_string(), reply.str(field)?.to_string());
        }
        Ok(Self { states })
    }

    /// State reported for a field such as `red_vent`.
    pub fn state(&self, field: &str) -> Option<&str> {
        self.states.get(field).map(String::as_str)
    }
}

/// Decoded `TIM` sentence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockStatus {
    /// Current controller time
    pub time: String,
    /// When the clock was last set
    pub set_time: String,
    /// When the controller booted
    pub boot_time: String,
}

impl MechLink {
    /// Send a typed command.
    pub async fn execute(&self, command: &MechCommand, timeout: Duration) -> AppResult<MechResponse> {
        self.send(&command.to_wire(), timeout).await
    }

    /// Raw status query.
    pub async fn status(&self, target: StatTarget, timeout: Duration) -> AppResult<MechResponse> {
        self.execute(&MechCommand::Status(target), timeout).await
    }

    /// Status of one motor.
    pub async fn motor_status(&self, motor: MotorId, timeout: Duration) -> AppResult<MotorStatus> {
        let response = self.status(StatTarget::Motor(motor), timeout).await?;
        MotorStatus::from_reply(response.expect(SentenceKind::Motor)?)
    }

    /// Shutter, door and air pressure state.
    pub async fn pneumatics(&self, timeout: Duration) -> AppResult<PneumaticStatus> {
        let response = self.status(StatTarget::Pneumatics, timeout).await?;
        PneumaticStatus::from_reply(response.expect(SentenceKind::Pneumatics)?)
    }

    /// Temperature and humidity sensors.
    pub async fn environment(&self, timeout: Duration) -> AppResult<Environment> {
        let response = self.status(StatTarget::Environment, timeout).await?;
        Environment::from_reply(response.expect(SentenceKind::Environment)?)
    }

    /// Accelerometer.
    pub async fn orientation(&self, timeout: Duration) -> AppResult<Orientation> {
        let response = self.status(StatTarget::Orientation, timeout).await?;
        Orientation::from_reply(response.expect(SentenceKind::Orientation)?)
    }

    /// Dewar vents and thermistors.
    pub async fn dewar(&self, timeout: Duration) -> AppResult<DewarStatus> {
        let response = self.status(StatTarget::Dewar, timeout).await?;
        DewarStatus::from_reply(response.expect(SentenceKind::Dewar)?)
    }

    /// Controller clock.
    pub async fn clock(&self, timeout: Duration) -> AppResult<ClockStatus> {
        let response = self.status(StatTarget::Time, timeout).await?;
        let reply = response.expect(SentenceKind::Time)?;
        Ok(ClockStatus {
            time: reply.str("time")?.to_string(),
            set_time: reply.str("set_time")?.to_string(),
            boot_time: reply.str("boot_time")?.to_string(),
        })
    }

    /// Set the controller clock.
    pub async fn set_time(&self, now: DateTime<Utc>, timeout: Duration) -> AppResult<()> {
        self.execute(&MechCommand::SetTime(now), timeout).await.map(|_| ())
    }

    /// Open or close a door and wait for the controller to report the new state.
    ///
    /// The door state is polled every `poll` until it matches or `ack_timeout`
    /// elapses, in which case `DaqError::LinkTimeout` is returned. The link is
    /// released between polls.
    pub async fn move_door(
        &self,
        door: Door,
        open: bool,
        ack_timeout: Duration,
        poll: Duration,
    ) -> AppResult<()> {
        let command = if open {
            MechCommand::Open(door)
        } else {
            MechCommand::Close(door)
        };
        let wanted = if open { DoorState::Open } else { DoorState::Closed };
        let deadline = Instant::now() + ack_timeout;

        self.execute(&command, ack_timeout).await?;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let state = self.pneumatics(remaining).await?;
            if state.door(door) == wanted {
                tracing::debug!(door = %door, state = %wanted, "Door acknowledged");
                return Ok(());
            }
            tokio::time::sleep(poll.min(deadline.saturating_duration_since(Instant::now())))
                .await;
        }

        Err(DaqError::LinkTimeout {
            command: command.to_wire(),
            timeout: ack_timeout,
        })
    }
}
