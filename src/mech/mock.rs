//! Simulated mech controller for tests.
//!
//! [`MockMech`] speaks the real wire protocol over an in-memory duplex stream, so the
//! link, motor controller, sequencer and alert monitor can be exercised end to end
//! without hardware. Every connection spawns a small device task that shares one
//! simulated state.
//!
//! Failure injection covers the cases the link must surface: stalled replies,
//! dropped connections, reboots, `ERR` sentences and corrupted checksums.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use super::commands::{Door, DoorState, MotorId};
use super::link::{MechConnector, MechStream};
use super::protocol::{format_sentence, SentenceKind};

#[derive(Debug)]
struct MockState {
    motors: BTreeMap<MotorId, i64>,
    doors: HashMap<Door, DoorState>,
    air: bool,
    environment: [f64; 7],
    orientation: [f64; 3],
    dewar: BTreeMap<String, String>,
    vacuum: (f64, f64),
    clock_set: Option<String>,
    stuck_doors: HashSet<Door>,
    stalled: Vec<String>,
    failures: Vec<(String, usize)>,
    corrupt_replies: usize,
    drop_connections: usize,
    rebooted: bool,
    commands: Vec<String>,
    connections: usize,
}

impl Default for MockState {
    fn default() -> Self {
        let motors = MotorId::ALL.iter().map(|m| (*m, 5000)).collect();
        let doors = HashMap::from([
            (Door::Shutter, DoorState::Closed),
            (Door::Left, DoorState::Open),
            (Door::Right, DoorState::Open),
        ]);
        let dewar = [
            ("blue_vent", "closed"),
            ("red_vent", "closed"),
            ("blue_thermistor", "warm"),
            ("red_thermistor", "warm"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            motors,
            doors,
            air: true,
            environment: [21.0, 35.0, 21.5, 34.0, 20.0, 38.0, 28.0],
            orientation: [0.01, -0.02, 0.99],
            dewar,
            vacuum: (1.2e-7, 1.5e-7),
            clock_set: None,
            stuck_doors: HashSet::new(),
            stalled: Vec::new(),
            failures: Vec::new(),
            corrupt_replies: 0,
            drop_connections: 0,
            rebooted: false,
            commands: Vec::new(),
            connections: 0,
        }
    }
}

/// What the device does with one command.
enum Action {
    Reply(String),
    Silent,
    Hangup,
}

impl MockState {
    fn handle(&mut self, line: &str) -> Action {
        self.commands.push(line.to_string());

        if self.drop_connections > 0 {
            self.drop_connections -= 1;
            return Action::Hangup;
        }

        let (command, id) = match line.split_once(';') {
            Some((command, id)) => (command, id.to_string()),
            None => (line, "0".to_string()),
        };

        if self.stalled.iter().any(|p| command.starts_with(p.as_str())) {
            return Action::Silent;
        }

        if command == "!" {
            self.rebooted = false;
            return Action::Reply(">".to_string());
        }
        if self.rebooted {
            return Action::Reply("!".to_string());
        }

        if let Some(failure) = self
            .failures
            .iter_mut()
            .find(|(p, n)| *n > 0 && command.starts_with(p.as_str()))
        {
            failure.1 -= 1;
            let sentence = self.sentence(SentenceKind::Error, &["7", "injected failure"], &id);
            return Action::Reply(frame(vec![sentence]));
        }

        let mut sentences = self.execute(command, &id);
        if self.corrupt_replies > 0 && !sentences.is_empty() {
            self.corrupt_replies -= 1;
            if let Some(first) = sentences.first_mut() {
                let cut = first.len() - 2;
                let checksum = u8::from_str_radix(&first[cut..], 16).unwrap_or(0);
                first.replace_range(cut.., &format!("{:02X}", checksum ^ 0x5A));
            }
        }
        Action::Reply(frame(sentences))
    }

    fn execute(&mut self, command: &str, id: &str) -> Vec<String> {
        let mut chars = command.chars();
        match (chars.next(), chars.next()) {
            (Some('r'), Some('s')) => {
                let mut all: Vec<String> = MotorId::ALL
                    .iter()
                    .map(|m| self.motor_sentence(*m, id))
                    .collect();
                for kind in [
                    SentenceKind::Environment,
                    SentenceKind::Orientation,
                    SentenceKind::Pneumatics,
                    SentenceKind::Dewar,
                    SentenceKind::Time,
                    SentenceKind::Version,
                    SentenceKind::Vacuum,
                ] {
                    all.push(self.status_sentence(kind, id));
                }
                all
            }
            (Some('r'), Some(m @ ('a' | 'b' | 'c'))) => match m.to_string().parse() {
                Ok(motor) => vec![self.motor_sentence(motor, id)],
                Err(_) => self.unknown(command, id),
            },
            (Some('r'), Some(code)) => {
                let kind = match code {
                    'e' => SentenceKind::Environment,
                    'o' => SentenceKind::Orientation,
                    'p' => SentenceKind::Pneumatics,
                    'n' => SentenceKind::Dewar,
                    't' => SentenceKind::Time,
                    'V' => SentenceKind::Version,
                    'v' => SentenceKind::Vacuum,
                    _ => return self.unknown(command, id),
                };
                vec![self.status_sentence(kind, id)]
            }
            (Some('m'), Some(m)) => {
                let target = &command[2..];
                let motor: Option<MotorId> = m.to_string().parse().ok();
                match (motor, target.parse::<i64>()) {
                    (Some(motor), Ok(value)) => {
                        let relative = target.starts_with('+') || target.starts_with('-');
                        let position = self.motors.entry(motor).or_insert(0);
                        *position = if relative { *position + value } else { value };
                        Vec::new()
                    }
                    _ => self.unknown(command, id),
                }
            }
            (Some(action @ ('o' | 'c')), Some(d)) => {
                let door = match d {
                    's' => Door::Shutter,
                    'l' => Door::Left,
                    'r' => Door::Right,
                    _ => return self.unknown(command, id),
                };
                if !self.stuck_doors.contains(&door) {
                    let state = if action == 'o' {
                        DoorState::Open
                    } else {
                        DoorState::Closed
                    };
                    self.doors.insert(door, state);
                }
                Vec::new()
            }
            (Some('s'), Some('t')) => {
                self.clock_set = Some(command[2..].to_string());
                Vec::new()
            }
            _ => self.unknown(command, id),
        }
    }

    fn unknown(&self, command: &str, id: &str) -> Vec<String> {
        let message = format!("unknown command {command}");
        vec![self.sentence(SentenceKind::Error, &["1", message.as_str()], id)]
    }

    fn motor_sentence(&self, motor: MotorId, id: &str) -> String {
        let position = self.motors.get(&motor).copied().unwrap_or(0).to_string();
        let code = motor.to_string();
        self.sentence(
            SentenceKind::Motor,
            &[code.as_str(), position.as_str(), "steps", "100", "steps/s", "250", "mA", "0"],
            id,
        )
    }

    fn status_sentence(&self, kind: SentenceKind, id: &str) -> String {
        let fields: Vec<String> = match kind {
            SentenceKind::Environment => {
                let mut fields = Vec::new();
                for (i, value) in self.environment.iter().enumerate() {
                    fields.push(value.to_string());
                    fields.push(if i % 2 == 1 && i < 6 { "%" } else { "C" }.to_string());
                }
                fields
            }
            SentenceKind::Orientation => self.orientation.iter().map(f64::to_string).collect(),
            SentenceKind::Pneumatics => {
                let mut fields = Vec::new();
                for door in [Door::Shutter, Door::Left, Door::Right] {
                    let state = self.doors.get(&door).copied().unwrap_or(DoorState::Transiting);
                    fields.push(state.code().to_string());
                    fields.push(state.to_string());
                }
                fields.push(if self.air { "1" } else { "0" }.to_string());
                fields.push(if self.air { "on" } else { "off" }.to_string());
                fields
            }
            SentenceKind::Dewar => ["blue_vent", "red_vent", "blue_thermistor", "red_thermistor"]
                .iter()
                .map(|f| self.dewar.get(*f).cloned().unwrap_or_default())
                .collect(),
            SentenceKind::Time => vec![
                self.clock_set.clone().unwrap_or_else(|| "2000-01-01T00:00:00".into()),
                "booted".to_string(),
                "2000-01-01T00:00:00".to_string(),
            ],
            SentenceKind::Version => vec!["version".to_string(), "2024-01-15".to_string()],
            SentenceKind::Vacuum => vec![
                self.vacuum.0.to_string(),
                "Torr".to_string(),
                self.vacuum.1.to_string(),
                "Torr".to_string(),
            ],
            SentenceKind::Motor | SentenceKind::Error => Vec::new(),
        };
        let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
        self.sentence(kind, &refs, id)
    }

    fn sentence(&self, kind: SentenceKind, fields: &[&str], id: &str) -> String {
        let time = Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string();
        let fields: Vec<String> = std::iter::once(time)
            .chain(fields.iter().map(|f| f.to_string()))
            .chain(std::iter::once(id.to_string()))
            .collect();
        format_sentence("S1", kind, &fields)
    }
}

fn frame(sentences: Vec<String>) -> String {
    let mut reply = String::new();
    for sentence in sentences {
        reply.push_str(&sentence);
        reply.push_str("\r\0\n");
    }
    reply.push('>');
    reply
}

/// Simulated mech controller shared by every connection opened through it.
#[derive(Clone, Default)]
pub struct MockMech {
    state: Arc<Mutex<MockState>>,
}

impl MockMech {
    /// New device with motors at 5000, shutter closed and both Hartmann doors open.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector for [`crate::mech::MechLink::new`].
    pub fn connector(&self) -> Arc<dyn MechConnector> {
        Arc::new(MockConnector {
            state: self.state.clone(),
        })
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Every command received, framing removed (e.g. `rp;3`).
    pub fn commands(&self) -> Vec<String> {
        self.with(|s| s.commands.clone())
    }

    /// Commands received that start with `prefix`.
    pub fn commands_starting_with(&self, prefix: &str) -> Vec<String> {
        self.with(|s| {
            s.commands
                .iter()
                .filter(|c| c.starts_with(prefix))
                .cloned()
                .collect()
        })
    }

    /// Number of connections opened so far.
    pub fn connection_count(&self) -> usize {
        self.with(|s| s.connections)
    }

    /// Current raw position of a motor.
    pub fn motor_position(&self, motor: MotorId) -> i64 {
        self.with(|s| s.motors.get(&motor).copied().unwrap_or(0))
    }

    /// Place a motor at a raw position.
    pub fn set_motor_position(&self, motor: MotorId, raw: i64) {
        self.with(|s| {
            s.motors.insert(motor, raw);
        })
    }

    /// Current state of a door.
    pub fn door_state(&self, door: Door) -> DoorState {
        self.with(|s| s.doors.get(&door).copied().unwrap_or(DoorState::Transiting))
    }

    /// Force a door state.
    pub fn set_door(&self, door: Door, state: DoorState) {
        self.with(|s| {
            s.doors.insert(door, state);
        })
    }

    /// Make a door ignore open/close commands.
    pub fn stick_door(&self, door: Door) {
        self.with(|s| {
            s.stuck_doors.insert(door);
        })
    }

    /// Environment readings in sentence order: t0, h0, t1, h1, t2, h2, mech_t.
    pub fn set_environment(&self, values: [f64; 7]) {
        self.with(|s| s.environment = values)
    }

    /// Accelerometer readings.
    pub fn set_orientation(&self, values: [f64; 3]) {
        self.with(|s| s.orientation = values)
    }

    /// Set an `LN2` field such as `red_vent` to `open`.
    pub fn set_dewar(&self, field: &str, state: &str) {
        self.with(|s| {
            s.dewar.insert(field.to_string(), state.to_string());
        })
    }

    /// Value last written by a clock command.
    pub fn clock_set(&self) -> Option<String> {
        self.with(|s| s.clock_set.clone())
    }

    /// Never answer commands starting with `prefix`.
    pub fn stall(&self, prefix: &str) {
        self.with(|s| s.stalled.push(prefix.to_string()))
    }

    /// Answer stalled commands again.
    pub fn unstall(&self) {
        self.with(|s| s.stalled.clear())
    }

    /// Answer the next `times` commands starting with `prefix` with an `ERR` sentence.
    pub fn fail_command(&self, prefix: &str, times: usize) {
        self.with(|s| s.failures.push((prefix.to_string(), times)))
    }

    /// Corrupt the checksum of the next reply that carries a sentence.
    pub fn corrupt_next_reply(&self) {
        self.with(|s| s.corrupt_replies += 1)
    }

    /// Close the connection instead of answering the next command.
    pub fn drop_next_connection(&self) {
        self.with(|s| s.drop_connections += 1)
    }

    /// Simulate a controller reboot: every command is answered with `!` until
    /// the reboot is acknowledged.
    pub fn reboot(&self) {
        self.with(|s| s.rebooted = true)
    }
}

struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl MechConnector for MockConnector {
    async fn connect(&self) -> std::io::Result<Box<dyn MechStream>> {
        let (client, server) = tokio::io::duplex(8192);
        if let Ok(mut state) = self.state.lock() {
            state.connections += 1;
        }
        tokio::spawn(serve(server, self.state.clone()));
        Ok(Box::new(client))
    }

    fn describe(&self) -> String {
        "mock://mech".to_string()
    }
}

async fn serve(mut stream: DuplexStream, state: Arc<Mutex<MockState>>) {
    let mut pending = String::new();
    let mut chunk = [0u8; 512];
    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        pending.push_str(&String::from_utf8_lossy(&chunk[..n]));

        while let Some(end) = pending.find('\r') {
            let line: String = pending.drain(..=end).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let action = match state.lock() {
                Ok(mut s) => s.handle(line),
                Err(_) => return,
            };
            match action {
                Action::Reply(reply) => {
                    if stream.write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                }
                Action::Silent => {}
                Action::Hangup => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mech::protocol::parse_response;

    #[test]
    fn test_full_status_reply_parses() {
        let mut state = MockState::default();
        match state.handle("rs;4") {
            Action::Reply(reply) => {
                let response = parse_response(&reply, Some(4)).unwrap();
                assert_eq!(response.replies.len(), 10);
            }
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn test_relative_and_absolute_moves() {
        let mut state = MockState::default();
        state.handle("ma1200;1");
        state.handle("ma+300;2");
        state.handle("mb-100;3");
        assert_eq!(state.motors[&MotorId::A], 1500);
        assert_eq!(state.motors[&MotorId::B], 4900);
    }
}
