//! Mech wire protocol: command framing and reply sentence decoding.
//!
//! Commands are ASCII lines of the form `<command>;<id>\r`, where `<id>` is a
//! command counter that the mech echoes as the last field of every reply sentence.
//! The reboot acknowledgement `!` is the only command sent without an id.
//!
//! A reply is a sequence of sentences terminated by the prompt character `>`:
//!
//! ```text
//! $S1MTR,2024-03-01T04:12:55,a,1500,steps,100,steps/s,250,mA,0,17*4B\r\0\n>
//! ```
//!
//! `S1` is the source tag of the unit that replied, `MTR` the sentence kind and the
//! two hex digits after `*` are the NMEA checksum (XOR of every byte between `$` and
//! `*`). A controller that rebooted replies with a bare `!` until the reboot is
//! acknowledged.
//!
//! Every sentence kind has a fixed positional schema. A sentence that does not match
//! its schema exactly is rejected as a whole.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{AppResult, DaqError};
use crate::value::{FieldKind, FieldSpec, FieldValue};

/// Prompt that ends every complete reply.
pub const PROMPT: u8 = b'>';

/// Reply sent by a controller that rebooted.
pub const REBOOT_MARKER: &str = "!";

const DOOR_STATES: &[&str] = &["o", "c", "t"];
const BINARY: &[&str] = &["0", "1"];

static SENTENCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\$(?P<source>S\d+)(?P<kind>[A-Z0-9]{3}),(?P<fields>[^*]*)\*(?P<checksum>[0-9A-Fa-f]{2})$")
        .expect("sentence regex is a valid literal")
});

const MOTOR_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("time", FieldKind::Text),
    FieldSpec::new("motor", FieldKind::Enum(&["a", "b", "c"])),
    FieldSpec::new("position", FieldKind::Int),
    FieldSpec::new("position_units", FieldKind::Text),
    FieldSpec::new("speed", FieldKind::Int),
    FieldSpec::new("speed_units", FieldKind::Text),
    FieldSpec::new("current", FieldKind::Int),
    FieldSpec::new("current_units", FieldKind::Text),
    FieldSpec::new("moving", FieldKind::Enum(BINARY)),
    FieldSpec::new("id", FieldKind::Int),
];

const ENVIRONMENT_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("time", FieldKind::Text),
    FieldSpec::new("t0", FieldKind::Float),
    FieldSpec::new("t0_units", FieldKind::Text),
    FieldSpec::new("h0", FieldKind::Float),
    FieldSpec::new("h0_units", FieldKind::Text),
    FieldSpec::new("t1", FieldKind::Float),
    FieldSpec::new("t1_units", FieldKind::Text),
    FieldSpec::new("h1", FieldKind::Float),
    FieldSpec::new("h1_units", FieldKind::Text),
    FieldSpec::new("t2", FieldKind::Float),
    FieldSpec::new("t2_units", FieldKind::Text),
    FieldSpec::new("h2", FieldKind::Float),
    FieldSpec::new("h2_units", FieldKind::Text),
    FieldSpec::new("mech_t", FieldKind::Float),
    FieldSpec::new("mech_t_units", FieldKind::Text),
    FieldSpec::new("id", FieldKind::Int),
];

const ORIENTATION_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("time", FieldKind::Text),
    FieldSpec::new("x", FieldKind::Float),
    FieldSpec::new("y", FieldKind::Float),
    FieldSpec::new("z", FieldKind::Float),
    FieldSpec::new("id", FieldKind::Int),
];

const PNEUMATICS_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("time", FieldKind::Text),
    FieldSpec::new("shutter", FieldKind::Enum(DOOR_STATES)),
    FieldSpec::new("shutter_label", FieldKind::Text),
    FieldSpec::new("left", FieldKind::Enum(DOOR_STATES)),
    FieldSpec::new("left_label", FieldKind::Text),
    FieldSpec::new("right", FieldKind::Enum(DOOR_STATES)),
    FieldSpec::new("right_label", FieldKind::Text),
    FieldSpec::new("air", FieldKind::Enum(BINARY)),
    FieldSpec::new("air_label", FieldKind::Text),
    FieldSpec::new("id", FieldKind::Int),
];

const DEWAR_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("time", FieldKind::Text),
    FieldSpec::new("blue_vent", FieldKind::Enum(&["open", "closed"])),
    FieldSpec::new("red_vent", FieldKind::Enum(&["open", "closed"])),
    FieldSpec::new("blue_thermistor", FieldKind::Enum(&["cold", "warm"])),
    FieldSpec::new("red_thermistor", FieldKind::Enum(&["cold", "warm"])),
    FieldSpec::new("id", FieldKind::Int),
];

const TIME_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("time", FieldKind::Text),
    FieldSpec::new("set_time", FieldKind::Text),
    FieldSpec::new("boot_label", FieldKind::Text),
    FieldSpec::new("boot_time", FieldKind::Text),
    FieldSpec::new("id", FieldKind::Int),
];

const VERSION_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("time", FieldKind::Text),
    FieldSpec::new("label", FieldKind::Text),
    FieldSpec::new("version", FieldKind::Text),
    FieldSpec::new("id", FieldKind::Int),
];

const VACUUM_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("time", FieldKind::Text),
    FieldSpec::new("red", FieldKind::Float),
    FieldSpec::new("red_units", FieldKind::Text),
    FieldSpec::new("blue", FieldKind::Float),
    FieldSpec::new("blue_units", FieldKind::Text),
    FieldSpec::new("id", FieldKind::Int),
];

const ERROR_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("time", FieldKind::Text),
    FieldSpec::new("code", FieldKind::Int),
    FieldSpec::new("message", FieldKind::Text),
    FieldSpec::new("id", FieldKind::Int),
];

/// Kinds of sentence the mech produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SentenceKind {
    /// Motor status
    Motor,
    /// Environment sensors
    Environment,
    /// Accelerometer orientation
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
    /// Error report
    Error,
}

impl SentenceKind {
    /// Three-letter tag on the wire.
    pub fn tag(&self) -> &'static str {
        match self {
            SentenceKind::Motor => "MTR",
            SentenceKind::Environment => "ENV",
            SentenceKind::Orientation => "ORI",
            SentenceKind::Pneumatics => "PNU",
            SentenceKind::Dewar => "LN2",
            SentenceKind::Time => "TIM",
            SentenceKind::Version => "VER",
            SentenceKind::Vacuum => "VAC",
            SentenceKind::Error => "ERR",
        }
    }

    /// Parse a wire tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "MTR" => SentenceKind::Motor,
            "ENV" => SentenceKind::Environment,
            "ORI" => SentenceKind::Orientation,
            "PNU" => SentenceKind::Pneumatics,
            "LN2" => SentenceKind::Dewar,
            "TIM" => SentenceKind::Time,
            "VER" => SentenceKind::Version,
            "VAC" => SentenceKind::Vacuum,
            "ERR" => SentenceKind::Error,
            _ => return None,
        })
    }

    /// Positional schema of the sentence, command id included.
    pub fn schema(&self) -> &'static [FieldSpec] {
        match self {
            SentenceKind::Motor => MOTOR_FIELDS,
            SentenceKind::Environment => ENVIRONMENT_FIELDS,
            SentenceKind::Orientation => ORIENTATION_FIELDS,
            SentenceKind::Pneumatics => PNEUMATICS_FIELDS,
            SentenceKind::Dewar => DEWAR_FIELDS,
            SentenceKind::Time => TIME_FIELDS,
            SentenceKind::Version => VERSION_FIELDS,
            SentenceKind::Vacuum => VACUUM_FIELDS,
            SentenceKind::Error => ERROR_FIELDS,
        }
    }
}

/// One decoded reply sentence.
#[derive(Debug, Clone, PartialEq)]
pub struct MechReply {
    /// Unit that produced the sentence (e.g. `S1`)
    pub source: String,
    /// Sentence kind
    pub kind: SentenceKind,
    /// Typed fields, in schema order, with the source tag and kind stripped
    pub values: Vec<FieldValue>,
    /// The sentence as received
    pub raw: String,
}

impl MechReply {
    /// Look up a field by schema name.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.kind
            .schema()
            .iter()
            .position(|spec| spec.name == name)
            .and_then(|idx| self.values.get(idx))
    }

    /// Numeric field, or a protocol error naming the missing field.
    pub fn f64(&self, name: &str) -> AppResult<f64> {
        self.get(name)
            .and_then(FieldValue::as_f64)
            .ok_or_else(|| self.missing(name))
    }

    /// Integer field.
    pub fn i64(&self, name: &str) -> AppResult<i64> {
        self.get(name)
            .and_then(FieldValue::as_i64)
            .ok_or_else(|| self.missing(name))
    }

    /// Enum or text field.
    pub fn str(&self, name: &str) -> AppResult<&str> {
        self.get(name)
            .and_then(FieldValue::as_str)
            .ok_or_else(|| self.missing(name))
    }

    /// Command id echoed by the mech.
    pub fn command_id(&self) -> Option<i64> {
        self.get("id").and_then(FieldValue::as_i64)
    }

    fn missing(&self, name: &str) -> DaqError {
        DaqError::Protocol(format!(
            "{} sentence has no field {:?}",
            self.kind.tag(),
            name
        ))
    }
}

/// All sentences returned for one command.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MechResponse {
    /// Sentences in arrival order
    pub replies: Vec<MechReply>,
    /// Complete reply text, prompt included
    pub raw: String,
}

impl MechResponse {
    /// First sentence of a kind.
    pub fn find(&self, kind: SentenceKind) -> Option<&MechReply> {
        self.replies.iter().find(|r| r.kind == kind)
    }

    /// First sentence of a kind, or a protocol error if the mech did not send one.
    pub fn expect(&self, kind: SentenceKind) -> AppResult<&MechReply> {
        self.find(kind).ok_or_else(|| {
            DaqError::Protocol(format!(
                "expected a {} sentence in reply {:?}",
                kind.tag(),
                self.raw
            ))
        })
    }
}

/// NMEA checksum: XOR of all bytes of the sentence body.
pub fn nmea_checksum(body: &str) -> u8 {
    body.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// Frame a command for the wire.
pub fn encode_command(command: &str, id: Option<u32>) -> String {
    match id {
        Some(id) => format!("{command};{id}\r"),
        None => format!("{command}\r"),
    }
}

/// Render a sentence with its checksum (used by the simulated mech and tests).
pub fn format_sentence(source: &str, kind: SentenceKind, fields: &[String]) -> String {
    let body = format!("{source}{},{}", kind.tag(), fields.join(","));
    format!("${body}*{:02X}", nmea_checksum(&body))
}

/// Whether a buffer holds a complete reply.
pub fn is_complete(buffer: &[u8]) -> bool {
    buffer.contains(&PROMPT) || is_reboot(buffer)
}

fn is_reboot(buffer: &[u8]) -> bool {
    std::str::from_utf8(buffer)
        .map(|s| s.trim_matches(|c: char| c.is_whitespace() || c == '\0') == REBOOT_MARKER)
        .unwrap_or(false)
}

/// Decode a complete reply.
///
/// Lines that do not start with `$` (command echo, the prompt) are skipped. A line
/// that starts with `$` but does not match its schema fails the whole reply. When
/// `expected_id` is set every sentence must echo it.
pub fn parse_response(raw: &str, expected_id: Option<u32>) -> AppResult<MechResponse> {
    if is_reboot(raw.as_bytes()) {
        return Err(DaqError::MechRebooted);
    }

    let mut replies = Vec::new();
    for line in raw.split(['\r', '\n', '\0']) {
        let line = line.trim();
        if !line.starts_with('$') {
            continue;
        }
        let reply = parse_sentence(line)?;

        if reply.kind == SentenceKind::Error {
            return Err(DaqError::MechReported {
                code: reply.i64("code")?,
                message: reply.str("message")?.to_string(),
            });
        }

        if let Some(expected) = expected_id {
            let echoed = reply.command_id();
            if echoed != Some(i64::from(expected)) {
                return Err(DaqError::Protocol(format!(
                    "reply for command {echoed:?} received while waiting for command {expected}"
                )));
            }
        }

        replies.push(reply);
    }

    Ok(MechResponse {
        replies,
        raw: raw.to_string(),
    })
}

/// Decode one sentence against its schema.
pub fn parse_sentence(line: &str) -> AppResult<MechReply> {
    let caps = SENTENCE_RE
        .captures(line)
        .ok_or_else(|| DaqError::Protocol(format!("malformed sentence {line:?}")))?;

    let body = &line[1..line.len() - 3];
    let expected = u8::from_str_radix(&caps["checksum"], 16)
        .map_err(|_| DaqError::Protocol(format!("bad checksum digits in {line:?}")))?;
    let actual = nmea_checksum(body);
    if actual != expected {
        return Err(DaqError::Protocol(format!(
            "checksum mismatch in {line:?}: expected {expected:02X}, computed {actual:02X}"
        )));
    }

    let kind = SentenceKind::from_tag(&caps["kind"])
        .ok_or_else(|| DaqError::Protocol(format!("unknown sentence kind in {line:?}")))?;

    let schema = kind.schema();
    let raw_fields: Vec<&str> = caps["fields"].split(',').collect();
    if raw_fields.len() != schema.len() {
        return Err(DaqError::Protocol(format!(
            "{} sentence has {} fields, expected {}: {line:?}",
            kind.tag(),
            raw_fields.len(),
            schema.len()
        )));
    }

    let values = schema
        .iter()
        .zip(raw_fields)
        .map(|(spec, raw)| spec.decode(raw))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| DaqError::Protocol(format!("{} sentence: {e}", kind.tag())))?;

    Ok(MechReply {
        source: caps["source"].to_string(),
        kind,
        values,
        raw: line.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn motor_sentence(id: u32) -> String {
        let fields: Vec<String> = [
            "2024-03-01T04:12:55", "a", "1500", "steps", "100", "steps/s", "250", "mA", "0",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain(std::iter::once(id.to_string()))
        .collect();
        format_sentence("S1", SentenceKind::Motor, &fields)
    }

    #[test]
    fn test_every_schema_ends_with_command_id() {
        let kinds = [
            SentenceKind::Motor,
            SentenceKind::Environment,
            SentenceKind::Orientation,
            SentenceKind::Pneumatics,
            SentenceKind::Dewar,
            SentenceKind::Time,
            SentenceKind::Version,
            SentenceKind::Vacuum,
            SentenceKind::Error,
        ];
        for kind in kinds {
            let schema = kind.schema();
            assert_eq!(schema[0].name, "time", "{kind:?}");
            assert_eq!(schema.last().map(|f| f.name), Some("id"), "{kind:?}");
            assert_eq!(SentenceKind::from_tag(kind.tag()), Some(kind));
        }
    }

    #[test]
    fn test_parse_motor_reply_strips_source_tag() {
        let raw = format!("{}\r\0\n>", motor_sentence(17));
        let response = parse_response(&raw, Some(17)).unwrap();
        assert_eq!(response.replies.len(), 1);

        let reply = &response.replies[0];
        assert_eq!(reply.source, "S1");
        assert_eq!(reply.kind, SentenceKind::Motor);
        assert_eq!(reply.values[0], FieldValue::Text("2024-03-01T04:12:55".into()));
        assert_eq!(reply.i64("position").unwrap(), 1500);
        assert_eq!(reply.str("motor").unwrap(), "a");
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let sentence = motor_sentence(3).replace(",1500,", ",1501,");
        let err = parse_response(&format!("{sentence}\r\n>"), Some(3)).unwrap_err();
        assert!(matches!(err, DaqError::Protocol(_)));
    }

    #[test]
    fn test_wrong_field_count_rejected_not_partially_parsed() {
        let sentence = format_sentence(
            "S1",
            SentenceKind::Orientation,
            &["t".into(), "0.1".into(), "0.2".into(), "4".into()],
        );
        assert!(parse_response(&format!("{sentence}\r\n>"), Some(4)).is_err());
    }

    #[test]
    fn test_mismatched_command_id_rejected() {
        let raw = format!("{}\r\n>", motor_sentence(8));
        let err = parse_response(&raw, Some(9)).unwrap_err();
        assert!(err.to_string().contains("command 9"));
    }

    #[test]
    fn test_error_sentence_surfaces_code_and_message() {
        let sentence = format_sentence(
            "S1",
            SentenceKind::Error,
            &["t".into(), "12".into(), "motor stalled".into(), "5".into()],
        );
        match parse_response(&format!("{sentence}\r\n>"), Some(5)) {
            Err(DaqError::MechReported { code, message }) => {
                assert_eq!(code, 12);
                assert_eq!(message, "motor stalled");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_reboot_marker() {
        assert!(is_complete(b"!"));
        assert!(matches!(
            parse_response("!", Some(1)),
            Err(DaqError::MechRebooted)
        ));
    }

    #[test]
    fn test_prompt_only_reply_is_empty_response() {
        let response = parse_response("ma1200;4\r\n>", Some(4)).unwrap();
        assert!(response.replies.is_empty());
        assert!(!is_complete(b"$S1MTR,partial"));
    }

    #[test]
    fn test_encode_command() {
        assert_eq!(encode_command("rp", Some(12)), "rp;12\r");
        assert_eq!(encode_command("!", None), "!\r");
    }
}
