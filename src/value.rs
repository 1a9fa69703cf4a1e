//! Tagged values shared by mech replies, controller telemetry and peer providers.
//!
//! Replies from the hardware arrive as loosely typed text. Rather than coercing text
//! into whatever the caller wants, every field is decoded against a [`FieldSpec`]
//! and either produces the declared [`FieldValue`] variant or is rejected.

use serde::{Deserialize, Serialize};

/// A single decoded telemetry value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// One of a fixed set of strings.
    Enum(String),
    /// Free text.
    Text(String),
}

impl FieldValue {
    /// Numeric view of the value. Integers widen to `f64`; text never converts.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer view of the value. Floats are not truncated.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// String view of enum and text values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Enum(s) | FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Enum(s) | FieldValue::Text(s) => f.write_str(s),
        }
    }
}

/// Expected shape of a positional field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldKind {
    /// Parses as `i64`.
    Int,
    /// Parses as `f64`.
    Float,
    /// Must be one of the listed strings.
    Enum(&'static [&'static str]),
    /// Anything, kept verbatim.
    Text,
}

/// A named positional field in a sentence schema.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSpec {
    /// Field name used for lookups.
    pub name: &'static str,
    /// Field shape.
    pub kind: FieldKind,
}

impl FieldSpec {
    /// Shorthand constructor used by the static schema tables.
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind }
    }

    /// Decode raw text into the declared kind.
    pub fn decode(&self, raw: &str) -> Result<FieldValue, String> {
        let raw = raw.trim();
        match self.kind {
            FieldKind::Int => raw
                .parse::<i64>()
                .map(FieldValue::Int)
                .map_err(|_| format!("field {:?}: expected integer, got {:?}", self.name, raw)),
            FieldKind::Float => raw
                .parse::<f64>()
                .map(FieldValue::Float)
                .map_err(|_| format!("field {:?}: expected float, got {:?}", self.name, raw)),
            FieldKind::Enum(allowed) => {
                if allowed.contains(&raw) {
                    Ok(FieldValue::Enum(raw.to_string()))
                } else {
                    Err(format!(
                        "field {:?}: {:?} is not one of {:?}",
                        self.name, raw, allowed
                    ))
                }
            }
            FieldKind::Text => Ok(FieldValue::Text(raw.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_enum_rejects_unknown_state() {
        let spec = FieldSpec::new("shutter", FieldKind::Enum(&["o", "c", "t"]));
        assert_eq!(spec.decode("o").unwrap(), FieldValue::Enum("o".into()));
        assert!(spec.decode("x").is_err());
    }

    #[test]
    fn test_decode_does_not_coerce() {
        let spec = FieldSpec::new("position", FieldKind::Int);
        assert!(spec.decode("12.5").is_err());
        assert_eq!(spec.decode(" -40 ").unwrap(), FieldValue::Int(-40));
    }

    #[test]
    fn test_numeric_views() {
        assert_eq!(FieldValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(FieldValue::Float(3.5).as_i64(), None);
        assert_eq!(FieldValue::Text("x".into()).as_f64(), None);
    }
}
