//! Per-exposure header records.
//!
//! A [`HeaderRecord`] is the ordered list of keyword cards written into a data
//! file. It is assembled fresh for every detector of every exposure from three
//! groups of cards:
//!
//! - **Core** cards describing the exposure itself (`EXPOSURE`, `FLAVOR`, `EXPTIME`, ...).
//! - **Housekeeping** cards built from mech status collected during readout
//!   (`HARTMANN`, `COLLA`, `MECHORIX`, ...).
//! - **Configured** cards declared by [`KeywordDefinition`]s: static constants,
//!   detector status values read from the CCD controller, and values pulled from
//!   peer instrument-status providers.
//!
//! Every keyword must be listed in the [`schema`]. A configured keyword that cannot
//! be resolved is omitted (or written with its default) and reported as a warning;
//! it never prevents the other cards or the file from being written.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod assembler;
pub mod schema;

pub use assembler::{HeaderAssembler, HeaderContext, Housekeeping, HousekeepingCollector};

/// Value of a header card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    /// Integer
    Int(i64),
    /// Real
    Float(f64),
    /// Character string
    Str(String),
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Int(v) => write!(f, "{v}"),
            HeaderValue::Float(v) => write!(f, "{v}"),
            HeaderValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

/// Conversion applied to a peer telemetry value before it becomes a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conversion {
    /// Keep the value as reported
    #[default]
    None,
    /// Lamp state: `ON` → `1 1 1 1`, `OFF` → `0 0 0 0`, anything else `? ? ? ?`
    Lamp,
}

/// Where a configured keyword takes its value from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeywordSource {
    /// A constant
    Static {
        /// Card value
        value: HeaderValue,
    },
    /// A status key of the CCD controller. `{ccd}` is replaced by the detector name.
    Detector {
        /// Status key, e.g. `{ccd}_ccd_temp`
        param: String,
    },
    /// A value published by a peer instrument-status provider
    Peer {
        /// Provider name
        provider: String,
        /// Key within the provider
        key: String,
        /// Position within a multi-valued key
        #[serde(default)]
        index: usize,
        /// Conversion applied to the value
        #[serde(default)]
        convert: Conversion,
    },
}

impl KeywordSource {
    /// Short name of the source kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            KeywordSource::Static { .. } => "static",
            KeywordSource::Detector { .. } => "detector",
            KeywordSource::Peer { .. } => "peer",
        }
    }
}

/// A configured header keyword.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordDefinition {
    /// Keyword, listed in [`schema::KEYWORDS`]
    pub name: String,
    /// Comment; the schema comment is used when unset
    #[serde(default)]
    pub comment: Option<String>,
    /// Value source
    pub source: KeywordSource,
    /// Value written when the source cannot be resolved. The card is omitted when unset.
    #[serde(default)]
    pub default: Option<HeaderValue>,
}

/// Which group produced a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardSource {
    /// Exposure bookkeeping
    Core,
    /// Mech status
    Housekeeping,
    /// Configured constant
    Static,
    /// CCD controller status
    Detector,
    /// Peer provider
    Peer,
    /// Configured default after a failed lookup
    Default,
}

/// One header card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderCard {
    /// Keyword
    pub name: String,
    /// Value
    pub value: HeaderValue,
    /// Comment
    pub comment: String,
    /// Producer
    pub source: CardSource,
}

/// Ordered keyword cards of one data file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderRecord {
    cards: Vec<HeaderCard>,
}

impl HeaderRecord {
    /// Empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a card, replacing the value of an existing card with the same name
    /// in place.
    pub fn set(
        &mut self,
        name: &str,
        value: impl Into<HeaderValue>,
        comment: &str,
        source: CardSource,
    ) {
        let card = HeaderCard {
            name: name.to_string(),
            value: value.into(),
            comment: comment.to_string(),
            source,
        };
        match self.cards.iter_mut().find(|c| c.name == name) {
            Some(existing) => *existing = card,
            None => self.cards.push(card),
        }
    }

    /// Card by keyword.
    pub fn get(&self, name: &str) -> Option<&HeaderCard> {
        self.cards.iter().find(|c| c.name == name)
    }

    /// Value by keyword.
    pub fn value(&self, name: &str) -> Option<&HeaderValue> {
        self.get(name).map(|c| &c.value)
    }

    /// Cards in order.
    pub fn cards(&self) -> &[HeaderCard] {
        &self.cards
    }

    /// Keywords in order.
    pub fn names(&self) -> Vec<&str> {
        self.cards.iter().map(|c| c.name.as_str()).collect()
    }

    /// Number of cards.
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Whether the record has no cards.
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_keeps_position() {
        let mut record = HeaderRecord::new();
        record.set("CCD", "r2", "CCD name", CardSource::Core);
        record.set("EXPTIME", 900.0, "Exposure time [s]", CardSource::Core);
        record.set("CCD", "b2", "CCD name", CardSource::Core);

        assert_eq!(record.names(), vec!["CCD", "EXPTIME"]);
        assert_eq!(record.value("CCD"), Some(&HeaderValue::Str("b2".into())));
    }

    #[test]
    fn test_keyword_definition_from_toml() {
        let definition: KeywordDefinition = toml::from_str(
            r#"
            name = "FF"
            source = { kind = "peer", provider = "lcolamps", key = "FF", convert = "lamp" }
            default = "? ? ? ?"
            "#,
        )
        .unwrap();

        assert_eq!(
            definition.source,
            KeywordSource::Peer {
                provider: "lcolamps".into(),
                key: "FF".into(),
                index: 0,
                convert: Conversion::Lamp,
            }
        );
        assert_eq!(definition.default, Some(HeaderValue::Str("? ? ? ?".into())));
    }
}
