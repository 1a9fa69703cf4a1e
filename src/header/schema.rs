//! The set of header keywords a data file may carry.
//!
//! Core and housekeeping keywords are generated by the assembler itself.
//! Configured keywords must appear in this table too: a configuration naming a
//! keyword outside it is rejected at load time, so a typo cannot silently produce
//! files with an unexpected data model.

use std::collections::HashSet;

use super::{HeaderValue, KeywordDefinition, KeywordSource};
use crate::error::{AppResult, DaqError};

/// Value type of a keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Integer
    Int,
    /// Real (integers accepted)
    Float,
    /// Character string
    Str,
}

impl ValueKind {
    /// Whether a value fits this kind.
    pub fn accepts(&self, value: &HeaderValue) -> bool {
        matches!(
            (self, value),
            (ValueKind::Int, HeaderValue::Int(_))
                | (ValueKind::Float, HeaderValue::Float(_) | HeaderValue::Int(_))
                | (ValueKind::Str, HeaderValue::Str(_))
        )
    }
}

/// Who produces a keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Exposure bookkeeping written for every file
    Core,
    /// Mech status collected during readout
    Housekeeping,
    /// Declared in the `header` configuration section
    Configured,
}

/// One legal keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeywordSchema {
    /// Keyword (at most 8 characters)
    pub name: &'static str,
    /// Value type
    pub kind: ValueKind,
    /// Default comment
    pub comment: &'static str,
    /// Producer
    pub origin: Origin,
}

const fn kw(name: &'static str, kind: ValueKind, comment: &'static str, origin: Origin) -> KeywordSchema {
    KeywordSchema {
        name,
        kind,
        comment,
        origin,
    }
}

use Origin::{Configured, Core, Housekeeping};
use ValueKind::{Float, Int, Str};

/// Every legal keyword, in header order for the generated ones.
pub const KEYWORDS: &[KeywordSchema] = &[
    kw("CCD", Str, "CCD name", Core),
    kw("CAMERAS", Str, "Camera(s) read out", Core),
    kw("FLAVOR", Str, "Exposure type", Core),
    kw("EXPOSURE", Int, "Exposure number", Core),
    kw("FILENAME", Str, "File basename", Core),
    kw("DATE-OBS", Str, "Start of integration (UTC)", Core),
    kw("TAI-BEG", Float, "MJD(TAI) seconds at start of integration", Core),
    kw("MJD", Int, "Observatory day number (SJD)", Core),
    kw("REQTIME", Float, "Requested exposure time [s]", Core),
    kw("EXPTIME", Float, "Exposure time [s]", Core),
    kw("WINMODE", Str, "Readout window", Core),
    kw("HARTMANN", Str, "Hartmanns: Left,Right,Out", Housekeeping),
    kw("COLLA", Int, "The position of the A collimator motor", Housekeeping),
    kw("COLLB", Int, "The position of the B collimator motor", Housekeeping),
    kw("COLLC", Int, "The position of the C collimator motor", Housekeeping),
    kw("MECHORIX", Float, "Orientation in X axis [cm/s2]", Housekeeping),
    kw("MECHORIY", Float, "Orientation in Y axis [cm/s2]", Housekeeping),
    kw("MECHORIZ", Float, "Orientation in Z axis [cm/s2]", Housekeeping),
    kw("B2CAMT", Float, "B2 camera temperature [degC]", Housekeeping),
    kw("B2CAMH", Float, "B2 camera RH [%]", Housekeeping),
    kw("R2CAMT", Float, "R2 camera temperature [degC]", Housekeeping),
    kw("R2CAMH", Float, "R2 camera RH [%]", Housekeeping),
    kw("COLLT", Float, "Collimator temperature [degC]", Housekeeping),
    kw("COLLH", Float, "Collimator RH [%]", Housekeeping),
    kw("SPECMT", Float, "specMech temperature [degC]", Housekeeping),
    kw("ALERTS", Str, "Active instrument alerts", Housekeeping),
    kw("OBSERVAT", Str, "Observatory", Configured),
    kw("TELESCOP", Str, "Telescope", Configured),
    kw("CARTID", Str, "Instrument ID", Configured),
    kw("CONFID", Int, "Configuration ID", Configured),
    kw("DESIGNID", Int, "Design ID associated with CONFIGID", Configured),
    kw("FIELDID", Int, "Field ID associated with CONFIGID", Configured),
    kw("RA", Float, "RA of telescope boresight [deg]", Configured),
    kw("DEC", Float, "Dec of telescope boresight [deg]", Configured),
    kw("ROTPOS", Float, "Rotator position [deg]", Configured),
    kw("AZ", Float, "Azimuth axis pos. [deg]", Configured),
    kw("ALT", Float, "Altitude axis pos. [deg]", Configured),
    kw("AIRMASS", Float, "Airmass at start of integration", Configured),
    kw("OFFRA", Float, "Absolute guider offset in RA", Configured),
    kw("OFFDEC", Float, "Absolute guider offset in DEC", Configured),
    kw("OFFPA", Float, "Absolute guider offset in PA", Configured),
    kw("SEEING", Float, "Seeing from the guider [arcsec]", Configured),
    kw("FF", Str, "FF lamps 1:On 0:Off", Configured),
    kw("NE", Str, "Ne lamps 1:On 0:Off", Configured),
    kw("HEAR", Str, "HeAr lamps 1:On 0:Off", Configured),
    kw("FFS", Str, "FFS 0:Closed 1:Open", Configured),
    kw("CCDTEMP", Float, "CCD temperature [degC]", Configured),
    kw("LN2TEMP", Float, "Cryogen can temperature [degC]", Configured),
    kw("CCDSETP", Float, "CCD temperature setpoint [degC]", Configured),
    kw("VACUUM", Float, "Dewar vacuum [Torr]", Configured),
];

/// Look up a keyword.
pub fn lookup(name: &str) -> Option<&'static KeywordSchema> {
    KEYWORDS.iter().find(|k| k.name == name)
}

/// Check configured keyword definitions against the schema.
///
/// Rejects unknown keywords, keywords the assembler generates itself, duplicates
/// and static values of the wrong type.
pub fn validate_definitions(definitions: &[KeywordDefinition]) -> AppResult<()> {
    let mut seen = HashSet::new();
    for definition in definitions {
        let schema = lookup(&definition.name).ok_or_else(|| {
            DaqError::Configuration(format!(
                "Header keyword '{}' is not part of the header schema",
                definition.name
            ))
        })?;

        if schema.origin != Origin::Configured {
            return Err(DaqError::Configuration(format!(
                "Header keyword '{}' is generated automatically and cannot be configured",
                definition.name
            )));
        }

        if !seen.insert(definition.name.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Header keyword '{}' configured twice",
                definition.name
            )));
        }

        let fixed = match &definition.source {
            KeywordSource::Static { value } => Some(value),
            _ => None,
        };
        for value in fixed.into_iter().chain(definition.default.as_ref()) {
            if !schema.kind.accepts(value) {
                return Err(DaqError::Configuration(format!(
                    "Header keyword '{}' expects a {:?} value, got {value:?}",
                    definition.name, schema.kind
                )));
            }
        }
    }
    Ok(())
}
