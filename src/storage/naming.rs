//! Output paths and observatory dates.
//!
//! File and directory names are rendered from `strfmt` templates with these
//! variables:
//!
//! | Variable        | Example    |
//! |-----------------|------------|
//! | `{mjd}`         | `60370`    |
//! | `{ccd}`         | `r2`       |
//! | `{controller}`  | `sp2`      |
//! | `{exposure_no}` | `412`      |
//! | `{flavour}`     | `object`   |
//!
//! Format specs apply, so `sdR-{ccd}-{exposure_no:0>8}.fit` renders as
//! `sdR-r2-00000412.fit`.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::config::OutputConfig;
use crate::error::{AppResult, DaqError};
use crate::exposure::ExposureFlavour;

/// MJD of the Unix epoch.
const UNIX_EPOCH_MJD: f64 = 40_587.0;

/// TAI - UTC since 2017-01-01.
pub const TAI_UTC_OFFSET_SECS: f64 = 37.0;

/// Modified Julian Date of an instant.
pub fn mjd(at: DateTime<Utc>) -> f64 {
    let seconds = at.timestamp() as f64 + f64::from(at.timestamp_subsec_micros()) / 1e6;
    UNIX_EPOCH_MJD + seconds / 86_400.0
}

/// Observatory day number: the MJD rolled over at 16:48 UTC, so a whole night
/// shares one number.
pub fn sjd(at: DateTime<Utc>) -> i64 {
    (mjd(at) + 0.3).floor() as i64
}

/// Seconds since MJD 0 on the TAI scale.
pub fn tai_seconds(at: DateTime<Utc>) -> f64 {
    mjd(at) * 86_400.0 + TAI_UTC_OFFSET_SECS
}

/// Values substituted into naming templates.
#[derive(Debug, Clone)]
pub struct NamingContext {
    /// Observatory day number
    pub mjd: i64,
    /// Detector
    pub ccd: String,
    /// Controller
    pub controller: String,
    /// Exposure number
    pub exposure_no: u32,
    /// Flavour
    pub flavour: ExposureFlavour,
}

impl NamingContext {
    fn variables(&self) -> HashMap<String, String> {
        HashMap::from([
            ("mjd".to_string(), self.mjd.to_string()),
            ("ccd".to_string(), self.ccd.clone()),
            ("controller".to_string(), self.controller.clone()),
            ("exposure_no".to_string(), self.exposure_no.to_string()),
            ("flavour".to_string(), self.flavour.to_string()),
        ])
    }
}

/// Render one template.
pub fn render(template: &str, context: &NamingContext) -> AppResult<String> {
    strfmt::strfmt(template, &context.variables()).map_err(|e| {
        DaqError::Configuration(format!("Cannot render template '{template}': {e}"))
    })
}

/// Full path of a data file: `data_dir/<path_template>/<file_template>`.
pub fn output_path(
    config: &OutputConfig,
    file_template: &str,
    context: &NamingContext,
) -> AppResult<PathBuf> {
    let directory = render(&config.path_template, context)?;
    let file = render(file_template, context)?;
    if file.contains('/') || file.is_empty() {
        return Err(DaqError::Configuration(format!(
            "File template '{file_template}' must render to a plain file name, got '{file}'"
        )));
    }
    Ok(config.data_dir.join(directory).join(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn context() -> NamingContext {
        NamingContext {
            mjd: 60_370,
            ccd: "r2".to_string(),
            controller: "sp2".to_string(),
            exposure_no: 412,
            flavour: ExposureFlavour::Arc,
        }
    }

    #[test]
    fn test_default_template() {
        let name = render("sdR-{ccd}-{exposure_no:0>8}.fit", &context()).unwrap();
        assert_eq!(name, "sdR-r2-00000412.fit");
    }

    #[test]
    fn test_unknown_variable_rejected() {
        assert!(render("{night}-{ccd}.fit", &context()).is_err());
    }

    #[test]
    fn test_sjd_rolls_over_in_the_afternoon() {
        // 2024-03-01 00:00 UTC is MJD 60370.0
        let midnight = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        assert!((mjd(midnight) - 60_370.0).abs() < 1e-9);
        assert_eq!(sjd(midnight), 60_370);

        let afternoon = Utc.with_ymd_and_hms(2024, 3, 1, 17, 0, 0).unwrap();
        assert_eq!(sjd(afternoon), 60_371);
    }

    #[test]
    fn test_output_path() {
        let config = OutputConfig {
            data_dir: PathBuf::from("/data/spectro"),
            path_template: "{mjd}".to_string(),
            file_template: "sdR-{ccd}-{exposure_no:0>8}.fit".to_string(),
            checksum: Default::default(),
            counter_file: "nextExposureNumber".to_string(),
        };
        let path = output_path(&config, &config.file_template, &context()).unwrap();
        assert_eq!(path, PathBuf::from("/data/spectro/60370/sdR-r2-00000412.fit"));
    }
}
