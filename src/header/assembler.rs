//! Header assembly and housekeeping collection.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::schema::{self, ValueKind};
use super::{CardSource, Conversion, HeaderRecord, HeaderValue, KeywordDefinition, KeywordSource};
use crate::alerts::AlertMonitor;
use crate::ccd::{CcdController, TelemetryMap};
use crate::error::DaqError;
use crate::exposure::ExposureRequest;
use crate::mech::{Environment, MechLink, Orientation, PneumaticStatus};
use crate::motion::MotorId;
use crate::storage::naming;
use crate::telemetry::PeerTelemetry;
use crate::value::FieldValue;

/// Exposure facts needed for the core cards of one file.
#[derive(Debug, Clone)]
pub struct HeaderContext<'a> {
    /// Request being executed
    pub request: &'a ExposureRequest,
    /// Detector of this file
    pub detector: &'a str,
    /// Every detector read out in the exposure
    pub cameras: &'a [String],
    /// Exposure number
    pub exposure_no: u32,
    /// File basename
    pub filename: &'a str,
    /// Start of integration
    pub integration_started: DateTime<Utc>,
    /// Measured integration time in seconds
    pub exposure_time: f64,
}

/// Telemetry collected while the detectors read out.
///
/// Every field is optional: a failed query leaves its field empty and adds an
/// entry to `failures`.
#[derive(Debug, Clone, Default)]
pub struct Housekeeping {
    /// Shutter and Hartmann doors
    pub pneumatics: Option<PneumaticStatus>,
    /// Raw collimator positions
    pub motors: BTreeMap<MotorId, i64>,
    /// Accelerometer
    pub orientation: Option<Orientation>,
    /// Temperature and humidity sensors
    pub environment: Option<Environment>,
    /// CCD controller status
    pub detector_status: Option<TelemetryMap>,
    /// Peer values by `(provider, key)`
    pub peers: HashMap<(String, String), Vec<FieldValue>>,
    /// Names of the active alerts
    pub active_alerts: Option<Vec<String>>,
    /// Housekeeping errors, one per failed query
    pub failures: Vec<String>,
}

impl Housekeeping {
    fn record_failure(&mut self, field: &str, reason: impl ToString) {
        let err = DaqError::Housekeeping {
            field: field.to_string(),
            reason: reason.to_string(),
        };
        tracing::warn!(field, error = %err, "Housekeeping collection failed");
        self.failures.push(err.to_string());
    }
}

/// Gathers [`Housekeeping`] from the mech, the CCD controller and peer providers.
#[derive(Clone)]
pub struct HousekeepingCollector {
    link: MechLink,
    ccd: Arc<dyn CcdController>,
    peers: Arc<dyn PeerTelemetry>,
    alerts: Option<AlertMonitor>,
    keywords: Vec<KeywordDefinition>,
    timeout: Duration,
}

impl HousekeepingCollector {
    /// Collector for the configured `keywords`. Each query is bounded by `timeout`.
    pub fn new(
        link: MechLink,
        ccd: Arc<dyn CcdController>,
        peers: Arc<dyn PeerTelemetry>,
        keywords: Vec<KeywordDefinition>,
        timeout: Duration,
    ) -> Self {
        Self {
            link,
            ccd,
            peers,
            alerts: None,
            keywords,
            timeout,
        }
    }

    /// Include the active alerts of `monitor`.
    pub fn with_alerts(mut self, monitor: AlertMonitor) -> Self {
        self.alerts = Some(monitor);
        self
    }

    /// Collect everything. Never fails; missing pieces are listed in `failures`.
    pub async fn collect(&self) -> Housekeeping {
        let (mut housekeeping, status, peers) =
            tokio::join!(self.collect_mech(), self.collect_status(), self.collect_peers());

        match status {
            Ok(status) => housekeeping.detector_status = Some(status),
            Err(reason) => housekeeping.record_failure("detector_status", reason),
        }
        for (provider, key, values) in peers {
            match values {
                Some(values) => {
                    housekeeping.peers.insert((provider, key), values);
                }
                None => housekeeping.record_failure(&format!("{provider}.{key}"), "no value"),
            }
        }
        housekeeping.active_alerts = self.alerts.as_ref().map(|m| m.active_alerts());

        tracing::debug!(
            failures = housekeeping.failures.len(),
            "Housekeeping collected"
        );
        housekeeping
    }

    async fn collect_mech(&self) -> Housekeeping {
        let mut hk = Housekeeping::default();
        let timeout = self.timeout;

        match self.link.pneumatics(timeout).await {
            Ok(status) => hk.pneumatics = Some(status),
            Err(e) => hk.record_failure("pneumatics", e),
        }
        for motor in MotorId::ALL {
            match self.link.motor_status(motor, timeout).await {
                Ok(status) => {
                    hk.motors.insert(motor, status.position);
                }
                Err(e) => hk.record_failure(&format!("motor {motor}"), e),
            }
        }
        match self.link.orientation(timeout).await {
            Ok(orientation) => hk.orientation = Some(orientation),
            Err(e) => hk.record_failure("orientation", e),
        }
        match self.link.environment(timeout).await {
            Ok(environment) => hk.environment = Some(environment),
            Err(e) => hk.record_failure("environment", e),
        }
        hk
    }

    async fn collect_status(&self) -> Result<TelemetryMap, String> {
        let wanted = self
            .keywords
            .iter()
            .any(|k| matches!(k.source, KeywordSource::Detector { .. }));
        if !wanted {
            return Ok(TelemetryMap::new());
        }
        match tokio::time::timeout(self.timeout, self.ccd.status()).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(_) => Err(format!("no status within {:?}", self.timeout)),
        }
    }

    async fn collect_peers(&self) -> Vec<(String, String, Option<Vec<FieldValue>>)> {
        let lookups = self.keywords.iter().filter_map(|k| match &k.source {
            KeywordSource::Peer { provider, key, .. } => Some((provider.clone(), key.clone())),
            _ => None,
        });
        let requests = lookups.map(|(provider, key)| async move {
            let values = tokio::time::timeout(self.timeout, self.peers.get(&provider, &key))
                .await
                .ok()
                .flatten();
            (provider, key, values)
        });
        futures::future::join_all(requests).await
    }
}

/// Builds the [`HeaderRecord`] of one file.
#[derive(Debug, Clone, Default)]
pub struct HeaderAssembler {
    keywords: Vec<KeywordDefinition>,
}

fn comment(name: &str) -> &'static str {
    schema::lookup(name).map(|k| k.comment).unwrap_or("")
}

impl HeaderAssembler {
    /// Assembler appending `keywords` after the generated cards.
    pub fn new(keywords: Vec<KeywordDefinition>) -> Self {
        Self { keywords }
    }

    /// Configured keywords.
    pub fn keywords(&self) -> &[KeywordDefinition] {
        &self.keywords
    }

    /// Build the header. Returns the record and one warning per configured keyword
    /// that could not be resolved.
    pub fn assemble(
        &self,
        context: &HeaderContext<'_>,
        housekeeping: &Housekeeping,
    ) -> (HeaderRecord, Vec<String>) {
        let mut record = HeaderRecord::new();
        let mut warnings = Vec::new();

        Self::core_cards(&mut record, context);
        Self::housekeeping_cards(&mut record, housekeeping);

        for definition in &self.keywords {
            let Some(schema) = schema::lookup(&definition.name) else {
                continue;
            };
            let comment = definition.comment.as_deref().unwrap_or(schema.comment);

            match self.resolve(definition, context.detector, housekeeping, schema.kind) {
                Ok((value, source)) => record.set(&definition.name, value, comment, source),
                Err(reason) => {
                    tracing::warn!(
                        keyword = %definition.name,
                        source = definition.source.kind(),
                        %reason,
                        "Header keyword not resolved"
                    );
                    warnings.push(format!("{}: {reason}", definition.name));
                    if let Some(default) = &definition.default {
                        record.set(&definition.name, default.clone(), comment, CardSource::Default);
                    }
                }
            }
        }

        (record, warnings)
    }

    fn core_cards(record: &mut HeaderRecord, ctx: &HeaderContext<'_>) {
        let core = |record: &mut HeaderRecord, name: &str, value: HeaderValue| {
            record.set(name, value, comment(name), CardSource::Core)
        };
        let request = ctx.request;

        core(record, "CCD", ctx.detector.into());
        core(record, "CAMERAS", ctx.cameras.join(" ").into());
        core(record, "FLAVOR", request.flavour.header_value().into());
        core(record, "EXPOSURE", i64::from(ctx.exposure_no).into());
        core(record, "FILENAME", ctx.filename.into());
        core(
            record,
            "DATE-OBS",
            ctx.integration_started
                .format("%Y-%m-%dT%H:%M:%S%.3f")
                .to_string()
                .into(),
        );
        core(record, "TAI-BEG", naming::tai_seconds(ctx.integration_started).into());
        core(record, "MJD", naming::sjd(ctx.integration_started).into());
        core(record, "REQTIME", request.exposure_time.as_secs_f64().into());
        core(record, "EXPTIME", ctx.exposure_time.into());
        core(record, "WINMODE", request.window.name().into());
    }

    fn housekeeping_cards(record: &mut HeaderRecord, hk: &Housekeeping) {
        let mut card = |name: &str, value: HeaderValue| {
            record.set(name, value, comment(name), CardSource::Housekeeping)
        };

        if let Some(pneumatics) = &hk.pneumatics {
            card("HARTMANN", pneumatics.hartmann_card().into());
        }
        for (motor, name) in [(MotorId::A, "COLLA"), (MotorId::B, "COLLB"), (MotorId::C, "COLLC")] {
            if let Some(position) = hk.motors.get(&motor) {
                card(name, (*position).into());
            }
        }
        if let Some(o) = &hk.orientation {
            card("MECHORIX", o.x.into());
            card("MECHORIY", o.y.into());
            card("MECHORIZ", o.z.into());
        }
        if let Some(env) = &hk.environment {
            card("B2CAMT", env.t0.into());
            card("B2CAMH", env.h0.into());
            card("R2CAMT", env.t1.into());
            card("R2CAMH", env.h1.into());
            card("COLLT", env.t2.into());
            card("COLLH", env.h2.into());
            card("SPECMT", env.mech_t.into());
        }
        if let Some(alerts) = &hk.active_alerts {
            let text = if alerts.is_empty() {
                "none".to_string()
            } else {
                alerts.join(",")
            };
            card("ALERTS", text.into());
        }
    }

    fn resolve(
        &self,
        definition: &KeywordDefinition,
        detector: &str,
        hk: &Housekeeping,
        kind: ValueKind,
    ) -> Result<(HeaderValue, CardSource), String> {
        match &definition.source {
            KeywordSource::Static { value } => Ok((coerce(value.clone(), kind)?, CardSource::Static)),
            KeywordSource::Detector { param } => {
                let key = param.replace("{ccd}", detector);
                let status = hk
                    .detector_status
                    .as_ref()
                    .ok_or_else(|| "detector status unavailable".to_string())?;
                let value = status
                    .get(&key)
                    .ok_or_else(|| format!("status key {key:?} not reported"))?;
                Ok((coerce(field_to_header(value), kind)?, CardSource::Detector))
            }
            KeywordSource::Peer {
                provider,
                key,
                index,
                convert,
            } => {
                let values = hk
                    .peers
                    .get(&(provider.clone(), key.clone()))
                    .ok_or_else(|| format!("{provider}.{key} unavailable"))?;
                let value = values
                    .get(*index)
                    .ok_or_else(|| format!("{provider}.{key} has no value at index {index}"))?;
                let value = match convert {
                    Conversion::None => field_to_header(value),
                    Conversion::Lamp => lamp_state(value).into(),
                };
                Ok((coerce(value, kind)?, CardSource::Peer))
            }
        }
    }
}

fn field_to_header(value: &FieldValue) -> HeaderValue {
    match value {
        FieldValue::Int(v) => HeaderValue::Int(*v),
        FieldValue::Float(v) => HeaderValue::Float(*v),
        FieldValue::Enum(s) | FieldValue::Text(s) => HeaderValue::Str(s.clone()),
    }
}

/// Card value of a lamp state.
pub fn lamp_state(value: &FieldValue) -> &'static str {
    match value.as_str().map(str::to_ascii_uppercase).as_deref() {
        Some("ON") => "1 1 1 1",
        Some("OFF") => "0 0 0 0",
        _ => "? ? ? ?",
    }
}

fn coerce(value: HeaderValue, kind: ValueKind) -> Result<HeaderValue, String> {
    match (kind, value) {
        (ValueKind::Float, HeaderValue::Int(v)) => Ok(HeaderValue::Float(v as f64)),
        (ValueKind::Int, HeaderValue::Float(v)) if v.fract() == 0.0 => Ok(HeaderValue::Int(v as i64)),
        (ValueKind::Str, HeaderValue::Int(v)) => Ok(HeaderValue::Str(v.to_string())),
        (ValueKind::Str, HeaderValue::Float(v)) => Ok(HeaderValue::Str(v.to_string())),
        (kind, value) if kind.accepts(&value) => Ok(value),
        (kind, value) => Err(format!("{value:?} is not a {kind:?} value")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exposure::ExposureFlavour;
    use crate::mech::{DoorState, MechLink};
    use chrono::TimeZone;

    fn request() -> ExposureRequest {
        ExposureRequest::new("sp2", ExposureFlavour::Object, Duration::from_secs(900))
    }

    fn peer(name: &str, provider: &str, key: &str, convert: Conversion) -> KeywordDefinition {
        KeywordDefinition {
            name: name.to_string(),
            comment: None,
            source: KeywordSource::Peer {
                provider: provider.to_string(),
                key: key.to_string(),
                index: 0,
                convert,
            },
            default: None,
        }
    }

    fn assemble(keywords: Vec<KeywordDefinition>, hk: &Housekeeping) -> (HeaderRecord, Vec<String>) {
        let request = request();
        let cameras = vec!["b2".to_string(), "r2".to_string()];
        let context = HeaderContext {
            request: &request,
            detector: "r2",
            cameras: &cameras,
            exposure_no: 412,
            filename: "sdR-r2-00000412.fit",
            integration_started: Utc.with_ymd_and_hms(2024, 3, 1, 4, 0, 0).unwrap(),
            exposure_time: 900.2,
        };
        HeaderAssembler::new(keywords).assemble(&context, hk)
    }

    #[test]
    fn test_core_cards_in_order() {
        let (record, warnings) = assemble(Vec::new(), &Housekeeping::default());
        assert!(warnings.is_empty());
        assert_eq!(
            record.names(),
            vec![
                "CCD", "CAMERAS", "FLAVOR", "EXPOSURE", "FILENAME", "DATE-OBS", "TAI-BEG", "MJD",
                "REQTIME", "EXPTIME", "WINMODE"
            ]
        );
        assert_eq!(record.value("FLAVOR"), Some(&HeaderValue::Str("science".into())));
        assert_eq!(record.value("CAMERAS"), Some(&HeaderValue::Str("b2 r2".into())));
        assert_eq!(record.value("MJD"), Some(&HeaderValue::Int(60_370)));
        assert_eq!(
            record.value("DATE-OBS"),
            Some(&HeaderValue::Str("2024-03-01T04:00:00.000".into()))
        );
    }

    #[test]
    fn test_housekeeping_cards() {
        let hk = Housekeeping {
            pneumatics: Some(PneumaticStatus {
                shutter: DoorState::Closed,
                left: DoorState::Closed,
                right: DoorState::Open,
                air_pressure: true,
            }),
            motors: BTreeMap::from([(MotorId::A, 1500), (MotorId::C, 1700)]),
            ..Default::default()
        };
        let (record, _) = assemble(Vec::new(), &hk);

        assert_eq!(record.value("HARTMANN"), Some(&HeaderValue::Str("Left".into())));
        assert_eq!(record.value("COLLA"), Some(&HeaderValue::Int(1500)));
        // Motor B failed to report: no card rather than a placeholder
        assert!(record.get("COLLB").is_none());
        assert_eq!(record.get("COLLC").unwrap().source, CardSource::Housekeeping);
        assert!(record.get("MECHORIX").is_none());
    }

    #[test]
    fn test_unresolved_keyword_does_not_stop_the_others() {
        let mut hk = Housekeeping::default();
        hk.peers.insert(
            ("lcolamps".into(), "FF".into()),
            vec![FieldValue::Enum("ON".into())],
        );
        hk.peers.insert(
            ("lcolamps".into(), "HeAr".into()),
            vec![FieldValue::Enum("UNKNOWN".into())],
        );

        let mut ne = peer("NE", "lcolamps", "Ne", Conversion::Lamp);
        ne.default = Some(HeaderValue::Str("? ? ? ?".into()));
        let keywords = vec![
            peer("FF", "lcolamps", "FF", Conversion::Lamp),
            ne,
            peer("HEAR", "lcolamps", "HeAr", Conversion::Lamp),
            peer("SEEING", "guider", "seeing", Conversion::None),
        ];
        let (record, warnings) = assemble(keywords, &hk);

        assert_eq!(record.value("FF"), Some(&HeaderValue::Str("1 1 1 1".into())));
        assert_eq!(record.value("HEAR"), Some(&HeaderValue::Str("? ? ? ?".into())));
        assert_eq!(record.get("NE").unwrap().source, CardSource::Default);
        assert!(record.get("SEEING").is_none());
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_detector_status_keyword() {
        let mut status = TelemetryMap::new();
        status.insert("r2_ccd_temp".into(), FieldValue::Float(-110.4));
        let hk = Housekeeping {
            detector_status: Some(status),
            ..Default::default()
        };
        let keywords = vec![KeywordDefinition {
            name: "CCDTEMP".into(),
            comment: None,
            source: KeywordSource::Detector {
                param: "{ccd}_ccd_temp".into(),
            },
            default: None,
        }];
        let (record, warnings) = assemble(keywords, &hk);

        assert!(warnings.is_empty());
        let card = record.get("CCDTEMP").unwrap();
        assert_eq!(card.value, HeaderValue::Float(-110.4));
        assert_eq!(card.comment, "CCD temperature [degC]");
    }

    #[tokio::test]
    async fn test_collector_survives_mech_failures() {
        use crate::ccd::MockCcdController;
        use crate::mech::mock::MockMech;
        use crate::telemetry::StaticTelemetry;

        let mech = MockMech::new();
        mech.fail_command("re", 1);
        let link = MechLink::new(mech.connector(), Duration::from_secs(1), None);
        let peers = Arc::new(StaticTelemetry::new());
        peers.set("lcolamps", "FF", vec![FieldValue::Enum("OFF".into())]);

        let collector = HousekeepingCollector::new(
            link,
            Arc::new(MockCcdController::new("sp2", &["r2"])),
            peers,
            vec![peer("FF", "lcolamps", "FF", Conversion::Lamp)],
            Duration::from_secs(1),
        );
        let hk = collector.collect().await;

        assert!(hk.environment.is_none());
        assert!(hk.orientation.is_some());
        assert_eq!(hk.motors.len(), 3);
        assert_eq!(hk.failures.len(), 1);
        assert!(hk.peers.contains_key(&("lcolamps".to_string(), "FF".to_string())));
    }
}
