//! Health alert monitor.
//!
//! Polls the CCD controllers and the mech on a fixed interval, independently of
//! any exposure, and keeps one [`AlertRecord`] per monitored quantity:
//!
//! | Alert                       | Active when                                          |
//! |-----------------------------|------------------------------------------------------|
//! | `<ccd>_ccd_temperature`     | reading > setpoint + `ccd_temperature_max_increase`  |
//! | `<ccd>_ln2_temperature`     | reading > `ln2_base_temperature + ln2_temperature_max_increase` |
//! | configured vent name        | the `LN2` sentence field is in one of `bad_states`   |
//! | `heartbeat_<source>`        | no successful read from the source within `staleness` |
//!
//! Alerts latch: a value alert only clears on a fresh reading back within bounds.
//! A failed poll leaves value alerts untouched and only feeds the heartbeat alert
//! of its source. Temperature alerts may require `consecutive_readings` readings
//! on the other side of the threshold before they change state.
//!
//! Every poll re-announces the active alerts (warning) and announces each clear
//! once (info). Both are also published as [`AlertEvent`]s on a broadcast channel.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::ccd::{CcdController, TelemetryMap};
use crate::config::{AlertsConfig, DetectorAlertConfig, SetpointSource};
use crate::mech::{DewarStatus, MechLink};
use crate::value::FieldValue;

/// Name of the heartbeat source of the mech.
pub const MECH_SOURCE: &str = "mech";

/// Monitored quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// CCD temperature against its setpoint
    CcdTemperature,
    /// Cryogen can temperature against the base temperature
    Ln2Temperature,
    /// Dewar vent or thermistor state
    Vent,
    /// Telemetry source liveness
    Heartbeat,
}

/// Current state of one alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    /// Alert name
    pub name: String,
    /// Monitored quantity
    pub kind: AlertKind,
    /// Last value read, if any
    pub value: Option<FieldValue>,
    /// Whether the alert is raised
    pub active: bool,
    /// Last successful read of the quantity
    pub last_read: Option<DateTime<Utc>>,
    #[serde(skip)]
    streak: usize,
}

impl AlertRecord {
    fn new(name: String, kind: AlertKind) -> Self {
        Self {
            name,
            kind,
            value: None,
            active: false,
            last_read: None,
            streak: 0,
        }
    }
}

/// Published when an alert is (re)announced or cleared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    /// Alert name
    pub name: String,
    /// Monitored quantity
    pub kind: AlertKind,
    /// `true` for a raised alert, `false` for a clear
    pub active: bool,
    /// Human readable description
    pub message: String,
    /// When the event was produced
    pub timestamp: DateTime<Utc>,
}

struct MonitorState {
    records: BTreeMap<String, AlertRecord>,
    last_success: HashMap<String, Instant>,
    alive_at: Option<DateTime<Utc>>,
}

struct MonitorInner {
    config: AlertsConfig,
    link: MechLink,
    controllers: Vec<Arc<dyn CcdController>>,
    query_timeout: Duration,
    state: Mutex<MonitorState>,
    events: broadcast::Sender<AlertEvent>,
}

/// Alert monitor shared between the polling task and its readers.
#[derive(Clone)]
pub struct AlertMonitor {
    inner: Arc<MonitorInner>,
}

impl AlertMonitor {
    /// Monitor for the detectors and vents of `config`. Every status query is
    /// bounded by `query_timeout`.
    pub fn new(
        config: AlertsConfig,
        link: MechLink,
        controllers: Vec<Arc<dyn CcdController>>,
        query_timeout: Duration,
    ) -> Self {
        let mut records = BTreeMap::new();
        let mut add = |name: String, kind| {
            records.insert(name.clone(), AlertRecord::new(name, kind));
        };
        for detector in &config.detectors {
            add(format!("{}_ccd_temperature", detector.detector), AlertKind::CcdTemperature);
            add(format!("{}_ln2_temperature", detector.detector), AlertKind::Ln2Temperature);
        }
        for vent in &config.vents {
            add(vent.name.clone(), AlertKind::Vent);
        }

        let now = Instant::now();
        let mut last_success = HashMap::new();
        for source in controllers
            .iter()
            .map(|c| c.name().to_string())
            .chain(std::iter::once(MECH_SOURCE.to_string()))
        {
            add(heartbeat_name(&source), AlertKind::Heartbeat);
            last_success.insert(source, now);
        }

        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(MonitorInner {
                config,
                link,
                controllers,
                query_timeout,
                state: Mutex::new(MonitorState {
                    records,
                    last_success,
                    alive_at: None,
                }),
                events,
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MonitorState) -> R) -> R {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Subscribe to alert announcements.
    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of every alert.
    pub fn records(&self) -> Vec<AlertRecord> {
        self.with_state(|s| s.records.values().cloned().collect())
    }

    /// Snapshot of one alert.
    pub fn record(&self, name: &str) -> Option<AlertRecord> {
        self.with_state(|s| s.records.get(name).cloned())
    }

    /// Whether an alert is raised. Unknown alerts are never active.
    pub fn is_active(&self, name: &str) -> bool {
        self.record(name).map(|r| r.active).unwrap_or(false)
    }

    /// Names of the raised alerts.
    pub fn active_alerts(&self) -> Vec<String> {
        self.with_state(|s| {
            s.records
                .values()
                .filter(|r| r.active)
                .map(|r| r.name.clone())
                .collect()
        })
    }

    /// End of the last completed poll cycle.
    pub fn alive_at(&self) -> Option<DateTime<Utc>> {
        self.with_state(|s| s.alive_at)
    }

    /// Run one poll cycle.
    pub async fn poll_once(&self) {
        let timeout = self.inner.query_timeout;

        for controller in &self.inner.controllers {
            let source = controller.name().to_string();
            let status = match tokio::time::timeout(timeout, controller.status()).await {
                Ok(Ok(status)) => Some(status),
                Ok(Err(e)) => {
                    let error = format!("{e:#}");
                    warn!(controller = %source, %error, "Alert status poll failed");
                    None
                }
                Err(_) => {
                    warn!(controller = %source, ?timeout, "Alert status poll timed out");
                    None
                }
            };
            if let Some(status) = status {
                self.mark_alive(&source);
                for detector in self
                    .inner
                    .config
                    .detectors
                    .iter()
                    .filter(|d| d.controller == source)
                {
                    self.evaluate_detector(controller.as_ref(), detector, &status)
                        .await;
                }
            }
        }

        match self.inner.link.dewar(timeout).await {
            Ok(dewar) => {
                self.mark_alive(MECH_SOURCE);
                self.evaluate_vents(&dewar);
            }
            Err(e) => warn!(error = %e, "Alert dewar poll failed"),
        }

        self.evaluate_heartbeats();
        self.announce();
        self.with_state(|s| s.alive_at = Some(Utc::now()));
    }

    fn mark_alive(&self, source: &str) {
        self.with_state(|s| {
            s.last_success.insert(source.to_string(), Instant::now());
        });
    }

    async fn evaluate_detector(
        &self,
        controller: &dyn CcdController,
        detector: &DetectorAlertConfig,
        status: &TelemetryMap,
    ) {
        let config = &self.inner.config;
        let needed = config.consecutive_readings;

        match status.get(&detector.ccd_status_param).and_then(FieldValue::as_f64) {
            Some(temperature) => match self.setpoint(controller, &detector.setpoint).await {
                Some(setpoint) => {
                    let bad = temperature > setpoint + config.ccd_temperature_max_increase;
                    self.update(
                        &format!("{}_ccd_temperature", detector.detector),
                        FieldValue::Float(temperature),
                        bad,
                        needed,
                    );
                }
                None => warn!(detector = %detector.detector, "CCD temperature setpoint unavailable"),
            },
            None => debug!(
                detector = %detector.detector,
                key = %detector.ccd_status_param,
                "CCD temperature missing from status"
            ),
        }

        match status.get(&detector.ln2_status_param).and_then(FieldValue::as_f64) {
            Some(temperature) => {
                let bad = temperature > config.ln2_base_temperature + config.ln2_temperature_max_increase;
                self.update(
                    &format!("{}_ln2_temperature", detector.detector),
                    FieldValue::Float(temperature),
                    bad,
                    needed,
                );
            }
            None => debug!(
                detector = %detector.detector,
                key = %detector.ln2_status_param,
                "Cryogen temperature missing from status"
            ),
        }
    }

    async fn setpoint(&self, controller: &dyn CcdController, source: &SetpointSource) -> Option<f64> {
        match source {
            SetpointSource::Fixed(value) => Some(*value),
            SetpointSource::Parameter(name) => {
                match tokio::time::timeout(self.inner.query_timeout, controller.parameter(name)).await {
                    Ok(Ok(value)) => value,
                    _ => None,
                }
            }
        }
    }

    fn evaluate_vents(&self, dewar: &DewarStatus) {
        for vent in &self.inner.config.vents {
            match dewar.state(&vent.field) {
                Some(state) => {
                    let bad = vent.bad_states.iter().any(|b| b == state);
                    self.update(&vent.name, FieldValue::Enum(state.to_string()), bad, 1);
                }
                None => warn!(vent = %vent.name, field = %vent.field, "Vent state missing from dewar status"),
            }
        }
    }

    fn evaluate_heartbeats(&self) {
        let staleness = self.inner.config.staleness();
        self.with_state(|s| {
            let now = Instant::now();
            for (source, last) in &s.last_success {
                let stale = now.duration_since(*last) > staleness;
                if let Some(record) = s.records.get_mut(&heartbeat_name(source)) {
                    record.value = Some(FieldValue::Float(now.duration_since(*last).as_secs_f64()));
                    set_active(&self.inner.events, record, stale);
                }
            }
        });
    }

    fn update(&self, name: &str, value: FieldValue, bad: bool, needed: usize) {
        self.with_state(|s| {
            let Some(record) = s.records.get_mut(name) else {
                return;
            };
            record.value = Some(value);
            record.last_read = Some(Utc::now());

            if bad == record.active {
                record.streak = 0;
                return;
            }
            record.streak += 1;
            if record.streak >= needed {
                record.streak = 0;
                set_active(&self.inner.events, record, bad);
            }
        });
    }

    fn announce(&self) {
        for record in self.records().into_iter().filter(|r| r.active) {
            let value = record
                .value
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "?".to_string());
            warn!(alert = %record.name, kind = ?record.kind, %value, "Alert active");
            let _ = self.inner.events.send(AlertEvent {
                message: format!("{} alert active (value {value})", record.name),
                name: record.name,
                kind: record.kind,
                active: true,
                timestamp: Utc::now(),
            });
        }
    }

    /// Poll every `alerts.interval_ms` in a background task.
    pub fn spawn(&self) -> AlertTask {
        let monitor = self.clone();
        let interval = self.inner.config.interval();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task_handle = tokio::spawn(async move {
            info!(?interval, "Alert monitor started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => monitor.poll_once().await,
                    _ = &mut shutdown_rx => break,
                }
            }
            info!("Alert monitor stopped");
        });

        AlertTask {
            task_handle: Some(task_handle),
            shutdown_tx: Some(shutdown_tx),
        }
    }
}

/// Change the state of `record`, announcing a clear once.
///
/// Raises are announced by every poll while they stay active.
fn set_active(events: &broadcast::Sender<AlertEvent>, record: &mut AlertRecord, active: bool) {
    if record.active == active {
        return;
    }
    record.active = active;
    if !active {
        let event = AlertEvent {
            name: record.name.clone(),
            kind: record.kind,
            active: false,
            message: format!("{} back within bounds ({:?})", record.name, record.value),
            timestamp: Utc::now(),
        };
        info!(alert = %event.name, "Alert cleared");
        let _ = events.send(event);
    }
}

fn heartbeat_name(source: &str) -> String {
    format!("heartbeat_{source}")
}

/// Handle to the polling task started by [`AlertMonitor::spawn`].
pub struct AlertTask {
    task_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl AlertTask {
    /// Stop polling and wait for the task to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for AlertTask {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccd::MockCcdController;
    use crate::config::VentAlertConfig;
    use crate::mech::mock::MockMech;

    fn config(consecutive: usize) -> AlertsConfig {
        AlertsConfig {
            interval_ms: 60_000,
            staleness_ms: 180_000,
            consecutive_readings: consecutive,
            ccd_temperature_max_increase: 5.0,
            ln2_base_temperature: -182.5,
            ln2_temperature_max_increase: 3.0,
            detectors: vec![DetectorAlertConfig {
                controller: "sp2".into(),
                detector: "r2".into(),
                ccd_status_param: "r2_ccd_temp".into(),
                ln2_status_param: "r2_ln2_temp".into(),
                setpoint: SetpointSource::Parameter("r2_setpoint".into()),
            }],
            vents: vec![VentAlertConfig {
                name: "red_vent".into(),
                field: "red_vent".into(),
                bad_states: vec!["open".into()],
            }],
        }
    }

    fn monitor(consecutive: usize) -> (AlertMonitor, MockCcdController, MockMech) {
        let ccd = MockCcdController::new("sp2", &["b2", "r2"]);
        ccd.set_parameter("r2_setpoint", -110.0);
        ccd.set_status("r2_ccd_temp", FieldValue::Float(-110.0));
        ccd.set_status("r2_ln2_temp", FieldValue::Float(-182.0));
        let mech = MockMech::new();
        let link = MechLink::new(mech.connector(), Duration::from_secs(1), None);
        let monitor = AlertMonitor::new(
            config(consecutive),
            link,
            vec![Arc::new(ccd.clone())],
            Duration::from_secs(1),
        );
        (monitor, ccd, mech)
    }

    #[tokio::test]
    async fn test_ccd_temperature_against_parameter_setpoint() {
        let (monitor, ccd, _mech) = monitor(1);

        monitor.poll_once().await;
        assert!(!monitor.is_active("r2_ccd_temperature"));

        ccd.set_status("r2_ccd_temp", FieldValue::Float(-104.0));
        monitor.poll_once().await;
        assert!(monitor.is_active("r2_ccd_temperature"));
        assert!(monitor.alive_at().is_some());
    }

    #[tokio::test]
    async fn test_consecutive_readings_required() {
        let (monitor, ccd, _mech) = monitor(2);
        ccd.set_status("r2_ln2_temp", FieldValue::Float(-170.0));

        monitor.poll_once().await;
        assert!(!monitor.is_active("r2_ln2_temperature"));
        monitor.poll_once().await;
        assert!(monitor.is_active("r2_ln2_temperature"));

        // A single good reading is not enough to clear it either
        ccd.set_status("r2_ln2_temp", FieldValue::Float(-182.0));
        monitor.poll_once().await;
        assert!(monitor.is_active("r2_ln2_temperature"));
    }

    #[tokio::test]
    async fn test_failed_poll_keeps_value_alerts() {
        let (monitor, ccd, _mech) = monitor(1);
        ccd.set_status("r2_ln2_temp", FieldValue::Float(-170.0));
        monitor.poll_once().await;
        assert!(monitor.is_active("r2_ln2_temperature"));

        ccd.set_status("r2_ln2_temp", FieldValue::Float(-182.0));
        ccd.fail_status(1);
        monitor.poll_once().await;
        assert!(monitor.is_active("r2_ln2_temperature"));

        monitor.poll_once().await;
        assert!(!monitor.is_active("r2_ln2_temperature"));
    }

    #[tokio::test]
    async fn test_vent_alert_and_events() {
        let (monitor, _ccd, mech) = monitor(1);
        let mut events = monitor.subscribe();

        mech.set_dewar("red_vent", "open");
        monitor.poll_once().await;
        assert!(monitor.is_active("red_vent"));
        let event = events.recv().await.unwrap();
        assert_eq!(event.name, "red_vent");
        assert!(event.active);

        mech.set_dewar("red_vent", "closed");
        monitor.poll_once().await;
        assert!(!monitor.is_active("red_vent"));
        let event = events.recv().await.unwrap();
        assert_eq!(event.name, "red_vent");
        assert!(!event.active);
        assert_eq!(monitor.active_alerts(), Vec::<String>::new());
    }
}
