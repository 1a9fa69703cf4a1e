//! Alert monitor behaviour with the thresholds of `config/default.toml`.

use std::sync::Arc;
use std::time::Duration;

use spectro_daq::alerts::{AlertKind, AlertMonitor};
use spectro_daq::ccd::MockCcdController;
use spectro_daq::config::Settings;
use spectro_daq::exposure::{ExposureFlavour, ExposureRequest, ExposureSequencer};
use spectro_daq::mech::mock::MockMech;
use spectro_daq::mech::MechLink;
use spectro_daq::telemetry::StaticTelemetry;
use spectro_daq::value::FieldValue;

fn load_settings() -> Settings {
    Settings::load_from(concat!(env!("CARGO_MANIFEST_DIR"), "/config/default.toml"))
        .expect("default configuration loads")
}

/// Monitor over one mock controller whose detectors all read nominal values.
fn create_monitor() -> (AlertMonitor, MockCcdController, MockMech) {
    let settings = load_settings();
    let ccd = MockCcdController::new("sp2", &["b2", "r2"]);
    ccd.set_parameter("b2_ccd_setpoint", -100.0);
    for detector in ["b2", "r2"] {
        ccd.set_status(&format!("{detector}_ccd_temp"), FieldValue::Float(-110.0));
        ccd.set_status(&format!("{detector}_ln2_temp"), FieldValue::Float(-182.5));
    }

    let mech = MockMech::new();
    let link = MechLink::new(mech.connector(), Duration::from_secs(1), None);
    let monitor = AlertMonitor::new(
        settings.alerts,
        link,
        vec![Arc::new(ccd.clone())],
        Duration::from_secs(1),
    );
    (monitor, ccd, mech)
}

#[tokio::test]
async fn test_ln2_alert_thresholds() {
    let (monitor, ccd, _mech) = create_monitor();

    // Threshold is -182.5 + 3 = -179.5
    ccd.set_status("r2_ln2_temp", FieldValue::Float(-181.0));
    monitor.poll_once().await;
    assert!(!monitor.is_active("r2_ln2_temperature"));

    ccd.set_status("r2_ln2_temp", FieldValue::Float(-178.0));
    monitor.poll_once().await;
    assert!(monitor.is_active("r2_ln2_temperature"));
    assert_eq!(monitor.active_alerts(), vec!["r2_ln2_temperature".to_string()]);

    ccd.set_status("r2_ln2_temp", FieldValue::Float(-182.0));
    monitor.poll_once().await;
    assert!(!monitor.is_active("r2_ln2_temperature"));

    let record = monitor.record("r2_ln2_temperature").unwrap();
    assert_eq!(record.kind, AlertKind::Ln2Temperature);
    assert_eq!(record.value, Some(FieldValue::Float(-182.0)));
    assert!(record.last_read.is_some());
}

#[tokio::test]
async fn test_ccd_alert_uses_each_setpoint_source() {
    let (monitor, ccd, _mech) = create_monitor();

    // b2 setpoint comes from the controller (-100), r2 is fixed at -110
    ccd.set_status("b2_ccd_temp", FieldValue::Float(-96.0));
    ccd.set_status("r2_ccd_temp", FieldValue::Float(-104.0));
    monitor.poll_once().await;

    assert!(!monitor.is_active("b2_ccd_temperature"));
    assert!(monitor.is_active("r2_ccd_temperature"));
}

#[tokio::test(start_paused = true)]
async fn test_stale_telemetry_raises_heartbeat() {
    let (monitor, ccd, _mech) = create_monitor();
    monitor.poll_once().await;
    assert!(monitor.active_alerts().is_empty());

    // Values stay within bounds, but no status read succeeds past the staleness window
    ccd.fail_status(100);
    monitor.poll_once().await;
    assert!(!monitor.is_active("heartbeat_sp2"));

    tokio::time::advance(Duration::from_secs(181)).await;
    monitor.poll_once().await;
    assert!(monitor.is_active("heartbeat_sp2"));
    assert!(!monitor.is_active("heartbeat_mech"));
    assert!(!monitor.is_active("r2_ln2_temperature"));

    ccd.fail_status(0);
    monitor.poll_once().await;
    assert!(!monitor.is_active("heartbeat_sp2"));
}

#[tokio::test(start_paused = true)]
async fn test_recovered_heartbeat_announces_clear_once() {
    let (monitor, ccd, _mech) = create_monitor();
    let mut events = monitor.subscribe();
    monitor.poll_once().await;

    ccd.fail_status(100);
    tokio::time::advance(Duration::from_secs(181)).await;
    monitor.poll_once().await;
    assert!(monitor.is_active("heartbeat_sp2"));

    ccd.fail_status(0);
    monitor.poll_once().await;
    monitor.poll_once().await;
    assert!(!monitor.is_active("heartbeat_sp2"));

    let mut raised = 0;
    let mut cleared = 0;
    while let Ok(event) = events.try_recv() {
        if event.name == "heartbeat_sp2" {
            if event.active {
                raised += 1;
            } else {
                cleared += 1;
            }
        }
    }
    assert_eq!(raised, 1);
    assert_eq!(cleared, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_mech_raises_its_own_heartbeat() {
    let (monitor, _ccd, mech) = create_monitor();
    mech.stall("rn");

    monitor.poll_once().await;
    tokio::time::advance(Duration::from_secs(181)).await;
    monitor.poll_once().await;

    assert!(monitor.is_active("heartbeat_mech"));
    assert!(!monitor.is_active("heartbeat_sp2"));
}

#[tokio::test(start_paused = true)]
async fn test_background_polling_continues_during_exposure() {
    let (monitor, ccd, mech) = create_monitor();
    let task = monitor.spawn();

    let mut settings = load_settings();
    let data_dir = tempfile::tempdir().unwrap();
    settings.output.data_dir = data_dir.path().to_path_buf();
    let link = MechLink::new(mech.connector(), Duration::from_secs(1), None);
    let sequencer = ExposureSequencer::new(
        &settings,
        link,
        vec![Arc::new(ccd.clone())],
        Arc::new(StaticTelemetry::new()),
    )
    .with_alerts(monitor.clone());

    let request = ExposureRequest::new("sp2", ExposureFlavour::Object, Duration::from_secs(900));
    let exposure = tokio::spawn(async move { sequencer.expose(request).await });

    // Raise an alert mid-integration; the monitor notices on its next cycle
    tokio::time::sleep(Duration::from_secs(30)).await;
    mech.set_dewar("red_vent", "open");
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(monitor.is_active("red_vent"));
    assert!(monitor.alive_at().is_some());

    let outcome = exposure.await.unwrap().unwrap();

    let cards = spectro_daq::storage::fits::read_cards(&outcome.files[0].path).unwrap();
    assert!(cards.iter().any(|c| c.starts_with("ALERTS  = 'red_vent'")));

    task.shutdown().await;
}
