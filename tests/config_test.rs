//! The shipped configuration loads, validates, and drives the motor safety checks.

use std::time::Duration;

use spectro_daq::config::{SetpointSource, Settings};
use spectro_daq::error::DaqError;
use spectro_daq::header::KeywordSource;
use spectro_daq::mech::mock::MockMech;
use spectro_daq::mech::{MechLink, MotorId};
use spectro_daq::motion::{MotorController, MoveRequest};
use spectro_daq::storage::ChecksumAlgorithm;

const DEFAULT_CONFIG: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/config/default.toml");

#[test]
fn test_default_config_loads() {
    let settings = Settings::load_from(DEFAULT_CONFIG).expect("default configuration loads");

    assert_eq!(settings.mech.port, 23);
    assert_eq!(settings.exposure.readout_deadlines(), (Duration::from_secs(40), Duration::from_secs(60)));
    assert_eq!(settings.exposure.fetch_deadlines(), (Duration::from_secs(5), Duration::from_secs(10)));
    assert_eq!(settings.alerts.ln2_base_temperature, -182.5);
    assert_eq!(settings.output.checksum, ChecksumAlgorithm::Sha256);
    assert_eq!(settings.controller("sp2").unwrap().detectors, vec!["b2", "r2"]);

    let setpoints: Vec<_> = settings.alerts.detectors.iter().map(|d| &d.setpoint).collect();
    assert_eq!(
        setpoints,
        vec![
            &SetpointSource::Parameter("b2_ccd_setpoint".into()),
            &SetpointSource::Fixed(-110.0)
        ]
    );

    let lamps = settings
        .header
        .keywords
        .iter()
        .filter(|k| matches!(k.source, KeywordSource::Peer { .. }) && k.default.is_some())
        .count();
    assert!(lamps >= 3);
}

#[test]
fn test_unknown_keyword_in_file_is_rejected_at_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    let text = std::fs::read_to_string(DEFAULT_CONFIG).unwrap()
        + "\n[[header.keywords]]\nname = \"LAMPS\"\nsource = { kind = \"static\", value = \"on\" }\n";
    std::fs::write(&path, text).unwrap();

    let err = Settings::load_from(&path).unwrap_err();
    assert!(matches!(err, DaqError::Configuration(ref m) if m.contains("LAMPS")));
}

#[test]
fn test_missing_file_is_config_error() {
    let err = Settings::load_from("/nonexistent/spectro.toml").unwrap_err();
    assert!(matches!(err, DaqError::Config(_)));
}

#[tokio::test]
async fn test_configured_calibration_bounds_moves() {
    let settings = Settings::load_from(DEFAULT_CONFIG).unwrap();
    let mock = MockMech::new();
    mock.set_motor_position(MotorId::A, 2000);
    mock.set_motor_position(MotorId::B, 2000);
    mock.set_motor_position(MotorId::C, 2000);
    let link = MechLink::new(mock.connector(), Duration::from_secs(1), None);
    let motors = MotorController::new(link, settings.motors.clone());

    // max_raw is 4000 in the shipped configuration
    let err = motors.move_absolute(MotorId::A, 4001).await.unwrap_err();
    assert!(matches!(err, DaqError::OutOfRange { max: 4000, .. }));

    let err = motors
        .move_compound(&[
            MoveRequest::absolute(MotorId::A, 1000),
            MoveRequest::absolute(MotorId::C, 1000),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::UnsafeCompoundMove(_)));
    assert!(mock.commands_starting_with("m").is_empty());

    // 400 microns over 4000 steps: 10 steps per micron
    motors
        .move_compound(&[
            MoveRequest::relative(MotorId::A, 5.0),
            MoveRequest::relative(MotorId::B, -5.0),
        ])
        .await
        .unwrap();
    assert_eq!(mock.motor_position(MotorId::A), 2050);
    assert_eq!(mock.motor_position(MotorId::B), 1950);
}
