//! End-to-end exposure sequencing against the simulated mech and CCD controller.
//!
//! All tests run on a paused tokio clock, so a 900 s integration and a 65 s
//! readout take no wall-clock time.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use spectro_daq::ccd::MockCcdController;
use spectro_daq::config::Settings;
use spectro_daq::error::{Checkpoint, DaqError};
use spectro_daq::exposure::{
    ExposureFlavour, ExposurePhase, ExposureRequest, ExposureResult, ExposureSequencer,
};
use spectro_daq::mech::mock::MockMech;
use spectro_daq::mech::{Door, DoorState, MechLink};
use spectro_daq::storage::{fits, verify_sidecar, ChecksumAlgorithm};
use spectro_daq::telemetry::StaticTelemetry;
use tempfile::TempDir;

struct Rig {
    sequencer: ExposureSequencer,
    ccd: MockCcdController,
    mech: MockMech,
    data_dir: TempDir,
}

/// Sequencer configured from `config/default.toml`, writing into a temporary directory.
fn create_rig() -> Rig {
    let mut settings = Settings::load_from(concat!(env!("CARGO_MANIFEST_DIR"), "/config/default.toml"))
        .expect("default configuration loads");
    let data_dir = tempfile::tempdir().expect("temp dir");
    settings.output.data_dir = data_dir.path().to_path_buf();

    let mech = MockMech::new();
    let link = MechLink::new(mech.connector(), Duration::from_secs(1), None);
    let ccd = MockCcdController::new("sp2", &["b2", "r2"]);
    let sequencer = ExposureSequencer::new(
        &settings,
        link,
        vec![Arc::new(ccd.clone())],
        Arc::new(StaticTelemetry::new()),
    );

    Rig {
        sequencer,
        ccd,
        mech,
        data_dir,
    }
}

fn science(seconds: u64) -> ExposureRequest {
    ExposureRequest::new("sp2", ExposureFlavour::Object, Duration::from_secs(seconds))
}

fn count_data_files(dir: &Path) -> usize {
    let mut count = 0;
    for entry in std::fs::read_dir(dir).unwrap().flatten() {
        let path = entry.path();
        if path.is_dir() {
            count += count_data_files(&path);
        } else if path.extension().is_some_and(|e| e == "fit") {
            count += 1;
        }
    }
    count
}

#[tokio::test(start_paused = true)]
async fn test_900s_exposure_traverses_every_phase() {
    let rig = create_rig();

    let sequencer = rig.sequencer.clone();
    let handle = tokio::spawn(async move { sequencer.expose(science(900)).await });

    // Mid-integration: shutter open, timer running
    tokio::time::sleep(Duration::from_secs(100)).await;
    let state = rig.sequencer.state("sp2").unwrap();
    assert_eq!(state.phase, ExposurePhase::Integrating);
    assert_eq!(state.checkpoint, Some(ExposurePhase::Preparing));
    assert!(state.integration_started.is_some());
    assert_eq!(rig.mech.door_state(Door::Shutter), DoorState::Open);

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.exposure_no, 1);
    assert_eq!(outcome.files.len(), 2);
    assert!(!outcome.warnings.iter().any(|w| w.contains("took")));

    let state = rig.sequencer.state("sp2").unwrap();
    assert_eq!(state.phase, ExposurePhase::Idle);
    assert_eq!(state.result, Some(ExposureResult::Success));
    assert_eq!(state.checkpoint, Some(ExposurePhase::Writing));

    assert_eq!(
        rig.ccd.calls(),
        vec!["configure", "flush", "purge", "start_integration", "start_readout", "fetch"]
    );
    assert_eq!(rig.mech.commands_starting_with("os").len(), 1);
    assert_eq!(rig.mech.commands_starting_with("cs").len(), 1);
    assert_eq!(rig.mech.door_state(Door::Shutter), DoorState::Closed);
    assert!(!rig.sequencer.is_busy("sp2"));
}

#[tokio::test(start_paused = true)]
async fn test_written_files_match_their_checksums() {
    let rig = create_rig();

    let outcome = rig.sequencer.expose(science(900)).await.unwrap();

    for file in &outcome.files {
        assert!(file.path.starts_with(rig.data_dir.path()));
        assert!(file
            .path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(&format!("sdR-{}-00000001", file.detector)));
        assert!(verify_sidecar(&file.path, ChecksumAlgorithm::Sha256).unwrap());

        // Recomputing over the file bytes reproduces the stored digest
        let digest = ChecksumAlgorithm::Sha256.digest_file(&file.path).unwrap();
        assert_eq!(digest, file.digest);
        let sidecar = std::fs::read_to_string(&file.checksum_path).unwrap();
        assert!(sidecar.starts_with(&digest));

        let cards = fits::read_cards(&file.path).unwrap();
        assert!(cards.iter().any(|c| c.starts_with("FLAVOR  = 'science '")));
        assert!(cards.iter().any(|c| c.starts_with("EXPOSURE=                    1")));
        assert!(cards.iter().any(|c| c.starts_with("OBSERVAT= 'APO     '")));
        assert!(cards.iter().any(|c| c.starts_with("FF      = '? ? ? ? '")));
    }
}

/// Advance the paused clock until `controller` reaches `phase`.
async fn wait_for_phase(sequencer: &ExposureSequencer, controller: &str, phase: ExposurePhase) {
    for _ in 0..2000 {
        if sequencer.state(controller).map(|s| s.phase) == Some(phase) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("{controller} never reached {phase:?}");
}

#[tokio::test(start_paused = true)]
async fn test_second_request_rejected_while_integrating() {
    let rig = create_rig();

    let sequencer = rig.sequencer.clone();
    let handle = tokio::spawn(async move { sequencer.expose(science(900)).await });
    tokio::time::sleep(Duration::from_secs(10)).await;
    let before = rig.sequencer.state("sp2").unwrap();

    let err = rig.sequencer.expose(science(30)).await.unwrap_err();
    assert!(matches!(err, DaqError::ExposureInProgress(ref c) if c == "sp2"));

    // The running exposure is untouched
    let after = rig.sequencer.state("sp2").unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.exposure_no, before.exposure_no);
    assert_eq!(after.phase, ExposurePhase::Integrating);

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.exposure_no, 1);

    // The rejected request did not consume an exposure number
    let next = rig.sequencer.expose(science(1)).await.unwrap();
    assert_eq!(next.exposure_no, 2);
}

#[tokio::test(start_paused = true)]
async fn test_second_request_rejected_while_reading_and_fetching() {
    let rig = create_rig();
    rig.ccd.set_readout_duration(Duration::from_secs(45));
    rig.ccd.set_fetch_duration(Duration::from_secs(8));

    let sequencer = rig.sequencer.clone();
    let handle = tokio::spawn(async move { sequencer.expose(science(60)).await });

    for phase in [ExposurePhase::Reading, ExposurePhase::Fetching] {
        wait_for_phase(&rig.sequencer, "sp2", phase).await;
        let err = rig.sequencer.expose(science(30)).await.unwrap_err();
        assert!(matches!(err, DaqError::ExposureInProgress(ref c) if c == "sp2"));
        assert_eq!(rig.sequencer.state("sp2").unwrap().phase, phase);
    }

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.exposure_no, 1);
    assert!(!rig.sequencer.is_busy("sp2"));

    // Released on completion
    rig.ccd.set_readout_duration(Duration::ZERO);
    rig.ccd.set_fetch_duration(Duration::ZERO);
    let next = rig.sequencer.expose(science(1)).await.unwrap();
    assert_eq!(next.exposure_no, 2);
}

#[tokio::test(start_paused = true)]
async fn test_controller_released_after_fetch_failure() {
    let rig = create_rig();
    rig.ccd.set_fetch_duration(Duration::from_secs(11));

    let sequencer = rig.sequencer.clone();
    let handle = tokio::spawn(async move { sequencer.expose(science(60)).await });

    wait_for_phase(&rig.sequencer, "sp2", ExposurePhase::Fetching).await;
    let err = rig.sequencer.expose(science(30)).await.unwrap_err();
    assert!(matches!(err, DaqError::ExposureInProgress(_)));

    assert!(handle.await.unwrap().is_err());
    assert_eq!(rig.sequencer.state("sp2").unwrap().phase, ExposurePhase::Failed);
    assert!(!rig.sequencer.is_busy("sp2"));

    rig.ccd.set_fetch_duration(Duration::ZERO);
    let next = rig.sequencer.expose(science(1)).await.unwrap();
    assert_eq!(next.exposure_no, 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_readout_is_a_warning() {
    let rig = create_rig();
    rig.ccd.set_readout_duration(Duration::from_secs(45));

    let outcome = rig.sequencer.expose(science(900)).await.unwrap();

    assert_eq!(outcome.files.len(), 2);
    assert!(outcome
        .warnings
        .iter()
        .any(|w| w.starts_with("READING took")));
}

#[tokio::test(start_paused = true)]
async fn test_readout_past_maximum_fails_and_resumes() {
    let rig = create_rig();
    rig.ccd.set_readout_duration(Duration::from_secs(65));

    let err = rig.sequencer.expose(science(900)).await.unwrap_err();
    match err {
        DaqError::ExposureFailed {
            phase,
            checkpoint,
            source,
        } => {
            assert_eq!(phase, ExposurePhase::Reading);
            assert_eq!(checkpoint, Checkpoint(Some(ExposurePhase::Integrating)));
            assert!(matches!(*source, DaqError::ReadoutTimeout(max) if max == Duration::from_secs(60)));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let state = rig.sequencer.state("sp2").unwrap();
    assert_eq!(state.phase, ExposurePhase::Failed);
    assert!(matches!(state.result, Some(ExposureResult::Failed(_))));
    assert!(!rig.sequencer.is_busy("sp2"));
    assert_eq!(count_data_files(rig.data_dir.path()), 0);

    // Resume re-reads without a second integration
    rig.ccd.set_readout_duration(Duration::from_secs(30));
    let outcome = rig.sequencer.resume("sp2").await.unwrap();
    assert_eq!(outcome.exposure_no, 1);
    assert_eq!(outcome.files.len(), 2);
    let integrations = rig
        .ccd
        .calls()
        .iter()
        .filter(|c| *c == "start_integration")
        .count();
    assert_eq!(integrations, 1);
    assert_eq!(rig.mech.commands_starting_with("os").len(), 1);
    assert_eq!(count_data_files(rig.data_dir.path()), 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_fetch_past_maximum_is_fetch_timeout() {
    let rig = create_rig();
    rig.ccd.set_fetch_duration(Duration::from_secs(11));

    let err = rig.sequencer.expose(science(60)).await.unwrap_err();
    match err {
        DaqError::ExposureFailed { phase, source, .. } => {
            assert_eq!(phase, ExposurePhase::Fetching);
            assert!(matches!(*source, DaqError::FetchTimeout(_)));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_stalled_shutter_open_fails_exposure() {
    let rig = create_rig();
    rig.mech.stick_door(Door::Shutter);

    let err = rig.sequencer.expose(science(900)).await.unwrap_err();
    assert!(matches!(
        err,
        DaqError::ExposureFailed {
            phase: ExposurePhase::Integrating,
            ..
        }
    ));
    assert!(!rig.ccd.calls().contains(&"start_readout".to_string()));
}

#[tokio::test]
async fn test_unknown_controller_rejected() {
    let rig = create_rig();
    let request = ExposureRequest::new("sp9", ExposureFlavour::Dark, Duration::from_secs(1));

    let err = rig.sequencer.expose(request).await.unwrap_err();
    assert!(matches!(err, DaqError::UnknownController(_)));
    assert!(rig.sequencer.state("sp9").is_none());
}
