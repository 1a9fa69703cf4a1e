//! The exposure state machine.
//!
//! `IDLE → PREPARING → INTEGRATING → READING → FETCHING → WRITING → IDLE`
//!
//! - **PREPARING** loads the window, flushes (binned for reduced windows) and
//!   purges, each under its own deadline. Any failure is fatal.
//! - **INTEGRATING** starts the controller integration, runs the Hartmann door and
//!   shutter sequence around the integration timer. A controller failure or a
//!   shutter that does not open is fatal; an unacknowledged close or Hartmann door
//!   move is recorded as a warning.
//! - **READING** and **FETCHING** run under two-tier deadlines: late is a warning,
//!   past the maximum is `ReadoutTimeout`/`FetchTimeout`. Housekeeping is collected
//!   concurrently.
//! - **WRITING** assembles one header per detector, writes the FITS files and
//!   their checksum sidecars.
//!
//! A fatal error moves the exposure to `FAILED` and is reported as
//! `DaqError::ExposureFailed` with the failing phase and the last checkpoint.
//! Failures after `INTEGRATING` or `READING` completed can be resumed with
//! [`ExposureSequencer::resume`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::counter::ExposureCounter;
use super::deadline::{with_deadlines, DeadlineOutcome, Deadlines, HardDeadlineExceeded};
use super::lease::{ExposureLease, ExposureLocks};
use super::types::{
    ExposureOutcome, ExposurePhase, ExposureRequest, ExposureResult, ExposureState, WrittenFile,
};
use crate::alerts::AlertMonitor;
use crate::ccd::{CcdController, PixelBuffer};
use crate::config::{ExposureConfig, OutputConfig, Settings};
use crate::error::{AppResult, Checkpoint, DaqError};
use crate::header::{HeaderAssembler, HeaderContext, Housekeeping, HousekeepingCollector};
use crate::mech::{Door, MechLink};
use crate::storage::{self, fits, naming, ChecksumAlgorithm, NamingContext};
use crate::telemetry::PeerTelemetry;

/// An accepted exposure, as needed to run (or resume) its phases.
#[derive(Clone)]
struct Job {
    request: ExposureRequest,
    ccd: Arc<dyn CcdController>,
    detectors: Vec<String>,
    exposure_no: u32,
    integration_started: Option<DateTime<Utc>>,
    exposure_time: f64,
}

struct SequencerInner {
    link: MechLink,
    controllers: HashMap<String, Arc<dyn CcdController>>,
    peers: Arc<dyn PeerTelemetry>,
    alerts: Option<AlertMonitor>,
    config: ExposureConfig,
    output: OutputConfig,
    assembler: HeaderAssembler,
    counter: ExposureCounter,
    locks: ExposureLocks,
    states: Mutex<HashMap<String, ExposureState>>,
    aborts: Mutex<HashMap<String, oneshot::Sender<()>>>,
    resumable: Mutex<HashMap<String, Job>>,
}

/// Drives exposures on a set of CCD controllers.
///
/// Cloning is cheap; clones share state, so one clone may run an exposure while
/// another queries or aborts it.
#[derive(Clone)]
pub struct ExposureSequencer {
    inner: Arc<SequencerInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn controller_error(ccd: &dyn CcdController, error: anyhow::Error) -> DaqError {
    DaqError::Controller {
        controller: ccd.name().to_string(),
        message: format!("{error:#}"),
    }
}

impl ExposureSequencer {
    /// Sequencer for `controllers`, configured from `settings`.
    pub fn new(
        settings: &Settings,
        link: MechLink,
        controllers: Vec<Arc<dyn CcdController>>,
        peers: Arc<dyn PeerTelemetry>,
    ) -> Self {
        let counter = ExposureCounter::new(settings.output.data_dir.join(&settings.output.counter_file));
        Self {
            inner: Arc::new(SequencerInner {
                link,
                controllers: controllers
                    .into_iter()
                    .map(|c| (c.name().to_string(), c))
                    .collect(),
                peers,
                alerts: None,
                config: settings.exposure.clone(),
                output: settings.output.clone(),
                assembler: HeaderAssembler::new(settings.header.keywords.clone()),
                counter,
                locks: ExposureLocks::new(),
                states: Mutex::new(HashMap::new()),
                aborts: Mutex::new(HashMap::new()),
                resumable: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Record the active alerts of `monitor` in every header.
    ///
    /// Must be called before the sequencer is cloned.
    pub fn with_alerts(mut self, monitor: AlertMonitor) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.alerts = Some(monitor);
        } else {
            warn!("Sequencer already shared; alert snapshot not attached");
        }
        self
    }

    /// State of the current (or last) exposure of `controller`.
    pub fn state(&self, controller: &str) -> Option<ExposureState> {
        lock(&self.inner.states).get(controller).cloned()
    }

    /// Whether `controller` has an exposure in progress.
    pub fn is_busy(&self, controller: &str) -> bool {
        self.inner.locks.is_active(controller)
    }

    /// Abort the exposure in progress on `controller`.
    ///
    /// The running [`expose`](Self::expose) call returns
    /// `DaqError::ExposureAborted` once the controller has been told to stop.
    /// Returns `false` if nothing was running.
    pub fn abort(&self, controller: &str) -> bool {
        match lock(&self.inner.aborts).remove(controller) {
            Some(tx) => {
                info!(controller, "Abort requested");
                tx.send(()).is_ok()
            }
            None => false,
        }
    }

    /// Run one exposure to completion.
    ///
    /// Fails immediately with `DaqError::ExposureInProgress` if the controller is
    /// busy; the running exposure is not affected.
    pub async fn expose(&self, request: ExposureRequest) -> AppResult<ExposureOutcome> {
        request.validate()?;
        let ccd = self
            .inner
            .controllers
            .get(&request.controller)
            .cloned()
            .ok_or_else(|| DaqError::UnknownController(request.controller.clone()))?;

        let available = ccd.detectors();
        let detectors = if request.detectors.is_empty() {
            available
        } else {
            if let Some(unknown) = request.detectors.iter().find(|d| !available.contains(d)) {
                return Err(DaqError::Configuration(format!(
                    "Controller {} does not read out detector {unknown}",
                    request.controller
                )));
            }
            request.detectors.clone()
        };

        let lease = self.inner.locks.try_acquire(&request.controller)?;
        let exposure_no = self.inner.counter.reserve()?;
        lock(&self.inner.resumable).remove(&request.controller);

        info!(
            controller = %request.controller,
            exposure_no,
            flavour = %request.flavour,
            exposure_time = ?request.exposure_time,
            window = %request.window.name(),
            "Exposure accepted"
        );

        let job = Job {
            request: request.clone(),
            ccd,
            detectors,
            exposure_no,
            integration_started: None,
            exposure_time: 0.0,
        };
        lock(&self.inner.states).insert(
            request.controller.clone(),
            ExposureState {
                id: Uuid::new_v4(),
                request,
                exposure_no,
                phase: ExposurePhase::Idle,
                phase_started: Utc::now(),
                deadline: None,
                checkpoint: None,
                warnings: Vec::new(),
                result: None,
                files: Vec::new(),
                integration_started: None,
            },
        );

        self.execute(lease, job, ExposurePhase::Preparing).await
    }

    /// Resume a failed exposure of `controller` from its last checkpoint.
    ///
    /// Only exposures that failed after `INTEGRATING` (re-run readout, fetch and
    /// writing) or `READING` (re-run fetch and writing) can be resumed. The
    /// original request and exposure number are kept.
    pub async fn resume(&self, controller: &str) -> AppResult<ExposureOutcome> {
        let lease = self.inner.locks.try_acquire(controller)?;
        let job = lock(&self.inner.resumable).remove(controller).ok_or_else(|| {
            DaqError::Configuration(format!("No resumable exposure on controller {controller}"))
        })?;

        let checkpoint = self.state(controller).and_then(|s| s.checkpoint);
        let start = match checkpoint {
            Some(ExposurePhase::Integrating) => ExposurePhase::Reading,
            Some(ExposurePhase::Reading) => ExposurePhase::Fetching,
            other => {
                return Err(DaqError::Configuration(format!(
                    "Cannot resume from checkpoint {}",
                    Checkpoint(other)
                )))
            }
        };

        info!(controller, exposure_no = job.exposure_no, from = %start, "Resuming exposure");
        self.update(controller, |s| {
            s.result = None;
            s.warnings.push(format!("Resumed from {start}"));
        });
        self.execute(lease, job, start).await
    }

    async fn execute(
        &self,
        lease: ExposureLease,
        job: Job,
        start: ExposurePhase,
    ) -> AppResult<ExposureOutcome> {
        let controller = job.request.controller.clone();
        let (abort_tx, abort_rx) = oneshot::channel();
        lock(&self.inner.aborts).insert(controller.clone(), abort_tx);

        let mut job = job;
        let finished = tokio::select! {
            result = self.run(&mut job, start) => Some(result),
            Ok(()) = abort_rx => None,
        };
        let result = match finished {
            Some(result) => result,
            None => Err(self.aborted(&job).await),
        };
        lock(&self.inner.aborts).remove(&controller);

        let result = match result {
            Ok(files) => {
                let warnings = self
                    .update(&controller, |s| {
                        s.phase = ExposurePhase::Idle;
                        s.phase_started = Utc::now();
                        s.deadline = None;
                        s.result = Some(ExposureResult::Success);
                        s.warnings.clone()
                    })
                    .unwrap_or_default();
                info!(
                    controller = %controller,
                    exposure_no = job.exposure_no,
                    files = files.len(),
                    warnings = warnings.len(),
                    "Exposure complete"
                );
                Ok(ExposureOutcome {
                    exposure_no: job.exposure_no,
                    files,
                    warnings,
                })
            }
            Err(err @ DaqError::ExposureAborted(_)) => Err(err),
            Err(err) => Err(self.failed(&job, err)),
        };
        drop(lease);
        result
    }

    async fn run(&self, job: &mut Job, start: ExposurePhase) -> AppResult<Vec<WrittenFile>> {
        let controller = job.request.controller.clone();

        if start == ExposurePhase::Preparing {
            self.enter(&controller, ExposurePhase::Preparing, None);
            self.prepare(job).await?;
            self.checkpoint(&controller, ExposurePhase::Preparing);

            self.enter(
                &controller,
                ExposurePhase::Integrating,
                Some(job.request.exposure_time + self.inner.config.shutter_timeout() * 2),
            );
            self.integrate(job).await?;
            self.checkpoint(&controller, ExposurePhase::Integrating);
        }

        let collector = HousekeepingCollector::new(
            self.inner.link.clone(),
            job.ccd.clone(),
            self.inner.peers.clone(),
            self.inner.assembler.keywords().to_vec(),
            self.inner.config.housekeeping_timeout(),
        );
        let collector = match &self.inner.alerts {
            Some(monitor) => collector.with_alerts(monitor.clone()),
            None => collector,
        };

        let (housekeeping, pixels) =
            tokio::join!(collector.collect(), self.read_and_fetch(job, start));
        let pixels = pixels?;

        self.enter(&controller, ExposurePhase::Writing, None);
        for failure in &housekeeping.failures {
            self.warn(&controller, failure.clone());
        }
        let files = self.write(job, &pixels, &housekeeping).await?;
        self.checkpoint(&controller, ExposurePhase::Writing);
        Ok(files)
    }

    async fn prepare(&self, job: &Job) -> AppResult<()> {
        let ccd = job.ccd.as_ref();
        let config = &self.inner.config;
        let binned = job.request.window.is_reduced();

        bounded(ccd, "configure", config.flush_timeout(), ccd.configure(&job.request.window)).await?;
        bounded(ccd, "flush", config.flush_timeout(), ccd.flush(binned)).await?;
        bounded(ccd, "purge", config.purge_timeout(), ccd.purge()).await?;
        Ok(())
    }

    async fn integrate(&self, job: &mut Job) -> AppResult<()> {
        let controller = job.request.controller.clone();
        let ccd = job.ccd.clone();
        let config = &self.inner.config;
        let exposure_time = job.request.exposure_time;

        bounded(
            ccd.as_ref(),
            "start_integration",
            config.integration_start_timeout(),
            ccd.start_integration(exposure_time),
        )
        .await?;

        if !job.request.opens_shutter() {
            job.integration_started = Some(Utc::now());
            self.update(&controller, |s| s.integration_started = job.integration_started);
            tokio::time::sleep(exposure_time).await;
            job.exposure_time = exposure_time.as_secs_f64();
            return Ok(());
        }

        if let Some(side) = job.request.hartmann {
            self.door_or_warn(&controller, side.closed_door(), false).await;
            self.door_or_warn(&controller, side.open_door(), true).await;
        }

        if let Err(e) = self.move_door(Door::Shutter, true).await {
            error!(controller = %controller, error = %e, "Shutter did not open");
            self.door_or_warn(&controller, Door::Shutter, false).await;
            return Err(e);
        }
        let opened = Instant::now();
        job.integration_started = Some(Utc::now());
        self.update(&controller, |s| s.integration_started = job.integration_started);
        info!(controller = %controller, exposure_time = ?exposure_time, "Shutter open");

        tokio::time::sleep(exposure_time).await;

        job.exposure_time = opened.elapsed().as_secs_f64();
        self.door_or_warn(&controller, Door::Shutter, false).await;

        if job.request.hartmann.is_some() {
            self.door_or_warn(&controller, Door::Left, true).await;
            self.door_or_warn(&controller, Door::Right, true).await;
        }
        Ok(())
    }

    async fn move_door(&self, door: Door, open: bool) -> AppResult<()> {
        let config = &self.inner.config;
        self.inner
            .link
            .move_door(door, open, config.shutter_timeout(), config.poll_interval())
            .await
    }

    async fn door_or_warn(&self, controller: &str, door: Door, open: bool) {
        if let Err(e) = self.move_door(door, open).await {
            let action = if open { "open" } else { "close" };
            self.warn(controller, format!("{door} did not {action}: {e}"));
        }
    }

    async fn read_and_fetch(&self, job: &Job, start: ExposurePhase) -> AppResult<PixelBuffer> {
        let controller = job.request.controller.as_str();
        let ccd = job.ccd.as_ref();
        let config = &self.inner.config;

        if start != ExposurePhase::Fetching {
            let deadlines = Deadlines::new(config.readout_deadlines());
            self.enter(controller, ExposurePhase::Reading, Some(deadlines.max));

            let poll = config.poll_interval();
            // The readout deadlines cover the start command too
            let readout = async {
                ccd.start_readout()
                    .await
                    .map_err(|e| e.context("start_readout failed"))?;
                loop {
                    if ccd.readout_complete().await? {
                        return anyhow::Ok(());
                    }
                    tokio::time::sleep(poll).await;
                }
            };
            let outcome = with_deadlines(ExposurePhase::Reading.as_str(), deadlines, readout)
                .await
                .map_err(|HardDeadlineExceeded(max)| DaqError::ReadoutTimeout(max))?;
            self.note_lateness(controller, ExposurePhase::Reading, deadlines, &outcome);
            outcome.into_value().map_err(|e| controller_error(ccd, e))?;
            self.checkpoint(controller, ExposurePhase::Reading);
        }

        let deadlines = Deadlines::new(config.fetch_deadlines());
        self.enter(controller, ExposurePhase::Fetching, Some(deadlines.max));
        let outcome = with_deadlines(ExposurePhase::Fetching.as_str(), deadlines, ccd.fetch())
            .await
            .map_err(|HardDeadlineExceeded(max)| DaqError::FetchTimeout(max))?;
        self.note_lateness(controller, ExposurePhase::Fetching, deadlines, &outcome);
        let pixels = outcome.into_value().map_err(|e| controller_error(ccd, e))?;
        self.checkpoint(controller, ExposurePhase::Fetching);
        Ok(pixels)
    }

    fn note_lateness<T>(
        &self,
        controller: &str,
        phase: ExposurePhase,
        deadlines: Deadlines,
        outcome: &DeadlineOutcome<T>,
    ) {
        if let Some(elapsed) = outcome.lateness() {
            self.warn(
                controller,
                format!(
                    "{phase} took {:.1}s, expected at most {:.1}s",
                    elapsed.as_secs_f64(),
                    deadlines.expected.as_secs_f64()
                ),
            );
        }
    }

    async fn write(
        &self,
        job: &Job,
        pixels: &PixelBuffer,
        housekeeping: &Housekeeping,
    ) -> AppResult<Vec<WrittenFile>> {
        let controller = job.request.controller.as_str();
        let started = job.integration_started.unwrap_or_else(Utc::now);
        let template = job
            .request
            .file_template
            .clone()
            .unwrap_or_else(|| self.inner.output.file_template.clone());

        let mut files = Vec::with_capacity(job.detectors.len());
        for detector in &job.detectors {
            let frame = pixels.frame(detector).cloned().ok_or_else(|| DaqError::Controller {
                controller: controller.to_string(),
                message: format!("no pixel data for detector {detector}"),
            })?;

            let naming = NamingContext {
                mjd: naming::sjd(started),
                ccd: detector.clone(),
                controller: controller.to_string(),
                exposure_no: job.exposure_no,
                flavour: job.request.flavour,
            };
            let path = storage::output_path(&self.inner.output, &template, &naming)?;
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let context = HeaderContext {
                request: &job.request,
                detector,
                cameras: &job.detectors,
                exposure_no: job.exposure_no,
                filename: &filename,
                integration_started: started,
                exposure_time: job.exposure_time,
            };
            let (header, warnings) = self.inner.assembler.assemble(&context, housekeeping);
            for warning in warnings {
                self.warn(controller, format!("{detector}: header {warning}"));
            }

            let algorithm = self.inner.output.checksum;
            let target = path.clone();
            let (checksum_path, digest) = tokio::task::spawn_blocking(move || {
                fits::write_image(&target, &frame, &header)?;
                storage::write_sidecar(&target, algorithm)
            })
            .await
            .map_err(|e| DaqError::Io(std::io::Error::other(e)))??;

            log_written(&path, &checksum_path, algorithm);
            let written = WrittenFile {
                detector: detector.clone(),
                path,
                checksum_path,
                digest,
            };
            self.update(controller, |s| s.files.push(written.clone()));
            files.push(written);
        }
        Ok(files)
    }

    async fn aborted(&self, job: &Job) -> DaqError {
        let controller = job.request.controller.as_str();
        let phase = self
            .state(controller)
            .map(|s| s.phase)
            .unwrap_or(ExposurePhase::Idle);
        self.update(controller, |s| {
            s.phase = ExposurePhase::Aborted;
            s.phase_started = Utc::now();
            s.deadline = None;
            s.result = Some(ExposureResult::Aborted);
        });
        warn!(controller, exposure_no = job.exposure_no, %phase, "Exposure aborted");

        let timeout = self.inner.config.integration_start_timeout();
        match tokio::time::timeout(timeout, job.ccd.abort()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let error = format!("{e:#}");
                warn!(controller, %error, "Controller abort failed");
            }
            Err(_) => warn!(controller, ?timeout, "Controller abort timed out"),
        }
        if phase == ExposurePhase::Integrating && job.request.opens_shutter() {
            if let Err(e) = self.move_door(Door::Shutter, false).await {
                warn!(controller, error = %e, "Shutter did not close after abort");
            }
        }
        DaqError::ExposureAborted(phase)
    }

    fn failed(&self, job: &Job, source: DaqError) -> DaqError {
        let controller = job.request.controller.as_str();
        let (phase, checkpoint) = self
            .update(controller, |s| {
                let phase = s.phase;
                s.phase = ExposurePhase::Failed;
                s.phase_started = Utc::now();
                s.deadline = None;
                s.result = Some(ExposureResult::Failed(source.to_string()));
                (phase, s.checkpoint)
            })
            .unwrap_or((ExposurePhase::Idle, None));
        let last = Checkpoint(checkpoint);
        error!(
            controller,
            exposure_no = job.exposure_no,
            %phase,
            checkpoint = %last,
            error = %source,
            "Exposure failed"
        );

        if matches!(
            checkpoint,
            Some(ExposurePhase::Integrating) | Some(ExposurePhase::Reading)
        ) {
            lock(&self.inner.resumable).insert(controller.to_string(), job.clone());
        }
        DaqError::ExposureFailed {
            phase,
            checkpoint: Checkpoint(checkpoint),
            source: Box::new(source),
        }
    }

    fn update<R>(&self, controller: &str, f: impl FnOnce(&mut ExposureState) -> R) -> Option<R> {
        lock(&self.inner.states).get_mut(controller).map(f)
    }

    fn enter(&self, controller: &str, phase: ExposurePhase, deadline: Option<Duration>) {
        let now = Utc::now();
        self.update(controller, |s| {
            s.phase = phase;
            s.phase_started = now;
            s.deadline = deadline
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| now + d);
        });
        info!(controller, %phase, "Exposure phase");
    }

    fn checkpoint(&self, controller: &str, phase: ExposurePhase) {
        self.update(controller, |s| s.checkpoint = Some(phase));
    }

    fn warn(&self, controller: &str, message: String) {
        warn!(controller, warning = %message, "Exposure warning");
        self.update(controller, |s| s.warnings.push(message));
    }
}

async fn bounded<F>(ccd: &dyn CcdController, operation: &str, timeout: Duration, future: F) -> AppResult<()>
where
    F: std::future::Future<Output = anyhow::Result<()>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(controller_error(ccd, e.context(format!("{operation} failed")))),
        Err(_) => Err(DaqError::Controller {
            controller: ccd.name().to_string(),
            message: format!("{operation} did not complete within {timeout:?}"),
        }),
    }
}

fn log_written(path: &Path, checksum_path: &Path, algorithm: ChecksumAlgorithm) {
    info!(
        path = %path.display(),
        checksum = %checksum_path.display(),
        %algorithm,
        "Data file written"
    );
}
