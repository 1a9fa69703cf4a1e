//! Scripted CCD controller for tests.
//!
//! Durations are measured with `tokio::time`, so tests running with a paused clock
//! can simulate a 900 s exposure or a 65 s readout instantly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::time::Instant;

use super::{CcdController, Frame, PixelBuffer, TelemetryMap};
use crate::exposure::WindowMode;
use crate::value::FieldValue;

#[derive(Debug)]
struct MockCcdState {
    flush_duration: Duration,
    readout_duration: Duration,
    fetch_duration: Duration,
    width: usize,
    height: usize,
    readout_started: Option<Instant>,
    window: Option<WindowMode>,
    fail_start_integration: bool,
    fail_fetch: bool,
    stall_start_readout: bool,
    status_failures: usize,
    status: TelemetryMap,
    parameters: HashMap<String, f64>,
    calls: Vec<String>,
}

/// In-memory CCD controller with scripted timing and failures.
#[derive(Clone)]
pub struct MockCcdController {
    name: String,
    detectors: Vec<String>,
    state: Arc<Mutex<MockCcdState>>,
}

impl MockCcdController {
    /// Controller reading out `detectors`, with instant operations and 8x4 frames.
    pub fn new(name: &str, detectors: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            detectors: detectors.iter().map(|d| d.to_string()).collect(),
            state: Arc::new(Mutex::new(MockCcdState {
                flush_duration: Duration::ZERO,
                readout_duration: Duration::ZERO,
                fetch_duration: Duration::ZERO,
                width: 8,
                height: 4,
                readout_started: None,
                window: None,
                fail_start_integration: false,
                fail_fetch: false,
                stall_start_readout: false,
                status_failures: 0,
                status: TelemetryMap::new(),
                parameters: HashMap::new(),
                calls: Vec::new(),
            })),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockCcdState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    fn record(&self, call: &str) {
        self.with(|s| s.calls.push(call.to_string()))
    }

    /// Time the flush takes.
    pub fn set_flush_duration(&self, duration: Duration) {
        self.with(|s| s.flush_duration = duration)
    }

    /// Time from `start_readout` until `readout_complete` reports true.
    pub fn set_readout_duration(&self, duration: Duration) {
        self.with(|s| s.readout_duration = duration)
    }

    /// Time the fetch takes.
    pub fn set_fetch_duration(&self, duration: Duration) {
        self.with(|s| s.fetch_duration = duration)
    }

    /// Frame geometry returned by `fetch`.
    pub fn set_frame_size(&self, width: usize, height: usize) {
        self.with(|s| {
            s.width = width;
            s.height = height;
        })
    }

    /// Make `start_integration` fail.
    pub fn fail_start_integration(&self, fail: bool) {
        self.with(|s| s.fail_start_integration = fail)
    }

    /// Make `fetch` fail.
    pub fn fail_fetch(&self, fail: bool) {
        self.with(|s| s.fail_fetch = fail)
    }

    /// Make `start_readout` never acknowledge.
    pub fn stall_start_readout(&self, stall: bool) {
        self.with(|s| s.stall_start_readout = stall)
    }

    /// Make the next `times` status reads fail.
    pub fn fail_status(&self, times: usize) {
        self.with(|s| s.status_failures = times)
    }

    /// Set a status value.
    pub fn set_status(&self, key: &str, value: FieldValue) {
        self.with(|s| {
            s.status.insert(key.to_string(), value);
        })
    }

    /// Set a configuration parameter.
    pub fn set_parameter(&self, key: &str, value: f64) {
        self.with(|s| {
            s.parameters.insert(key.to_string(), value);
        })
    }

    /// Operations called so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    /// Last window loaded by `configure`.
    pub fn window(&self) -> Option<WindowMode> {
        self.with(|s| s.window.clone())
    }
}

#[async_trait]
impl CcdController for MockCcdController {
    fn name(&self) -> &str {
        &self.name
    }

    fn detectors(&self) -> Vec<String> {
        self.detectors.clone()
    }

    async fn configure(&self, window: &WindowMode) -> Result<()> {
        self.record("configure");
        self.with(|s| s.window = Some(window.clone()));
        Ok(())
    }

    async fn flush(&self, binned: bool) -> Result<()> {
        self.record(if binned { "flush_binned" } else { "flush" });
        let duration = self.with(|s| s.flush_duration);
        tokio::time::sleep(duration).await;
        Ok(())
    }

    async fn purge(&self) -> Result<()> {
        self.record("purge");
        Ok(())
    }

    async fn start_integration(&self, _exposure_time: Duration) -> Result<()> {
        self.record("start_integration");
        if self.with(|s| s.fail_start_integration) {
            bail!("controller refused to start integration");
        }
        Ok(())
    }

    async fn start_readout(&self) -> Result<()> {
        self.record("start_readout");
        if self.with(|s| s.stall_start_readout) {
            std::future::pending::<()>().await;
        }
        self.with(|s| s.readout_started = Some(Instant::now()));
        Ok(())
    }

    async fn readout_complete(&self) -> Result<bool> {
        self.with(|s| match s.readout_started {
            Some(started) => Ok(started.elapsed() >= s.readout_duration),
            None => Err(anyhow!("no readout in progress")),
        })
    }

    async fn fetch(&self) -> Result<PixelBuffer> {
        self.record("fetch");
        let (duration, fail, width, height) =
            self.with(|s| (s.fetch_duration, s.fail_fetch, s.width, s.height));
        tokio::time::sleep(duration).await;
        if fail {
            bail!("pixel transfer failed");
        }

        let frames = self
            .detectors
            .iter()
            .enumerate()
            .map(|(n, detector)| Frame {
                detector: detector.clone(),
                width,
                height,
                data: (0..width * height)
                    .map(|i| (1000 + n * 100 + i % 100) as u16)
                    .collect(),
            })
            .collect();
        Ok(PixelBuffer { frames })
    }

    async fn abort(&self) -> Result<()> {
        self.record("abort");
        self.with(|s| s.readout_started = None);
        Ok(())
    }

    async fn status(&self) -> Result<TelemetryMap> {
        self.with(|s| {
            if s.status_failures > 0 {
                s.status_failures -= 1;
                bail!("status request timed out");
            }
            Ok(s.status.clone())
        })
    }

    async fn parameter(&self, key: &str) -> Result<Option<f64>> {
        Ok(self.with(|s| s.parameters.get(key).copied()))
    }
}
