//! One active exposure per controller.
//!
//! The "exposure active" flag is the only lock shared between exposure callers.
//! A second request for a busy controller is rejected, never queued.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::error::{AppResult, DaqError};

/// Set of controllers with an exposure in progress.
#[derive(Debug, Clone, Default)]
pub struct ExposureLocks {
    active: Arc<Mutex<HashSet<String>>>,
}

impl ExposureLocks {
    /// No controller busy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `controller` busy. Fails with `DaqError::ExposureInProgress` if it
    /// already is.
    pub fn try_acquire(&self, controller: &str) -> AppResult<ExposureLease> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(controller.to_string()) {
            return Err(DaqError::ExposureInProgress(controller.to_string()));
        }
        Ok(ExposureLease {
            active: self.active.clone(),
            controller: controller.to_string(),
        })
    }

    /// Whether `controller` has an exposure in progress.
    pub fn is_active(&self, controller: &str) -> bool {
        self.active
            .lock()
            .map(|a| a.contains(controller))
            .unwrap_or(false)
    }
}

/// Exclusive right to expose on one controller. Released on drop.
#[derive(Debug)]
pub struct ExposureLease {
    active: Arc<Mutex<HashSet<String>>>,
    controller: String,
}

impl ExposureLease {
    /// Controller held by this lease.
    pub fn controller(&self) -> &str {
        &self.controller
    }
}

impl Drop for ExposureLease {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.controller);
        tracing::debug!(controller = %self.controller, "Exposure lock released");
    }
}
