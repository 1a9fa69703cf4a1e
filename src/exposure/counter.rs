//! Persistent exposure number.
//!
//! The next exposure number lives in a one-line text file in the data root. A
//! number is reserved by rewriting the file with its successor, so a crash after
//! an exposure is accepted never reuses the number.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{AppResult, DaqError};

/// Exposure number counter backed by a file.
#[derive(Debug)]
pub struct ExposureCounter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ExposureCounter {
    /// Counter stored at `path`. The file is created on first reservation.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    /// Location of the counter file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number the next reservation will return. Starts at 1 when the file is missing.
    pub fn peek(&self) -> AppResult<u32> {
        match fs::read_to_string(&self.path) {
            Ok(text) => text.trim().parse::<u32>().map_err(|e| {
                DaqError::Configuration(format!(
                    "Corrupt exposure counter {}: {e}",
                    self.path.display()
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(1),
            Err(e) => Err(e.into()),
        }
    }

    /// Reserve the next exposure number.
    pub fn reserve(&self) -> AppResult<u32> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let number = self.peek()?;
        let next = number.checked_add(1).ok_or_else(|| {
            DaqError::Configuration("Exposure counter overflow".to_string())
        })?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Readers see either the old or the new number, never a partial write.
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, format!("{next}\n"))?;
        fs::rename(&tmp, &self.path)?;

        tracing::debug!(exposure_no = number, "Reserved exposure number");
        Ok(number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nextExposureNumber");

        let counter = ExposureCounter::new(&path);
        assert_eq!(counter.reserve().unwrap(), 1);
        assert_eq!(counter.reserve().unwrap(), 2);

        let reopened = ExposureCounter::new(&path);
        assert_eq!(reopened.peek().unwrap(), 3);
    }

    #[test]
    fn test_existing_counter_respected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nextExposureNumber");
        fs::write(&path, "412\n").unwrap();

        assert_eq!(ExposureCounter::new(&path).reserve().unwrap(), 412);
    }

    #[test]
    fn test_corrupt_counter_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nextExposureNumber");
        fs::write(&path, "lots").unwrap();

        assert!(ExposureCounter::new(&path).reserve().is_err());
    }
}
