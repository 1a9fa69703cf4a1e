//! Durable record of every mech exchange.
//!
//! Each command and each reply is appended as one line, prefixed with a UTC
//! timestamp and a direction marker, and flushed before the link call returns:
//!
//! ```text
//! 2024-03-01T04:12:55.120+00:00 > rp;12
//! 2024-03-01T04:12:55.180+00:00 < $S1PNU,...*3C\r\0\n>
//! ```

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};

use crate::error::{AppResult, DaqError};

/// Direction of a logged exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to mech
    Sent,
    /// Mech to host
    Received,
}

impl Direction {
    fn marker(self) -> char {
        match self {
            Direction::Sent => '>',
            Direction::Received => '<',
        }
    }
}

/// Append-only exchange log.
#[derive(Debug)]
pub struct MechLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl MechLog {
    /// Open (or create) the log file in append mode.
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one exchange and flush it to disk.
    pub fn record(&self, direction: Direction, text: &str) -> AppResult<()> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, false);
        let line = format!("{timestamp} {} {}\n", direction.marker(), text.escape_debug());

        let mut file = self
            .file
            .lock()
            .map_err(|_| DaqError::Io(std::io::Error::other("mech log lock poisoned")))?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}
