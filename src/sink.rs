//! Error sink: where dead-lettered jobs are recorded for operator review.

use crate::error::{JobError, PdfSplitError};
use crate::identity::Identity;
use chrono::{DateTime, Local};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A job that was given up on.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub identity: Identity,
    pub source_path: PathBuf,
    pub attempts: u32,
    pub error: JobError,
    pub at: DateTime<Local>,
}

impl DeadLetter {
    /// `YYYY-MM-DD HH:MM:SS - <source> - identity=<id> attempts=<n> kind=<k> - <reason>`
    pub fn to_line(&self) -> String {
        format!(
            "{} - {} - identity={} attempts={} kind={} - {}\n",
            self.at.format("%Y-%m-%d %H:%M:%S"),
            single_line(&self.source_path.to_string_lossy()),
            self.identity,
            self.attempts,
            self.error.kind(),
            single_line(&self.error.to_string())
        )
    }
}

fn single_line(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

/// Destination for terminal failures. Must accept concurrent calls.
pub trait ErrorSink: Send + Sync {
    fn record(&self, letter: &DeadLetter) -> std::io::Result<()>;
}

/// Appends one line per dead letter to a text file.
///
/// Each line goes out in a single `write_all` under a mutex, so concurrent
/// workers never interleave partial lines.
#[derive(Debug)]
pub struct FileErrorSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileErrorSink {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PdfSplitError> {
        let path = path.into();
        let unavailable = |source| PdfSplitError::ErrorLogUnavailable {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(unavailable)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(unavailable)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ErrorSink for FileErrorSink {
    fn record(&self, letter: &DeadLetter) -> std::io::Result<()> {
        let line = letter.to_line();
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(line.as_bytes())?;
        file.flush()
    }
}
