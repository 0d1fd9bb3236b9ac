//! Error types for the edgequake-pdfsplit library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PdfSplitError`] — **Fatal**: the service cannot start or keep running
//!   at all (watch root missing, output root unwritable, ledger unreadable,
//!   invalid configuration). Returned as `Err(PdfSplitError)` from
//!   [`crate::service::PdfSplitService::run`] and the binary exits non-zero.
//!
//! * [`JobError`] — **Per-job**: one PDF failed at one stage (locked file,
//!   corrupt input, OCR engine down, disk full). It is caught at the worker
//!   boundary, classified by [`crate::retry::RetryPolicy`], and never
//!   propagates past the worker that produced it.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-pdfsplit library.
#[derive(Debug, Error)]
pub enum PdfSplitError {
    // ── Startup errors ────────────────────────────────────────────────────
    /// The configured watch root does not exist or is not a directory.
    #[error("Watch folder '{path}' does not exist or is not a directory")]
    WatchRootMissing { path: PathBuf },

    /// The watch root exists but cannot be read.
    #[error("Watch folder '{path}' is not accessible: {source}")]
    WatchRootInaccessible {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The output root cannot be created or written to.
    #[error("Output folder '{path}' is not writable: {source}")]
    OutputRootUnwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The processed-files ledger exists but cannot be read, or cannot be reset.
    #[error("Ledger '{path}' could not be opened: {source}")]
    LedgerUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The error log cannot be opened for appending.
    #[error("Error log '{path}' could not be opened: {source}")]
    ErrorLogUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The filesystem notification backend refused to start.
    #[error("Failed to watch '{path}': {detail}")]
    WatcherFailed { path: PathBuf, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A failure of a single job at a single stage.
///
/// Every variant carries enough context to be written to the error log on its
/// own. Retry behaviour is not decided here; see
/// [`crate::retry::RetryPolicy::classify`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    /// Filesystem contention: the file is locked, still being written, or a
    /// read failed for a reason that may clear up by itself.
    #[error("Transient I/O error on '{path}': {detail}")]
    TransientIo { path: PathBuf, detail: String },

    /// The source disappeared between discovery and processing.
    #[error("Source file '{path}' no longer exists")]
    SourceMissing { path: PathBuf },

    /// The source is not a readable PDF.
    #[error("'{path}' is not a valid PDF: {detail}")]
    CorruptInput { path: PathBuf, detail: String },

    /// A collaborator engine (pdfium, tesseract) could not run.
    #[error("{engine} is unavailable: {detail}")]
    EngineUnavailable { engine: String, detail: String },

    /// A page file or its directory could not be written.
    #[error("Failed to write output '{path}': {detail}")]
    OutputWrite { path: PathBuf, detail: String },

    /// The durable ledger append failed; the identity is NOT marked complete.
    #[error("Failed to append to ledger '{path}': {detail}")]
    LedgerWrite { path: PathBuf, detail: String },

    /// Shutdown was requested between two collaborator calls.
    #[error("Job cancelled by shutdown")]
    Cancelled,

    /// A collaborator panicked or an invariant was violated.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Map an I/O error raised while reading a source file.
    ///
    /// `NotFound` becomes [`JobError::SourceMissing`]; everything else is
    /// treated as contention.
    pub fn from_source_io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            std::io::ErrorKind::NotFound => JobError::SourceMissing { path },
            _ => JobError::TransientIo {
                path,
                detail: err.to_string(),
            },
        }
    }

    /// Map an I/O error raised while writing an output file.
    pub fn output_write(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        JobError::OutputWrite {
            path: path.into(),
            detail: err.to_string(),
        }
    }

    /// Short machine-friendly label used in logs and the error sink.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::TransientIo { .. } => "transient_io",
            JobError::SourceMissing { .. } => "source_missing",
            JobError::CorruptInput { .. } => "corrupt_input",
            JobError::EngineUnavailable { .. } => "engine_unavailable",
            JobError::OutputWrite { .. } => "output_write",
            JobError::LedgerWrite { .. } => "ledger_write",
            JobError::Cancelled => "cancelled",
            JobError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn watch_root_missing_display() {
        let e = PdfSplitError::WatchRootMissing {
            path: PathBuf::from("/nope"),
        };
        assert!(e.to_string().contains("/nope"), "got: {e}");
    }

    #[test]
    fn not_found_maps_to_source_missing() {
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        let e = JobError::from_source_io("/in/a.pdf", &err);
        assert_eq!(
            e,
            JobError::SourceMissing {
                path: PathBuf::from("/in/a.pdf")
            }
        );
    }

    #[test]
    fn permission_denied_maps_to_transient() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "locked");
        let e = JobError::from_source_io("/in/a.pdf", &err);
        assert_eq!(e.kind(), "transient_io");
        assert!(e.to_string().contains("locked"));
    }

    #[test]
    fn engine_unavailable_display() {
        let e = JobError::EngineUnavailable {
            engine: "tesseract".into(),
            detail: "not on PATH".into(),
        };
        assert!(e.to_string().contains("tesseract"));
        assert!(e.to_string().contains("not on PATH"));
    }
}
