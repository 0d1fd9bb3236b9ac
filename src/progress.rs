//! Progress-callback trait for per-job service events.
//!
//! Inject an [`Arc<dyn ServiceProgressCallback>`] via
//! [`crate::config::WatchConfigBuilder::progress_callback`] to receive events
//! as jobs move through the queue and the worker pool.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdfsplit::{ServiceProgressCallback, WatchConfig};
//! use std::path::Path;
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl ServiceProgressCallback for CountingCallback {
//!     fn on_job_complete(&self, source: &Path, pages: usize) {
//!         let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{done}: {} → {pages} pages", source.display());
//!     }
//! }
//!
//! let config = WatchConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { completed: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Called by the service as jobs are queued, run, retried and finished.
///
/// Workers run concurrently, so every method may be called from several
/// threads at once. All methods have default no-op implementations so
/// callers only override what they care about.
pub trait ServiceProgressCallback: Send + Sync {
    /// A new job was accepted into the queue.
    fn on_job_queued(&self, source: &Path) {
        let _ = source;
    }

    /// A worker claimed the job.
    ///
    /// # Arguments
    /// * `attempt` — 1-indexed attempt number
    fn on_job_started(&self, source: &Path, attempt: u32) {
        let _ = (source, attempt);
    }

    /// Every page was written and the ledger append succeeded.
    fn on_job_complete(&self, source: &Path, pages: usize) {
        let _ = (source, pages);
    }

    /// The attempt failed with a retryable error and will be re-queued.
    fn on_job_retry(&self, source: &Path, attempt: u32, delay: Duration, error: &str) {
        let _ = (source, attempt, delay, error);
    }

    /// The job was given up on and sent to the error sink.
    fn on_job_dead_lettered(&self, source: &Path, attempts: u32, error: &str) {
        let _ = (source, attempts, error);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ServiceProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::WatchConfig`].
pub type ProgressCallback = Arc<dyn ServiceProgressCallback>;
