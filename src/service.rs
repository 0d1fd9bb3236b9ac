//! The watch service: wires watcher → debouncer → dispatcher → worker pool.
//!
//! ## Startup
//!
//! 1. Validate the watch root (missing or unreadable is fatal).
//! 2. Create the output root and check that it is writable (fatal otherwise).
//! 3. Open the error sink and load the ledger, truncating it first when
//!    `reset_progress` is set.
//! 4. Start the worker pool, the debouncer and the watcher. The watcher's
//!    startup scan feeds the same channel as live events.
//!
//! ## Dispatch
//!
//! For every settled path the dispatcher resolves an [`Identity`], drops it
//! if the ledger already holds it (or it is quarantined), and otherwise
//! enqueues a [`PdfJob`]. The queue drops identities that are already in
//! flight. A path whose fingerprint fails for a retryable reason is tried
//! again after the retry delay and dead-lettered once attempts run out.
//!
//! ## Shutdown
//!
//! Cancelling the token passed to [`PdfSplitService::run`] stops the
//! watcher, closes the queue (unclaimed jobs are dropped, to be rediscovered
//! on restart), and waits for every worker to finish its current
//! collaborator call.

use crate::config::WatchConfig;
use crate::engine::Engines;
use crate::error::{JobError, PdfSplitError};
use crate::identity::{Identity, IdentityResolver};
use crate::ledger::ProcessedLedger;
use crate::output::OutputWriter;
use crate::pipeline::debounce::Debouncer;
use crate::pipeline::orient::TesseractDetector;
use crate::pipeline::split::PdfiumEngine;
use crate::pipeline::watcher::DirectoryWatcher;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::queue::{EnqueueOutcome, JobQueue, PdfJob};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::sink::{DeadLetter, ErrorSink, FileErrorSink};
use crate::worker::{report_dead_letter, Quarantine, WorkerContext, WorkerPool};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the raw-event, settled-path and intake-retry channels.
const CHANNEL_CAPACITY: usize = 1024;

/// Identity recorded for dead letters whose file could never be fingerprinted.
const UNRESOLVED_IDENTITY: &str = "unresolved";

// ── Statistics ───────────────────────────────────────────────────────────────

/// Counters for one run of the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStats {
    /// Jobs accepted into the queue.
    pub queued: u64,
    /// Jobs whose pages were written and recorded in the ledger.
    pub completed: u64,
    /// Failed attempts that were scheduled for another try.
    pub retried: u64,
    /// Jobs given up on and sent to the error sink.
    pub dead_lettered: u64,
    /// Paths dropped because the ledger already held their identity.
    pub skipped_done: u64,
    /// Paths dropped because the same identity was already in flight.
    pub duplicates: u64,
    /// Completed jobs that wrote fewer page files than the source has pages.
    pub partial_outputs: u64,
}

/// Live, shareable counters behind [`ServiceStats`].
#[derive(Debug, Default)]
pub struct StatsCounters {
    pub queued: AtomicU64,
    pub completed: AtomicU64,
    pub retried: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub skipped_done: AtomicU64,
    pub duplicates: AtomicU64,
    pub partial_outputs: AtomicU64,
}

impl StatsCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServiceStats {
        ServiceStats {
            queued: self.queued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            skipped_done: self.skipped_done.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            partial_outputs: self.partial_outputs.load(Ordering::Relaxed),
        }
    }
}

// ── Engines ──────────────────────────────────────────────────────────────────

/// pdfium for splitting and rotation, tesseract for orientation detection.
pub fn default_engines(config: &WatchConfig) -> Engines {
    let pdfium = Arc::new(PdfiumEngine::new(config.pdfium_lib_path.clone()));
    let detector = TesseractDetector::new(Arc::clone(&pdfium), config.tesseract_cmd.clone());
    Engines::new(pdfium.clone(), Arc::new(detector), pdfium)
}

// ── Service ──────────────────────────────────────────────────────────────────

/// Long-running PDF split watcher.
///
/// ```rust,no_run
/// use edgequake_pdfsplit::{default_engines, PdfSplitService, WatchConfig};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> Result<(), edgequake_pdfsplit::PdfSplitError> {
/// let config = WatchConfig::builder().watch_folder("./scans").build()?;
/// let engines = default_engines(&config);
/// let shutdown = CancellationToken::new();
/// let stats = PdfSplitService::new(config, engines).run(shutdown).await?;
/// println!("{} completed", stats.completed);
/// # Ok(())
/// # }
/// ```
pub struct PdfSplitService {
    config: WatchConfig,
    engines: Engines,
    sink: Option<Arc<dyn ErrorSink>>,
}

impl std::fmt::Debug for PdfSplitService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PdfSplitService")
            .field("config", &self.config)
            .field("engines", &self.engines)
            .field("custom_sink", &self.sink.is_some())
            .finish()
    }
}

impl PdfSplitService {
    pub fn new(config: WatchConfig, engines: Engines) -> Self {
        Self {
            config,
            engines,
            sink: None,
        }
    }

    /// Record dead letters somewhere other than `error_log_path`.
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// # Errors
    /// Only startup problems are returned; per-job failures are retried or
    /// dead-lettered and never end the run.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<ServiceStats, PdfSplitError> {
        let config = &self.config;
        let watch_root = check_watch_root(&config.watch_folder).await?;
        let output_root = prepare_output_root(&config.output_folder).await?;
        info!(
            "Watch root {} → output root {}",
            watch_root.display(),
            output_root.display()
        );

        let sink: Arc<dyn ErrorSink> = match &self.sink {
            Some(sink) => Arc::clone(sink),
            None => Arc::new(FileErrorSink::open(&config.error_log_path)?),
        };

        let ledger = ProcessedLedger::load(&config.processed_file_path).await?;
        if config.reset_progress {
            info!(
                "Resetting ledger {} ({} record(s))",
                ledger.path().display(),
                ledger.len().await
            );
            ledger.reset().await?;
        } else {
            info!("Ledger holds {} completed file(s)", ledger.len().await);
        }

        let progress: ProgressCallback = config
            .progress_callback
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgressCallback));

        let ctx = Arc::new(WorkerContext {
            queue: Arc::new(JobQueue::new()),
            ledger: Arc::new(ledger),
            engines: self.engines.clone(),
            output: Arc::new(OutputWriter::new(
                &watch_root,
                &output_root,
                config.collision_policy,
            )),
            retry: RetryPolicy::from_config(config),
            sink,
            progress,
            dead_letter_policy: config.dead_letter_policy,
            quarantine: Arc::new(Quarantine::default()),
            stats: Arc::new(StatsCounters::default()),
            shutdown: shutdown.child_token(),
        });

        let pool = WorkerPool::spawn(config.max_workers, Arc::clone(&ctx));
        info!("Started {} worker(s)", pool.len());

        let (raw_tx, raw_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (ready_tx, mut ready_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let debouncer =
            Debouncer::new(Duration::from_millis(config.debounce_ms)).spawn(raw_rx, ready_tx);
        let watcher = match DirectoryWatcher::start(&watch_root, Some(&output_root), raw_tx) {
            Ok(w) => w,
            Err(e) => {
                ctx.queue.close();
                pool.join().await;
                debouncer.abort();
                return Err(e);
            }
        };

        let (retry_tx, mut retry_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut intake = Intake::new(IdentityResolver::new(config.identity_mode), retry_tx);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = ready_rx.recv() => match next {
                    Some(path) => intake.admit(&ctx, path).await,
                    None => {
                        warn!("Event stream ended; stopping");
                        break;
                    }
                },
                Some(path) = retry_rx.recv() => intake.admit(&ctx, path).await,
            }
        }

        info!("Shutting down: waiting for in-flight jobs");
        drop(watcher);
        ctx.shutdown.cancel();
        ctx.queue.close();
        pool.join().await;
        debouncer.abort();

        let stats = ctx.stats.snapshot();
        info!(
            queued = stats.queued,
            completed = stats.completed,
            retried = stats.retried,
            dead_lettered = stats.dead_lettered,
            skipped_done = stats.skipped_done,
            duplicates = stats.duplicates,
            partial_outputs = stats.partial_outputs,
            "Service stopped"
        );
        Ok(stats)
    }
}

/// Dispatcher-side intake: fingerprint settled paths and queue them.
///
/// A path that cannot be fingerprinted for a retryable reason (a locked file,
/// a flaky mount) is fed back after the retry delay, up to the configured
/// attempt limit, and then dead-lettered like a failed job.
struct Intake {
    resolver: IdentityResolver,
    failures: HashMap<PathBuf, u32>,
    retry_tx: mpsc::Sender<PathBuf>,
}

impl Intake {
    fn new(resolver: IdentityResolver, retry_tx: mpsc::Sender<PathBuf>) -> Self {
        Self {
            resolver,
            failures: HashMap::new(),
            retry_tx,
        }
    }

    /// Turn a settled path into a queued job, unless it is done or already running.
    async fn admit(&mut self, ctx: &WorkerContext, path: PathBuf) {
        let identity: Identity = match self.resolver.resolve(&path).await {
            Ok(id) => {
                self.failures.remove(&path);
                id
            }
            Err(JobError::SourceMissing { .. }) => {
                self.failures.remove(&path);
                debug!("{} vanished before intake", path.display());
                return;
            }
            Err(e) => {
                self.intake_failed(ctx, path, e);
                return;
            }
        };

        if ctx.ledger.contains(&identity).await {
            debug!("{} already processed, skipping", path.display());
            StatsCounters::bump(&ctx.stats.skipped_done);
            return;
        }
        if ctx.quarantine.contains(&identity) {
            debug!("{} is quarantined, skipping", path.display());
            return;
        }

        match ctx.queue.enqueue(PdfJob::new(identity, &path)) {
            EnqueueOutcome::Queued => {
                StatsCounters::bump(&ctx.stats.queued);
                info!("Queued {}", path.display());
                ctx.progress.on_job_queued(&path);
            }
            EnqueueOutcome::Duplicate => {
                StatsCounters::bump(&ctx.stats.duplicates);
                debug!("{} already in flight, dropping event", path.display());
            }
            EnqueueOutcome::Closed => {}
        }
    }

    fn intake_failed(&mut self, ctx: &WorkerContext, path: PathBuf, err: JobError) {
        let attempts = {
            let n = self.failures.entry(path.clone()).or_insert(0);
            *n += 1;
            *n
        };

        match ctx.retry.decide(&err, attempts) {
            RetryDecision::Retry(delay) => {
                warn!(
                    "Could not fingerprint {} (attempt {}/{}): {}; retrying in {:.1}s",
                    path.display(),
                    attempts,
                    ctx.retry.max_attempts(),
                    err,
                    delay.as_secs_f64()
                );
                StatsCounters::bump(&ctx.stats.retried);
                ctx.progress
                    .on_job_retry(&path, attempts, delay, &err.to_string());

                let tx = self.retry_tx.clone();
                let shutdown = ctx.shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            let _ = tx.send(path).await;
                        }
                        _ = shutdown.cancelled() => {}
                    }
                });
            }
            RetryDecision::DeadLetter => {
                self.failures.remove(&path);
                report_dead_letter(
                    ctx,
                    DeadLetter {
                        identity: Identity::new(UNRESOLVED_IDENTITY),
                        source_path: path,
                        attempts,
                        error: err,
                        at: chrono::Local::now(),
                    },
                );
            }
        }
    }
}

async fn check_watch_root(path: &Path) -> Result<PathBuf, PdfSplitError> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PdfSplitError::WatchRootMissing {
                path: path.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(PdfSplitError::WatchRootInaccessible {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if !meta.is_dir() {
        return Err(PdfSplitError::WatchRootMissing {
            path: path.to_path_buf(),
        });
    }

    let inaccessible = |source| PdfSplitError::WatchRootInaccessible {
        path: path.to_path_buf(),
        source,
    };
    tokio::fs::read_dir(path).await.map_err(inaccessible)?;
    tokio::fs::canonicalize(path).await.map_err(inaccessible)
}

async fn prepare_output_root(path: &Path) -> Result<PathBuf, PdfSplitError> {
    let unwritable = |source| PdfSplitError::OutputRootUnwritable {
        path: path.to_path_buf(),
        source,
    };
    tokio::fs::create_dir_all(path).await.map_err(unwritable)?;
    let root = tokio::fs::canonicalize(path).await.map_err(unwritable)?;

    let check_dir = root.clone();
    tokio::task::spawn_blocking(move || {
        tempfile::Builder::new()
            .prefix(".pdfsplit-writecheck-")
            .tempfile_in(&check_dir)
            .map(drop)
    })
    .await
    .map_err(|e| PdfSplitError::Internal(format!("Output write check panicked: {e}")))?
    .map_err(unwritable)?;

    Ok(root)
}
