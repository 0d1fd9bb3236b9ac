//! # edgequake-pdfsplit
//!
//! Watch a folder for PDFs and split each one into upright, single-page PDFs,
//! exactly once per file state, across restarts and concurrent workers.
//!
//! ## Why this crate?
//!
//! Scanned documents arrive as multi-page PDFs with some pages upside down
//! or sideways. Splitting and straightening them is easy; doing it
//! *unattended* is not. Copy tools fire several events per file, the same
//! file shows up again after a restart, OCR engines go down, disks fill up.
//! This crate is the orchestration layer that makes the job safe to leave
//! running: debounced intake, in-flight deduplication, a durable ledger of
//! finished files, bounded retries, and atomic output commits.
//!
//! ## Pipeline Overview
//!
//! ```text
//! watch root
//!  │
//!  ├─ 1. Watch     notify events + startup scan (pipeline::watcher)
//!  ├─ 2. Debounce  one signal per settled path (pipeline::debounce)
//!  ├─ 3. Identify  path + size + mtime, or content hash (identity)
//!  ├─ 4. Dedup     skip ledger hits, drop in-flight duplicates (ledger, queue)
//!  ├─ 5. Work      N workers: split → detect → rotate (worker, engine)
//!  ├─ 6. Commit    atomic per-page writes under a mirrored tree (output)
//!  └─ 7. Record    ledger append, or retry / dead-letter (ledger, retry, sink)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdfsplit::{default_engines, PdfSplitService, WatchConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = WatchConfig::builder()
//!         .watch_folder("./input")
//!         .output_folder("./output")
//!         .max_workers(4)
//!         .build()?;
//!     let engines = default_engines(&config);
//!
//!     let shutdown = CancellationToken::new();
//!     let stop = shutdown.clone();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         stop.cancel();
//!     });
//!
//!     let stats = PdfSplitService::new(config, engines).run(shutdown).await?;
//!     eprintln!("{} file(s) split, {} dead-lettered", stats.completed, stats.dead_lettered);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdfsplit` binary (clap + anyhow + tracing-subscriber + indicatif + dotenvy) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-pdfsplit = { version = "0.1", default-features = false }
//! ```
//!
//! ## External engines
//!
//! | Engine | Used for | Located via |
//! |--------|----------|-------------|
//! | pdfium | splitting, lossless `/Rotate`, rasterisation | `PDFIUM_LIB_PATH` or the system library path |
//! | tesseract | orientation detection (`--psm 0`) | `TESSERACT_CMD` (default `tesseract` on `PATH`) |
//!
//! Both sit behind the [`Splitter`], [`OrientationDetector`] and [`Rotator`]
//! traits, so they can be replaced without touching the orchestration.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod service;
pub mod sink;
pub mod worker;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    Backoff, CollisionPolicy, DeadLetterPolicy, IdentityMode, WatchConfig, WatchConfigBuilder,
};
pub use engine::{
    Engines, Orientation, OrientationDetector, PageUnit, Rotation, Rotator, Splitter,
};
pub use error::{JobError, PdfSplitError};
pub use identity::{Identity, IdentityResolver};
pub use ledger::{ProcessedLedger, ProcessedRecord};
pub use output::{sanitize_component, OutputWriter};
pub use progress::{NoopProgressCallback, ProgressCallback, ServiceProgressCallback};
pub use queue::{EnqueueOutcome, JobQueue, PdfJob};
pub use retry::{ErrorClass, RetryDecision, RetryPolicy};
pub use service::{default_engines, PdfSplitService, ServiceStats};
pub use sink::{DeadLetter, ErrorSink, FileErrorSink};
pub use worker::{WorkerOutcome, WorkerPool};
