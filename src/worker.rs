//! Worker pool: claim jobs, run the collaborators, commit, record.
//!
//! Each of the N workers loops on [`JobQueue::claim`]. A claimed job goes
//! through four stages:
//!
//! ```text
//! readiness ──▶ split ──▶ per page: detect ─▶ rotate? ──▶ commit + ledger
//! ```
//!
//! Every collaborator call runs on the blocking pool. Between calls the
//! worker checks the shutdown token, so a call that has started is allowed
//! to finish but no new one is begun once shutdown is requested.
//!
//! A failure is classified by [`RetryPolicy`]. A retry does *not* hold a
//! worker: the job sleeps in its own task and is put back on the queue when
//! the delay elapses, keeping its identity in flight the whole time.

use crate::config::DeadLetterPolicy;
use crate::engine::{Engines, Orientation, PageUnit, Rotation};
use crate::error::JobError;
use crate::identity::Identity;
use crate::ledger::ProcessedLedger;
use crate::output::{OutputPage, OutputWriter};
use crate::pipeline::input;
use crate::progress::ProgressCallback;
use crate::queue::{JobQueue, PdfJob};
use crate::retry::{ErrorClass, RetryDecision, RetryPolicy};
use crate::service::StatsCounters;
use crate::sink::{DeadLetter, ErrorSink};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of one attempt at a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Every page was written and the ledger updated.
    Success(Vec<PathBuf>),
    RetryableFailure(JobError),
    TerminalFailure(JobError),
    /// Shutdown interrupted the job between collaborator calls.
    Abandoned,
}

/// Identities dead-lettered under [`DeadLetterPolicy::Quarantine`].
///
/// Lives for the process lifetime only; a restart clears it.
#[derive(Debug, Default)]
pub struct Quarantine {
    ids: Mutex<HashSet<Identity>>,
}

impl Quarantine {
    pub fn insert(&self, identity: Identity) {
        self.ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(identity);
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(identity)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a worker shares with its siblings and the dispatcher.
pub struct WorkerContext {
    pub queue: Arc<JobQueue>,
    pub ledger: Arc<ProcessedLedger>,
    pub engines: Engines,
    pub output: Arc<OutputWriter>,
    pub retry: RetryPolicy,
    pub sink: Arc<dyn ErrorSink>,
    pub progress: ProgressCallback,
    pub dead_letter_policy: DeadLetterPolicy,
    pub quarantine: Arc<Quarantine>,
    pub stats: Arc<StatsCounters>,
    pub shutdown: CancellationToken,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("queue", &self.queue)
            .field("ledger", &self.ledger)
            .field("retry", &self.retry)
            .field("dead_letter_policy", &self.dead_letter_policy)
            .finish_non_exhaustive()
    }
}

impl WorkerContext {
    fn checkpoint(&self) -> Result<(), JobError> {
        if self.shutdown.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Fixed-size set of worker tasks.
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks (at least one) pulling from `ctx.queue`.
    pub fn spawn(workers: usize, ctx: Arc<WorkerContext>) -> Self {
        let handles = (0..workers.max(1))
            .map(|id| {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move { run_worker(id, ctx).await })
            })
            .collect();
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit. Workers exit once the queue is closed.
    pub async fn join(self) {
        for res in futures::future::join_all(self.handles).await {
            if let Err(e) = res {
                error!("Worker task failed: {}", e);
            }
        }
    }
}

async fn run_worker(id: usize, ctx: Arc<WorkerContext>) {
    debug!("Worker {} started", id);

    while let Some(mut job) = ctx.queue.claim().await {
        if ctx.ledger.contains(&job.identity).await {
            debug!(
                "Worker {}: {} already in ledger, skipping",
                id,
                job.source_path.display()
            );
            StatsCounters::bump(&ctx.stats.skipped_done);
            ctx.queue.release(&job.identity);
            continue;
        }

        let attempt = job.attempt_count + 1;
        info!(
            "Worker {}: processing {} (attempt {}/{}, id {})",
            id,
            job.source_path.display(),
            attempt,
            ctx.retry.max_attempts(),
            job.identity.short()
        );
        ctx.progress.on_job_started(&job.source_path, attempt);
        let started = Instant::now();

        match execute(&ctx, &job).await {
            WorkerOutcome::Success(paths) => {
                ctx.queue.release(&job.identity);
                StatsCounters::bump(&ctx.stats.completed);
                info!(
                    "Finished {} → {} page(s) in {:.2}s",
                    job.source_path.display(),
                    paths.len(),
                    started.elapsed().as_secs_f64()
                );
                ctx.progress.on_job_complete(&job.source_path, paths.len());
            }
            WorkerOutcome::Abandoned => {
                ctx.queue.release(&job.identity);
                info!(
                    "Abandoned {} at shutdown; it will be picked up on restart",
                    job.source_path.display()
                );
            }
            WorkerOutcome::RetryableFailure(err) | WorkerOutcome::TerminalFailure(err) => {
                job.attempt_count = attempt;
                handle_failure(&ctx, job, err);
            }
        }
    }

    debug!("Worker {} stopped", id);
}

/// Run every stage of one attempt and classify the result.
pub async fn execute(ctx: &WorkerContext, job: &PdfJob) -> WorkerOutcome {
    match run_stages(ctx, job).await {
        Ok(paths) => WorkerOutcome::Success(paths),
        Err(JobError::Cancelled) => WorkerOutcome::Abandoned,
        Err(err) => match ctx.retry.classify(&err) {
            ErrorClass::Retryable => WorkerOutcome::RetryableFailure(err),
            ErrorClass::Terminal => WorkerOutcome::TerminalFailure(err),
        },
    }
}

async fn run_stages(ctx: &WorkerContext, job: &PdfJob) -> Result<Vec<PathBuf>, JobError> {
    ctx.checkpoint()?;
    input::wait_ready(&job.source_path).await?;

    ctx.checkpoint()?;
    let splitter = Arc::clone(&ctx.engines.splitter);
    let source = job.source_path.clone();
    let units = blocking(move || splitter.split(&source)).await?;
    if units.is_empty() {
        return Err(JobError::CorruptInput {
            path: job.source_path.clone(),
            detail: "document has no pages".to_string(),
        });
    }
    debug!("Split {} into {} page(s)", job.source_path.display(), units.len());

    let page_total = units.len();
    let mut pages = Vec::with_capacity(page_total);
    for unit in units {
        ctx.checkpoint()?;
        let engines = ctx.engines.clone();
        let source = job.source_path.clone();
        let page = blocking(move || orient_page(&engines, &source, unit)).await?;
        pages.push(page);
    }

    ctx.checkpoint()?;
    let output = Arc::clone(&ctx.output);
    let owned_job = job.clone();
    let written = blocking(move || output.commit(&owned_job, &pages)).await?;
    if written.len() != page_total {
        warn!(
            "{} has {} page(s) but only {} were written; see the collision warnings",
            job.source_path.display(),
            page_total,
            written.len()
        );
        StatsCounters::bump(&ctx.stats.partial_outputs);
    }

    // The ledger append is the commit point: only after it succeeds is the
    // identity skipped on the next restart.
    ctx.ledger
        .mark_complete(&job.identity, &job.source_path, &written)
        .await?;
    Ok(written)
}

/// Detect one page's orientation and rotate it if needed. Blocking.
fn orient_page(engines: &Engines, source: &Path, unit: PageUnit) -> Result<OutputPage, JobError> {
    let page_num = unit.page_num();
    let pdf = match engines.detector.detect(&unit)? {
        Orientation::Detected(Rotation::Deg0) => unit.pdf,
        Orientation::Detected(rotation) => {
            info!(
                "Page {}: rotating {}° ({})",
                page_num,
                rotation.degrees(),
                source.display()
            );
            engines.rotator.rotate(&unit, rotation)?
        }
        Orientation::Unknown => {
            warn!(
                "Page {}: orientation unknown, keeping as-is ({})",
                page_num,
                source.display()
            );
            unit.pdf
        }
    };
    Ok(OutputPage { page_num, pdf })
}

async fn blocking<T, F>(f: F) -> Result<T, JobError>
where
    F: FnOnce() -> Result<T, JobError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| JobError::Internal(format!("Worker task panicked: {e}")))?
}

fn handle_failure(ctx: &Arc<WorkerContext>, job: PdfJob, err: JobError) {
    match ctx.retry.decide(&err, job.attempt_count) {
        RetryDecision::Retry(delay) => {
            warn!(
                "Attempt {}/{} failed for {}: {}; retrying in {:.1}s",
                job.attempt_count,
                ctx.retry.max_attempts(),
                job.source_path.display(),
                err,
                delay.as_secs_f64()
            );
            StatsCounters::bump(&ctx.stats.retried);
            ctx.progress
                .on_job_retry(&job.source_path, job.attempt_count, delay, &err.to_string());
            schedule_retry(Arc::clone(ctx), job, delay);
        }
        RetryDecision::DeadLetter => dead_letter(ctx, job, err),
    }
}

/// Sleep off the retry delay outside the worker pool, then re-queue.
fn schedule_retry(ctx: Arc<WorkerContext>, job: PdfJob, delay: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                debug!("Re-queueing {} (attempt {})", job.source_path.display(), job.attempt_count + 1);
                ctx.queue.requeue(job);
            }
            _ = ctx.shutdown.cancelled() => {
                ctx.queue.release(&job.identity);
            }
        }
    });
}

fn dead_letter(ctx: &WorkerContext, job: PdfJob, err: JobError) {
    report_dead_letter(
        ctx,
        DeadLetter {
            identity: job.identity.clone(),
            source_path: job.source_path.clone(),
            attempts: job.attempt_count,
            error: err,
            at: chrono::Local::now(),
        },
    );

    if ctx.dead_letter_policy == DeadLetterPolicy::Quarantine {
        ctx.quarantine.insert(job.identity.clone());
    }
    ctx.queue.release(&job.identity);
}

/// Log a terminal failure, hand it to the error sink and count it.
pub(crate) fn report_dead_letter(ctx: &WorkerContext, letter: DeadLetter) {
    error!(
        "Giving up on {} after {} attempt(s): {}",
        letter.source_path.display(),
        letter.attempts,
        letter.error
    );
    if let Err(e) = ctx.sink.record(&letter) {
        error!(
            "Could not record dead letter for {}: {}",
            letter.source_path.display(),
            e
        );
    }
    StatsCounters::bump(&ctx.stats.dead_lettered);
    ctx.progress.on_job_dead_lettered(
        &letter.source_path,
        letter.attempts,
        &letter.error.to_string(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backoff, CollisionPolicy};
    use crate::engine::{OrientationDetector, Rotator, Splitter};
    use crate::progress::NoopProgressCallback;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct TwoPages;
    impl Splitter for TwoPages {
        fn split(&self, _source: &Path) -> Result<Vec<PageUnit>, JobError> {
            Ok(vec![
                PageUnit::new(0, b"%PDF one".to_vec()),
                PageUnit::new(1, b"%PDF two".to_vec()),
            ])
        }
    }

    /// Second page is upside down.
    struct SecondUpsideDown;
    impl OrientationDetector for SecondUpsideDown {
        fn detect(&self, page: &PageUnit) -> Result<Orientation, JobError> {
            Ok(match page.index {
                1 => Orientation::Detected(Rotation::Deg180),
                _ => Orientation::Detected(Rotation::Deg0),
            })
        }
    }

    struct AlwaysUnknown;
    impl OrientationDetector for AlwaysUnknown {
        fn detect(&self, _page: &PageUnit) -> Result<Orientation, JobError> {
            Ok(Orientation::Unknown)
        }
    }

    #[derive(Default)]
    struct Tagging {
        calls: AtomicUsize,
    }
    impl Rotator for Tagging {
        fn rotate(&self, page: &PageUnit, rotation: Rotation) -> Result<Vec<u8>, JobError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut out = format!("ROT{}:", rotation.degrees()).into_bytes();
            out.extend_from_slice(&page.pdf);
            Ok(out)
        }
    }

    struct Fixture {
        _dir: TempDir,
        source: PathBuf,
        ctx: WorkerContext,
    }

    async fn fixture(engines: Engines) -> Fixture {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        std::fs::create_dir_all(&input).unwrap();
        let source = input.join("scan.pdf");
        std::fs::write(&source, b"%PDF-1.7 fake").unwrap();

        struct NullSink;
        impl ErrorSink for NullSink {
            fn record(&self, _letter: &DeadLetter) -> std::io::Result<()> {
                Ok(())
            }
        }

        let ctx = WorkerContext {
            queue: Arc::new(JobQueue::new()),
            ledger: Arc::new(
                ProcessedLedger::load(dir.path().join("processed.txt"))
                    .await
                    .unwrap(),
            ),
            engines,
            output: Arc::new(OutputWriter::new(&input, &output, CollisionPolicy::Suffix)),
            retry: RetryPolicy::new(3, Duration::from_millis(10), Backoff::Fixed),
            sink: Arc::new(NullSink),
            progress: Arc::new(NoopProgressCallback),
            dead_letter_policy: DeadLetterPolicy::RetryOnTrigger,
            quarantine: Arc::new(Quarantine::default()),
            stats: Arc::new(StatsCounters::default()),
            shutdown: CancellationToken::new(),
        };
        Fixture {
            _dir: dir,
            source,
            ctx,
        }
    }

    fn job(source: &Path) -> PdfJob {
        PdfJob::new(Identity::new("a".repeat(64)), source)
    }

    #[tokio::test]
    async fn success_rotates_only_pages_that_need_it() {
        let rotator = Arc::new(Tagging::default());
        let f = fixture(Engines::new(
            Arc::new(TwoPages),
            Arc::new(SecondUpsideDown),
            rotator.clone(),
        ))
        .await;
        let job = job(&f.source);

        let WorkerOutcome::Success(paths) = execute(&f.ctx, &job).await else {
            panic!("expected success");
        };
        assert_eq!(paths.len(), 2);
        assert_eq!(rotator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(&paths[0]).unwrap(), b"%PDF one");
        assert_eq!(std::fs::read(&paths[1]).unwrap(), b"ROT180:%PDF two");
        assert!(f.ctx.ledger.contains(&job.identity).await);
        assert_eq!(f.ctx.stats.snapshot().partial_outputs, 0);
    }

    #[tokio::test]
    async fn skipped_page_is_counted_as_partial_output() {
        let mut f = fixture(Engines::new(
            Arc::new(TwoPages),
            Arc::new(AlwaysUnknown),
            Arc::new(Tagging::default()),
        ))
        .await;
        let input = f._dir.path().join("in");
        let output = f._dir.path().join("out");
        f.ctx.output = Arc::new(OutputWriter::new(&input, &output, CollisionPolicy::Skip));
        std::fs::create_dir_all(output.join("scan")).unwrap();
        std::fs::write(output.join("scan/page_2.pdf"), b"foreign").unwrap();

        let job = job(&f.source);
        let WorkerOutcome::Success(paths) = execute(&f.ctx, &job).await else {
            panic!("expected success");
        };
        assert_eq!(paths, vec![output.join("scan/page_1.pdf")]);
        assert_eq!(f.ctx.stats.snapshot().partial_outputs, 1);
        assert!(f.ctx.ledger.contains(&job.identity).await);
    }

    #[tokio::test]
    async fn unknown_orientation_passes_through() {
        let rotator = Arc::new(Tagging::default());
        let f = fixture(Engines::new(
            Arc::new(TwoPages),
            Arc::new(AlwaysUnknown),
            rotator.clone(),
        ))
        .await;
        let outcome = execute(&f.ctx, &job(&f.source)).await;
        assert!(matches!(outcome, WorkerOutcome::Success(ref p) if p.len() == 2));
        assert_eq!(rotator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn corrupt_source_is_terminal() {
        let f = fixture(Engines::new(
            Arc::new(TwoPages),
            Arc::new(AlwaysUnknown),
            Arc::new(Tagging::default()),
        ))
        .await;
        std::fs::write(&f.source, b"not a pdf").unwrap();
        let outcome = execute(&f.ctx, &job(&f.source)).await;
        assert!(matches!(
            outcome,
            WorkerOutcome::TerminalFailure(JobError::CorruptInput { .. })
        ));
        assert!(f.ctx.ledger.is_empty().await);
    }

    #[tokio::test]
    async fn cancelled_before_start_is_abandoned() {
        let f = fixture(Engines::new(
            Arc::new(TwoPages),
            Arc::new(AlwaysUnknown),
            Arc::new(Tagging::default()),
        ))
        .await;
        f.ctx.shutdown.cancel();
        assert_eq!(execute(&f.ctx, &job(&f.source)).await, WorkerOutcome::Abandoned);
        assert!(f.ctx.ledger.is_empty().await);
    }

    #[tokio::test]
    async fn dead_letter_releases_and_quarantines() {
        let mut f = fixture(Engines::new(
            Arc::new(TwoPages),
            Arc::new(AlwaysUnknown),
            Arc::new(Tagging::default()),
        ))
        .await;
        f.ctx.dead_letter_policy = DeadLetterPolicy::Quarantine;
        let mut j = job(&f.source);
        f.ctx.queue.enqueue(j.clone());
        let _ = f.ctx.queue.claim().await;
        j.attempt_count = 1;

        dead_letter(
            &f.ctx,
            j.clone(),
            JobError::CorruptInput {
                path: f.source.clone(),
                detail: "bad".into(),
            },
        );
        assert!(!f.ctx.queue.is_in_flight(&j.identity));
        assert!(f.ctx.quarantine.contains(&j.identity));
        assert_eq!(f.ctx.stats.snapshot().dead_lettered, 1);
    }
}
