//! Service-level tests with in-process fake engines.
//!
//! The fakes read a tiny text format instead of real PDFs:
//!
//! ```text
//! %PDF pages=3 rot2=180
//! ```
//!
//! declares a three-page document whose second page is upside down. The
//! splitter turns each page into `%PDF page=N rot=R`, the detector reads `rot=`
//! back, and the rotator prefixes the bytes with `ROT<deg>:` so tests can see
//! exactly which pages were corrected.

use edgequake_pdfsplit::{
    DeadLetter, DeadLetterPolicy, Engines, ErrorSink, JobError, Orientation,
    OrientationDetector, PageUnit, PdfSplitError, PdfSplitService, Rotation, Rotator,
    ServiceProgressCallback, ServiceStats, Splitter, WatchConfig, WatchConfigBuilder,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ── Fakes ────────────────────────────────────────────────────────────────────

/// Splits the text format above. Counts calls per file name and can be slowed
/// down to keep a job in flight.
#[derive(Default)]
struct FakeSplitter {
    calls: Mutex<HashMap<String, usize>>,
    delay: Duration,
    started: AtomicUsize,
}

impl FakeSplitter {
    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn calls_for(&self, name: &str) -> usize {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

impl Splitter for FakeSplitter {
    fn split(&self, source: &Path) -> Result<Vec<PageUnit>, JobError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        *self.calls.lock().unwrap().entry(name).or_default() += 1;
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let text = std::fs::read_to_string(source)
            .map_err(|e| JobError::from_source_io(source, &e))?;
        let mut pages = 1usize;
        let mut rotations: HashMap<usize, u16> = HashMap::new();
        for token in text.split_whitespace() {
            if let Some(n) = token.strip_prefix("pages=") {
                pages = n.parse().unwrap_or(1);
            } else if let Some(rest) = token.strip_prefix("rot") {
                if let Some((page, deg)) = rest.split_once('=') {
                    if let (Ok(p), Ok(d)) = (page.parse(), deg.parse()) {
                        rotations.insert(p, d);
                    }
                }
            }
        }

        Ok((0..pages)
            .map(|i| {
                let rot = rotations.get(&(i + 1)).copied().unwrap_or(0);
                PageUnit::new(i, format!("%PDF page={} rot={}", i + 1, rot).into_bytes())
            })
            .collect())
    }
}

/// Reads the `rot=` marker the fake splitter embedded in each page.
struct MarkerDetector;

impl OrientationDetector for MarkerDetector {
    fn detect(&self, page: &PageUnit) -> Result<Orientation, JobError> {
        let text = String::from_utf8_lossy(&page.pdf);
        let rotation = text
            .split_whitespace()
            .find_map(|t| t.strip_prefix("rot="))
            .and_then(|d| d.parse::<i32>().ok())
            .and_then(Rotation::from_degrees);
        Ok(rotation.map_or(Orientation::Unknown, Orientation::Detected))
    }
}

struct TaggingRotator;

impl Rotator for TaggingRotator {
    fn rotate(&self, page: &PageUnit, rotation: Rotation) -> Result<Vec<u8>, JobError> {
        let mut out = format!("ROT{}:", rotation.degrees()).into_bytes();
        out.extend_from_slice(&page.pdf);
        Ok(out)
    }
}

/// A splitter whose engine is never there. Records when each attempt started.
#[derive(Default)]
struct BrokenSplitter {
    attempts: Mutex<Vec<Instant>>,
}

impl Splitter for BrokenSplitter {
    fn split(&self, _source: &Path) -> Result<Vec<PageUnit>, JobError> {
        self.attempts.lock().unwrap().push(Instant::now());
        Err(JobError::EngineUnavailable {
            engine: "pdfium".into(),
            detail: "library not found".into(),
        })
    }
}

#[derive(Default)]
struct MemorySink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl ErrorSink for MemorySink {
    fn record(&self, letter: &DeadLetter) -> std::io::Result<()> {
        self.letters.lock().unwrap().push(letter.clone());
        Ok(())
    }
}

#[derive(Default)]
struct Counting {
    complete: AtomicUsize,
    dead: AtomicUsize,
}

impl ServiceProgressCallback for Counting {
    fn on_job_complete(&self, _source: &Path, _pages: usize) {
        self.complete.fetch_add(1, Ordering::SeqCst);
    }

    fn on_job_dead_lettered(&self, _source: &Path, _attempts: u32, _error: &str) {
        self.dead.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    _dir: TempDir,
    input: PathBuf,
    output: PathBuf,
    ledger: PathBuf,
    errors: PathBuf,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let base = dir.path().canonicalize().unwrap();
        let input = base.join("in");
        std::fs::create_dir_all(&input).unwrap();
        Self {
            input,
            output: base.join("out"),
            ledger: base.join("state").join("processed.txt"),
            errors: base.join("state").join("errors.log"),
            _dir: dir,
        }
    }

    fn config(&self, progress: &Arc<Counting>) -> WatchConfigBuilder {
        WatchConfig::builder()
            .watch_folder(&self.input)
            .output_folder(&self.output)
            .processed_file_path(&self.ledger)
            .error_log_path(&self.errors)
            .max_workers(2)
            .retries(3)
            .retry_delay_ms(50)
            .debounce_ms(50)
            .progress_callback(progress.clone())
    }

    fn write_source(&self, rel: &str, body: &str) -> PathBuf {
        let path = self.input.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, body).unwrap();
        path
    }

    fn ledger_lines(&self) -> usize {
        std::fs::read_to_string(&self.ledger)
            .map(|t| t.lines().filter(|l| !l.trim().is_empty()).count())
            .unwrap_or(0)
    }

    fn page(&self, rel: &str) -> String {
        std::fs::read_to_string(self.output.join(rel)).unwrap()
    }

    fn page_files(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack = vec![self.output.clone()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().is_some_and(|e| e == "pdf") {
                    let rel = path.strip_prefix(&self.output).unwrap();
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        out.sort();
        out
    }
}

fn engines(splitter: Arc<dyn Splitter>) -> Engines {
    Engines::new(splitter, Arc::new(MarkerDetector), Arc::new(TaggingRotator))
}

struct Running {
    shutdown: CancellationToken,
    handle: JoinHandle<Result<ServiceStats, PdfSplitError>>,
}

impl Running {
    async fn stop(self) -> ServiceStats {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap()
    }
}

fn start(config: WatchConfig, engines: Engines, sink: Option<Arc<dyn ErrorSink>>) -> Running {
    let mut service = PdfSplitService::new(config, engines);
    if let Some(sink) = sink {
        service = service.with_error_sink(sink);
    }
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { service.run(token).await });
    Running { shutdown, handle }
}

/// Poll `cond` until it holds or five seconds pass.
async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn splits_and_straightens_a_scanned_document() {
    let h = Harness::new();
    h.write_source("scan1.pdf", "%PDF pages=3 rot2=180");
    let progress = Arc::new(Counting::default());
    let splitter = Arc::new(FakeSplitter::default());

    let run = start(
        h.config(&progress).build().unwrap(),
        engines(splitter.clone()),
        None,
    );
    assert!(wait_until(|| progress.complete.load(Ordering::SeqCst) == 1).await);
    let stats = run.stop().await;

    assert_eq!(stats.completed, 1);
    assert_eq!(
        h.page_files(),
        vec![
            "scan1/page_1.pdf".to_string(),
            "scan1/page_2.pdf".to_string(),
            "scan1/page_3.pdf".to_string(),
        ]
    );
    assert_eq!(h.page("scan1/page_1.pdf"), "%PDF page=1 rot=0");
    assert_eq!(h.page("scan1/page_2.pdf"), "ROT180:%PDF page=2 rot=180");
    assert_eq!(h.page("scan1/page_3.pdf"), "%PDF page=3 rot=0");
    assert_eq!(h.ledger_lines(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn processed_file_is_not_split_again_after_restart() {
    let h = Harness::new();
    h.write_source("scan1.pdf", "%PDF pages=2");
    let splitter = Arc::new(FakeSplitter::default());

    let progress = Arc::new(Counting::default());
    let run = start(
        h.config(&progress).build().unwrap(),
        engines(splitter.clone()),
        None,
    );
    assert!(wait_until(|| progress.complete.load(Ordering::SeqCst) == 1).await);
    run.stop().await;

    let progress = Arc::new(Counting::default());
    let run = start(
        h.config(&progress).build().unwrap(),
        engines(splitter.clone()),
        None,
    );
    tokio::time::sleep(Duration::from_millis(500)).await;
    let stats = run.stop().await;

    assert_eq!(stats.completed, 0);
    assert_eq!(stats.skipped_done, 1);
    assert_eq!(splitter.calls_for("scan1.pdf"), 1);
    assert_eq!(h.ledger_lines(), 1);
    assert_eq!(h.page_files().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_events_for_an_in_flight_file_do_not_start_a_second_job() {
    let h = Harness::new();
    let source = h.write_source("busy.pdf", "%PDF pages=1");
    let progress = Arc::new(Counting::default());
    let splitter = Arc::new(FakeSplitter::slow(Duration::from_millis(600)));

    let run = start(
        h.config(&progress).build().unwrap(),
        engines(splitter.clone()),
        None,
    );
    assert!(wait_until(|| splitter.started.load(Ordering::SeqCst) == 1).await);

    // Attribute-only changes fire events without changing the fingerprint.
    let perms = std::fs::metadata(&source).unwrap().permissions();
    for _ in 0..3 {
        std::fs::set_permissions(&source, perms.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    assert!(wait_until(|| progress.complete.load(Ordering::SeqCst) == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = run.stop().await;

    assert_eq!(stats.queued, 1);
    assert_eq!(splitter.calls_for("busy.pdf"), 1);
    assert_eq!(h.ledger_lines(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupted_job_is_picked_up_on_next_start() {
    let h = Harness::new();
    h.write_source("long.pdf", "%PDF pages=2 rot1=90");

    let progress = Arc::new(Counting::default());
    let slow = Arc::new(FakeSplitter::slow(Duration::from_millis(400)));
    let run = start(
        h.config(&progress).build().unwrap(),
        engines(slow.clone()),
        None,
    );
    assert!(wait_until(|| slow.started.load(Ordering::SeqCst) == 1).await);
    let stats = run.stop().await;

    assert_eq!(stats.completed, 0);
    assert_eq!(h.ledger_lines(), 0);
    assert!(h.page_files().is_empty());

    let progress = Arc::new(Counting::default());
    let run = start(
        h.config(&progress).build().unwrap(),
        engines(Arc::new(FakeSplitter::default())),
        None,
    );
    assert!(wait_until(|| progress.complete.load(Ordering::SeqCst) == 1).await);
    let stats = run.stop().await;

    assert_eq!(stats.completed, 1);
    assert_eq!(h.ledger_lines(), 1);
    assert_eq!(h.page("long/page_1.pdf"), "ROT90:%PDF page=1 rot=90");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_progress_reprocesses_and_replaces_own_output() {
    let h = Harness::new();
    h.write_source("scan1.pdf", "%PDF pages=2");
    let splitter = Arc::new(FakeSplitter::default());

    let progress = Arc::new(Counting::default());
    let run = start(
        h.config(&progress).build().unwrap(),
        engines(splitter.clone()),
        None,
    );
    assert!(wait_until(|| progress.complete.load(Ordering::SeqCst) == 1).await);
    run.stop().await;

    let progress = Arc::new(Counting::default());
    let run = start(
        h.config(&progress).reset_progress(true).build().unwrap(),
        engines(splitter.clone()),
        None,
    );
    assert!(wait_until(|| progress.complete.load(Ordering::SeqCst) == 1).await);
    let stats = run.stop().await;

    assert_eq!(stats.completed, 1);
    assert_eq!(splitter.calls_for("scan1.pdf"), 2);
    assert_eq!(h.ledger_lines(), 1);
    assert_eq!(
        h.page_files(),
        vec!["scan1/page_1.pdf".to_string(), "scan1/page_2.pdf".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_job_is_attempted_exactly_retries_times_then_dead_lettered() {
    let h = Harness::new();
    h.write_source("bad.pdf", "%PDF pages=1");
    let progress = Arc::new(Counting::default());
    let splitter = Arc::new(BrokenSplitter::default());
    let sink = Arc::new(MemorySink::default());

    let run = start(
        h.config(&progress).build().unwrap(),
        engines(splitter.clone()),
        Some(sink.clone() as Arc<dyn ErrorSink>),
    );
    assert!(wait_until(|| progress.dead.load(Ordering::SeqCst) == 1).await);
    // No further attempt may follow the dead letter.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let stats = run.stop().await;

    let attempts = splitter.attempts.lock().unwrap().clone();
    assert_eq!(attempts.len(), 3);
    for pair in attempts.windows(2) {
        assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(45));
    }

    assert_eq!(stats.retried, 2);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.completed, 0);

    let letters = sink.letters.lock().unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].attempts, 3);
    assert_eq!(letters[0].error.kind(), "engine_unavailable");
    assert!(letters[0].source_path.ends_with("bad.pdf"));

    assert_eq!(h.ledger_lines(), 0);
    assert!(h.page_files().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn corrupt_source_is_dead_lettered_without_retry() {
    let h = Harness::new();
    h.write_source("notes.pdf", "plain text, not a pdf");
    let progress = Arc::new(Counting::default());
    let splitter = Arc::new(FakeSplitter::default());
    let sink = Arc::new(MemorySink::default());

    let run = start(
        h.config(&progress).build().unwrap(),
        engines(splitter.clone()),
        Some(sink.clone() as Arc<dyn ErrorSink>),
    );
    assert!(wait_until(|| progress.dead.load(Ordering::SeqCst) == 1).await);
    let stats = run.stop().await;

    assert_eq!(stats.retried, 0);
    assert_eq!(splitter.total_calls(), 0);
    let letters = sink.letters.lock().unwrap();
    assert_eq!(letters[0].attempts, 1);
    assert!(matches!(letters[0].error, JobError::CorruptInput { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quarantined_file_is_ignored_until_it_changes() {
    let h = Harness::new();
    let source = h.write_source("bad.pdf", "%PDF pages=1");
    let progress = Arc::new(Counting::default());
    let splitter = Arc::new(BrokenSplitter::default());
    let sink = Arc::new(MemorySink::default());

    let config = h
        .config(&progress)
        .retries(1)
        .dead_letter_policy(DeadLetterPolicy::Quarantine)
        .build()
        .unwrap();
    let run = start(
        config,
        engines(splitter.clone()),
        Some(sink.clone() as Arc<dyn ErrorSink>),
    );
    assert!(wait_until(|| progress.dead.load(Ordering::SeqCst) == 1).await);

    // Same bytes, same fingerprint: stays quarantined.
    let perms = std::fs::metadata(&source).unwrap().permissions();
    std::fs::set_permissions(&source, perms).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(splitter.attempts.lock().unwrap().len(), 1);

    // New contents, new fingerprint: tried again.
    std::fs::write(&source, "%PDF pages=1 with more bytes").unwrap();
    assert!(wait_until(|| progress.dead.load(Ordering::SeqCst) == 2).await);
    run.stop().await;

    assert_eq!(splitter.attempts.lock().unwrap().len(), 2);
    assert_eq!(sink.letters.lock().unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nested_names_are_sanitised_and_mirrored() {
    let h = Harness::new();
    h.write_source("Invoices 2024/Scan #1 (Final).pdf", "%PDF pages=1");
    h.write_source("Invoices 2024/readme.txt", "not a pdf");
    let progress = Arc::new(Counting::default());

    let run = start(
        h.config(&progress).build().unwrap(),
        engines(Arc::new(FakeSplitter::default())),
        None,
    );
    assert!(wait_until(|| progress.complete.load(Ordering::SeqCst) == 1).await);
    let stats = run.stop().await;

    assert_eq!(stats.queued, 1);
    assert_eq!(
        h.page_files(),
        vec!["invoices_2024/scan_1_final/page_1.pdf".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_dropped_while_running_is_processed() {
    let h = Harness::new();
    let progress = Arc::new(Counting::default());

    let run = start(
        h.config(&progress).build().unwrap(),
        engines(Arc::new(FakeSplitter::default())),
        None,
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.write_source("late/arrival.pdf", "%PDF pages=2 rot1=270");

    assert!(wait_until(|| progress.complete.load(Ordering::SeqCst) == 1).await);
    run.stop().await;

    assert_eq!(h.page("late/arrival/page_1.pdf"), "ROT270:%PDF page=1 rot=270");
    assert_eq!(h.page("late/arrival/page_2.pdf"), "%PDF page=2 rot=0");
}

#[tokio::test]
async fn missing_watch_root_is_fatal() {
    let h = Harness::new();
    let progress = Arc::new(Counting::default());
    let config = h
        .config(&progress)
        .watch_folder(h.input.join("nope"))
        .build()
        .unwrap();

    let service = PdfSplitService::new(config, engines(Arc::new(FakeSplitter::default())));
    let result = service.run(CancellationToken::new()).await;
    let err = tokio_test::assert_err!(result);
    assert!(matches!(err, PdfSplitError::WatchRootMissing { .. }));
    assert!(!h.ledger.exists());
}
