//! CLI binary for edgequake-pdfsplit.
//!
//! A thin shim over the library crate: maps flags and environment variables
//! to `WatchConfig`, installs logging, and runs the service until Ctrl-C or
//! SIGTERM.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use edgequake_pdfsplit::{
    default_engines, Backoff, CollisionPolicy, DeadLetterPolicy, IdentityMode, PdfSplitService,
    ProgressCallback, ServiceProgressCallback, WatchConfig,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner with a running "done/total" counter and one line per finished file.
///
/// The total grows as files are discovered, so a bar with a fixed length
/// would be wrong most of the time.
struct CliProgressCallback {
    bar: ProgressBar,
    queued: AtomicU64,
    done: AtomicU64,
    failed: AtomicU64,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  ⏱ {elapsed}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Watching");
        bar.set_message("waiting for PDFs…");
        bar.enable_steady_tick(Duration::from_millis(120));

        Arc::new(Self {
            bar,
            queued: AtomicU64::new(0),
            done: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    fn refresh(&self) {
        let queued = self.queued.load(Ordering::SeqCst);
        let done = self.done.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let mut msg = format!("{}/{} PDFs", done + failed, queued);
        if failed > 0 {
            msg.push_str(&format!("  ({} failed)", failed));
        }
        self.bar.set_message(msg);
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ServiceProgressCallback for CliProgressCallback {
    fn on_job_queued(&self, _source: &Path) {
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.refresh();
    }

    fn on_job_complete(&self, source: &Path, pages: usize) {
        self.done.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} {}  {}",
            green("✓"),
            source.display(),
            dim(&format!("{pages} page(s)"))
        ));
        self.refresh();
    }

    fn on_job_retry(&self, source: &Path, attempt: u32, delay: Duration, error: &str) {
        self.bar.println(format!(
            "  {} {}  {}",
            cyan("↻"),
            source.display(),
            dim(&format!(
                "attempt {attempt} failed, retry in {:.1}s: {}",
                delay.as_secs_f64(),
                truncate(error, 80)
            ))
        ));
    }

    fn on_job_dead_lettered(&self, source: &Path, attempts: u32, error: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} {}  {}",
            red("✗"),
            source.display(),
            red(&format!("gave up after {attempts} attempt(s): {}", truncate(error, 80)))
        ));
        self.refresh();
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}\u{2026}")
    } else {
        s.to_string()
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Watch ./input, write pages to ./output
  pdfsplit

  # Custom folders, 8 workers
  pdfsplit --watch-folder /srv/scans --output-folder /srv/pages --max-workers 8

  # Reprocess everything from scratch
  pdfsplit --reset-progress

  # Show the effective configuration and exit
  pdfsplit --print-config

OUTPUT LAYOUT:
  input/Invoices 2024/Scan 01.pdf  →  output/invoices_2024/scan_01/page_1.pdf
                                              ...            /page_N.pdf

ENVIRONMENT VARIABLES:
  Every option can also be set through the variable shown in --help, or in
  a .env file in the working directory. RUST_LOG overrides the log filter.

EXTERNAL ENGINES:
  pdfium      PDFIUM_LIB_PATH=/dir/with/libpdfium, or install it system-wide
  tesseract   TESSERACT_CMD=/usr/bin/tesseract (needs the osd traineddata)
"#;

/// Watch a folder and split every PDF into upright single-page PDFs.
#[derive(Parser, Debug)]
#[command(
    name = "pdfsplit",
    version,
    about = "Watch a folder and split every PDF into upright single-page PDFs",
    long_about = "Watch a folder tree for PDF files and split each one into single-page PDFs, \
rotating pages whose text is sideways or upside down. Each file is processed once per \
file state; progress survives restarts via a ledger file.",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Root directory monitored recursively for PDFs.
    #[arg(long, env = "WATCH_FOLDER", default_value = "./input")]
    watch_folder: PathBuf,

    /// Root directory for produced pages.
    #[arg(long, env = "OUTPUT_FOLDER", default_value = "./output")]
    output_folder: PathBuf,

    /// Ledger of completed files.
    #[arg(long, env = "PROCESSED_FILE_PATH", default_value = "./processed_files.txt")]
    processed_file_path: PathBuf,

    /// Terminal-failure log.
    #[arg(long, env = "ERROR_LOG_PATH", default_value = "./logs/error_log.txt")]
    error_log_path: PathBuf,

    /// Warning log (every WARN and ERROR event is mirrored here).
    #[arg(long, env = "WARNINGS_LOG_PATH", default_value = "./logs/warnings_log.txt")]
    warnings_log_path: PathBuf,

    /// Number of concurrent workers.
    #[arg(short = 'j', long, env = "MAX_WORKERS", default_value_t = 4)]
    max_workers: usize,

    /// Maximum attempts per file before it is dead-lettered.
    #[arg(long, env = "RETRIES", default_value_t = 5)]
    retries: u32,

    /// Delay between attempts, in seconds.
    #[arg(long, env = "RETRY_DELAY", default_value_t = 1.0)]
    retry_delay: f64,

    /// Retry delay growth: fixed or exponential.
    #[arg(long, env = "RETRY_BACKOFF", default_value = "fixed")]
    retry_backoff: Backoff,

    /// Clear the ledger at startup so every file is processed again.
    #[arg(
        long,
        env = "RESET_PROGRESS",
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value_t = false,
        default_missing_value = "true",
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    reset_progress: bool,

    /// Quiet window (ms) a file must stay untouched before it is taken in.
    #[arg(long, env = "DEBOUNCE_MS", default_value_t = 500)]
    debounce_ms: u64,

    /// File identity: metadata (path+size+mtime) or content (SHA-256).
    #[arg(long, env = "IDENTITY_MODE", default_value = "metadata")]
    identity_mode: IdentityMode,

    /// Occupied page path not written by pdfsplit: suffix or skip.
    #[arg(long, env = "COLLISION_POLICY", default_value = "suffix")]
    collision_policy: CollisionPolicy,

    /// After a file is dead-lettered: retry-on-trigger or quarantine.
    #[arg(long, env = "DEAD_LETTER_POLICY", default_value = "retry-on-trigger")]
    dead_letter_policy: DeadLetterPolicy,

    /// Directory containing the pdfium shared library.
    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pdfium_lib_path: Option<PathBuf>,

    /// Tesseract executable.
    #[arg(long, env = "TESSERACT_CMD", default_value = "tesseract")]
    tesseract_cmd: PathBuf,

    /// Print the effective configuration as JSON and exit.
    #[arg(long)]
    print_config: bool,

    /// Disable the progress spinner.
    #[arg(long, env = "PDFSPLIT_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDFSPLIT_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDFSPLIT_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = load_env_file(None);
    let cli = Cli::parse();

    let show_progress = !cli.quiet && !cli.no_progress && !cli.print_config;
    let progress = show_progress.then(CliProgressCallback::new);
    let config = build_config(
        &cli,
        progress.clone().map(|cb| cb as ProgressCallback),
    )?;

    if cli.print_config {
        println!(
            "{}",
            serde_json::to_string_pretty(&config).context("Failed to serialise configuration")?
        );
        return Ok(());
    }

    init_logging(&cli, &config.warnings_log_path)?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown requested");
            shutdown.cancel();
        });
    }

    if !cli.quiet {
        eprintln!(
            "{} {} {} {}",
            cyan("◆"),
            bold(&config.watch_folder.display().to_string()),
            dim("→"),
            bold(&config.output_folder.display().to_string()),
        );
    }

    let engines = default_engines(&config);
    let service = PdfSplitService::new(config, engines);
    let result = service.run(shutdown).await;

    if let Some(cb) = &progress {
        cb.finish();
    }
    let stats = result.context("Service failed to start")?;

    if !cli.quiet {
        eprintln!(
            "{} {} completed  {} dead-lettered  {} retried  {} skipped",
            if stats.dead_lettered == 0 {
                green("✔")
            } else {
                cyan("⚠")
            },
            bold(&stats.completed.to_string()),
            stats.dead_lettered,
            stats.retried,
            stats.skipped_done,
        );
        if stats.partial_outputs > 0 {
            eprintln!(
                "{} {} file(s) written with missing pages (name collisions, see warnings log)",
                cyan("⚠"),
                stats.partial_outputs
            );
        }
    }
    Ok(())
}

/// Load `.env` (searched upwards from the working directory, or `path`).
/// Its values override variables already set in the environment.
fn load_env_file(path: Option<&Path>) -> Option<PathBuf> {
    match path {
        Some(p) => dotenvy::from_path_override(p).ok().map(|()| p.to_path_buf()),
        None => dotenvy::dotenv_override().ok(),
    }
}

/// Map CLI args to `WatchConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<WatchConfig> {
    if !cli.retry_delay.is_finite() || cli.retry_delay < 0.0 {
        anyhow::bail!("RETRY_DELAY must be a non-negative number of seconds (got {})", cli.retry_delay);
    }

    let mut builder = WatchConfig::builder()
        .watch_folder(&cli.watch_folder)
        .output_folder(&cli.output_folder)
        .processed_file_path(&cli.processed_file_path)
        .error_log_path(&cli.error_log_path)
        .warnings_log_path(&cli.warnings_log_path)
        .max_workers(cli.max_workers)
        .retries(cli.retries)
        .retry_delay_secs(cli.retry_delay)
        .retry_backoff(cli.retry_backoff)
        .reset_progress(cli.reset_progress)
        .debounce_ms(cli.debounce_ms)
        .identity_mode(cli.identity_mode)
        .collision_policy(cli.collision_policy)
        .dead_letter_policy(cli.dead_letter_policy)
        .tesseract_cmd(&cli.tesseract_cmd);

    if let Some(ref dir) = cli.pdfium_lib_path {
        builder = builder.pdfium_lib_path(dir);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// stderr (filtered by RUST_LOG / --verbose / --quiet) plus a WARN+ file layer.
fn init_logging(cli: &Cli, warnings_log: &Path) -> Result<()> {
    // The spinner already reports per-file progress; keep INFO out of its way.
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else if !cli.no_progress {
        "warn"
    } else {
        "info"
    };
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if let Some(parent) = warnings_log.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let warn_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(warnings_log)
        .with_context(|| format!("Failed to open warnings log {}", warnings_log.display()))?;

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_filter(console_filter),
        )
        .with(
            fmt::layer()
                .with_writer(Mutex::new(warn_file))
                .with_ansi(false)
                .with_target(false)
                .with_filter(LevelFilter::WARN),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
