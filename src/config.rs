//! Configuration types for the PDF split watcher.
//!
//! All service behaviour is controlled through [`WatchConfig`], built via its
//! [`WatchConfigBuilder`]. Every recognised key is parsed once at startup
//! into this typed structure; invalid values are rejected by
//! [`WatchConfigBuilder::build`] rather than failing deep inside a worker.
//!
//! | Key | Field | Default |
//! |-----|-------|---------|
//! | `WATCH_FOLDER` | [`WatchConfig::watch_folder`] | `./input` |
//! | `OUTPUT_FOLDER` | [`WatchConfig::output_folder`] | `./output` |
//! | `PROCESSED_FILE_PATH` | [`WatchConfig::processed_file_path`] | `./processed_files.txt` |
//! | `ERROR_LOG_PATH` | [`WatchConfig::error_log_path`] | `./logs/error_log.txt` |
//! | `WARNINGS_LOG_PATH` | [`WatchConfig::warnings_log_path`] | `./logs/warnings_log.txt` |
//! | `MAX_WORKERS` | [`WatchConfig::max_workers`] | 4 |
//! | `RETRIES` | [`WatchConfig::retries`] | 5 |
//! | `RETRY_DELAY` | [`WatchConfig::retry_delay_ms`] | 1 s |
//! | `RESET_PROGRESS` | [`WatchConfig::reset_progress`] | false |

use crate::error::PdfSplitError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Configuration for a watch-and-split run.
///
/// # Example
/// ```rust
/// use edgequake_pdfsplit::WatchConfig;
///
/// let config = WatchConfig::builder()
///     .watch_folder("./scans")
///     .max_workers(2)
///     .retries(3)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_workers, 2);
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Root directory monitored recursively for `*.pdf` files.
    pub watch_folder: PathBuf,

    /// Root under which per-page files are written, mirroring the input tree.
    pub output_folder: PathBuf,

    /// Location of the append-only processed-files ledger.
    pub processed_file_path: PathBuf,

    /// Terminal-failure log (one line per dead-lettered job).
    pub error_log_path: PathBuf,

    /// Non-fatal warning log. The library only records the path; the binary
    /// routes `WARN` level tracing events into it.
    pub warnings_log_path: PathBuf,

    /// Number of concurrent workers. Default: 4.
    pub max_workers: usize,

    /// Maximum number of attempts per job before it is dead-lettered. Default: 5.
    pub retries: u32,

    /// Delay before a failed job is re-queued, in milliseconds. Default: 1000.
    pub retry_delay_ms: u64,

    /// How the delay grows between attempts. Default: [`Backoff::Fixed`].
    pub retry_backoff: Backoff,

    /// Truncate the ledger at startup so every file is processed again.
    pub reset_progress: bool,

    /// Quiet window a path must stay untouched before it is taken in. Default: 500.
    ///
    /// Scanners and copy tools write a PDF in several steps; each step fires
    /// a notification. Waiting for the burst to settle avoids splitting a
    /// half-written file.
    pub debounce_ms: u64,

    /// How file identities are fingerprinted. Default: [`IdentityMode::Metadata`].
    pub identity_mode: IdentityMode,

    /// What happens when a page path is occupied by a file this tool did not write.
    pub collision_policy: CollisionPolicy,

    /// What happens to an identity after it has been dead-lettered.
    pub dead_letter_policy: DeadLetterPolicy,

    /// Directory holding the pdfium shared library. `None` binds the system library.
    pub pdfium_lib_path: Option<PathBuf>,

    /// Tesseract executable used for orientation detection.
    pub tesseract_cmd: PathBuf,

    /// Optional per-job progress callback.
    #[serde(skip)]
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            watch_folder: PathBuf::from("./input"),
            output_folder: PathBuf::from("./output"),
            processed_file_path: PathBuf::from("./processed_files.txt"),
            error_log_path: PathBuf::from("./logs/error_log.txt"),
            warnings_log_path: PathBuf::from("./logs/warnings_log.txt"),
            max_workers: 4,
            retries: 5,
            retry_delay_ms: 1000,
            retry_backoff: Backoff::default(),
            reset_progress: false,
            debounce_ms: 500,
            identity_mode: IdentityMode::default(),
            collision_policy: CollisionPolicy::default(),
            dead_letter_policy: DeadLetterPolicy::default(),
            pdfium_lib_path: None,
            tesseract_cmd: PathBuf::from("tesseract"),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for WatchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchConfig")
            .field("watch_folder", &self.watch_folder)
            .field("output_folder", &self.output_folder)
            .field("processed_file_path", &self.processed_file_path)
            .field("error_log_path", &self.error_log_path)
            .field("warnings_log_path", &self.warnings_log_path)
            .field("max_workers", &self.max_workers)
            .field("retries", &self.retries)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("retry_backoff", &self.retry_backoff)
            .field("reset_progress", &self.reset_progress)
            .field("debounce_ms", &self.debounce_ms)
            .field("identity_mode", &self.identity_mode)
            .field("collision_policy", &self.collision_policy)
            .field("dead_letter_policy", &self.dead_letter_policy)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ServiceProgressCallback>"),
            )
            .finish()
    }
}

impl WatchConfig {
    /// Create a new builder for `WatchConfig`.
    pub fn builder() -> WatchConfigBuilder {
        WatchConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`WatchConfig`].
#[derive(Debug)]
pub struct WatchConfigBuilder {
    config: WatchConfig,
}

impl WatchConfigBuilder {
    pub fn watch_folder(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.watch_folder = path.into();
        self
    }

    pub fn output_folder(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.output_folder = path.into();
        self
    }

    pub fn processed_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.processed_file_path = path.into();
        self
    }

    pub fn error_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.error_log_path = path.into();
        self
    }

    pub fn warnings_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.warnings_log_path = path.into();
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.config.max_workers = n;
        self
    }

    pub fn retries(mut self, n: u32) -> Self {
        self.config.retries = n;
        self
    }

    pub fn retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_delay_ms = ms;
        self
    }

    /// Set the retry delay from fractional seconds, as `RETRY_DELAY` is expressed.
    pub fn retry_delay_secs(mut self, secs: f64) -> Self {
        self.config.retry_delay_ms = (secs.max(0.0) * 1000.0).round() as u64;
        self
    }

    pub fn retry_backoff(mut self, backoff: Backoff) -> Self {
        self.config.retry_backoff = backoff;
        self
    }

    pub fn reset_progress(mut self, v: bool) -> Self {
        self.config.reset_progress = v;
        self
    }

    pub fn debounce_ms(mut self, ms: u64) -> Self {
        self.config.debounce_ms = ms;
        self
    }

    pub fn identity_mode(mut self, mode: IdentityMode) -> Self {
        self.config.identity_mode = mode;
        self
    }

    pub fn collision_policy(mut self, policy: CollisionPolicy) -> Self {
        self.config.collision_policy = policy;
        self
    }

    pub fn dead_letter_policy(mut self, policy: DeadLetterPolicy) -> Self {
        self.config.dead_letter_policy = policy;
        self
    }

    pub fn pdfium_lib_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_lib_path = Some(path.into());
        self
    }

    pub fn tesseract_cmd(mut self, cmd: impl Into<PathBuf>) -> Self {
        self.config.tesseract_cmd = cmd.into();
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<WatchConfig, PdfSplitError> {
        let c = &self.config;
        if c.max_workers == 0 {
            return Err(PdfSplitError::InvalidConfig(
                "MAX_WORKERS must be ≥ 1".into(),
            ));
        }
        if c.retries == 0 {
            return Err(PdfSplitError::InvalidConfig("RETRIES must be ≥ 1".into()));
        }
        if c.debounce_ms > 60_000 {
            return Err(PdfSplitError::InvalidConfig(format!(
                "DEBOUNCE_MS must be ≤ 60000, got {}",
                c.debounce_ms
            )));
        }
        if c.watch_folder == c.output_folder {
            return Err(PdfSplitError::InvalidConfig(format!(
                "WATCH_FOLDER and OUTPUT_FOLDER must differ (both '{}')",
                c.watch_folder.display()
            )));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// How a file's identity is fingerprinted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityMode {
    /// Path + size + modification time. Cheap; a touched-but-unchanged file
    /// counts as new. (default)
    #[default]
    Metadata,
    /// Path + SHA-256 of the file contents. Reads every byte of every file.
    Content,
}

/// Growth of the delay between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backoff {
    /// Every retry waits `retry_delay`. (default)
    #[default]
    Fixed,
    /// Retry `n` waits `retry_delay * 2^(n-1)`, capped at 60 s.
    Exponential,
}

/// Behaviour when a page path is occupied by a file this tool did not write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollisionPolicy {
    /// Write to `page_N_2.pdf`, `page_N_3.pdf`, … instead. (default)
    #[default]
    Suffix,
    /// Leave the foreign file alone and omit the page, logging a warning.
    Skip,
}

/// What happens to an identity once its job has been dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeadLetterPolicy {
    /// The identity stays eligible: the next event for the file, or the
    /// startup scan after a restart, queues it again. (default)
    #[default]
    RetryOnTrigger,
    /// The identity is ignored for the rest of this process's lifetime. A
    /// modified file gets a new identity and is processed normally.
    Quarantine,
}

macro_rules! impl_kebab_from_str {
    ($ty:ty, $key:literal, { $($name:literal => $variant:expr),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = PdfSplitError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($name => Ok($variant),)+
                    other => Err(PdfSplitError::InvalidConfig(format!(
                        concat!($key, " must be one of [", $($name, " ",)+ "], got '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

impl_kebab_from_str!(IdentityMode, "IDENTITY_MODE", {
    "metadata" => IdentityMode::Metadata,
    "content" => IdentityMode::Content,
});

impl_kebab_from_str!(Backoff, "RETRY_BACKOFF", {
    "fixed" => Backoff::Fixed,
    "exponential" => Backoff::Exponential,
});

impl_kebab_from_str!(CollisionPolicy, "COLLISION_POLICY", {
    "suffix" => CollisionPolicy::Suffix,
    "skip" => CollisionPolicy::Skip,
});

impl_kebab_from_str!(DeadLetterPolicy, "DEAD_LETTER_POLICY", {
    "retry-on-trigger" => DeadLetterPolicy::RetryOnTrigger,
    "quarantine" => DeadLetterPolicy::Quarantine,
});
