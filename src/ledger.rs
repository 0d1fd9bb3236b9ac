//! The processed-files ledger: durable record of completed identities.
//!
//! On disk the ledger is a newline-delimited, append-only text file. Each
//! line starts with an [`Identity`]; the optional tab-separated fields after
//! it (completion time, source path, then every page file written) are
//! informational and ignored on load, so a bare identity per line is also a
//! valid ledger.
//!
//! ```text
//! 3f5a…c1\t2026-10-19T08:12:44Z\t/srv/input/scan1.pdf\t/srv/output/scan1/page_1.pdf\t…
//! ```
//!
//! In memory the ledger is the set of all identities ever appended. Both
//! views sit behind one async mutex so appends from concurrent workers never
//! interleave, and the in-memory set is only updated after the durable append
//! succeeded; a failed write leaves both views agreeing that the identity is
//! not done.

use crate::error::{JobError, PdfSplitError};
use crate::identity::Identity;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// One completed job, as appended to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedRecord {
    pub identity: Identity,
    pub completed_at: DateTime<Utc>,
    pub source: PathBuf,
    pub output_paths: Vec<PathBuf>,
}

impl ProcessedRecord {
    /// Render the record as a single ledger line (including the trailing newline).
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{}\t{}\t{}",
            self.identity,
            self.completed_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            single_field(&self.source)
        );
        for out in &self.output_paths {
            line.push('\t');
            line.push_str(&single_field(out));
        }
        line.push('\n');
        line
    }
}

/// Keep an informational path on one line and inside one tab-separated field.
fn single_field(path: &Path) -> String {
    path.to_string_lossy()
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

/// Extract the identity from one ledger line, skipping blanks.
pub fn parse_line(line: &str) -> Option<Identity> {
    let key = line.split('\t').next().unwrap_or("").trim();
    if key.is_empty() {
        None
    } else {
        Some(Identity::new(key))
    }
}

struct LedgerState {
    done: HashSet<Identity>,
    file: Option<File>,
}

/// Durable, append-only set of completed identities.
pub struct ProcessedLedger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

impl std::fmt::Debug for ProcessedLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessedLedger")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ProcessedLedger {
    /// Open the ledger at `path` and replay it into memory.
    ///
    /// A missing or empty file yields an empty ledger. Any other read error
    /// is fatal: starting with an incomplete view would reprocess everything.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, PdfSplitError> {
        let path = path.into();
        let done = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text.lines().filter_map(parse_line).collect::<HashSet<_>>(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(source) => return Err(PdfSplitError::LedgerUnavailable { path, source }),
        };
        info!(
            "Ledger {} loaded: {} completed identities",
            path.display(),
            done.len()
        );
        Ok(Self {
            path,
            state: Mutex::new(LedgerState { done, file: None }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `identity` has been durably recorded as complete.
    pub async fn contains(&self, identity: &Identity) -> bool {
        self.state.lock().await.done.contains(identity)
    }

    /// Number of distinct completed identities.
    pub async fn len(&self) -> usize {
        self.state.lock().await.done.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Durably append a completion record, then add it to the in-memory set.
    ///
    /// Returns `Ok(false)` without writing if the identity is already
    /// recorded, so a file is never listed twice.
    ///
    /// # Errors
    /// [`JobError::LedgerWrite`] if the append or flush fails. The in-memory
    /// set is left unchanged in that case.
    pub async fn mark_complete(
        &self,
        identity: &Identity,
        source: &Path,
        output_paths: &[PathBuf],
    ) -> Result<bool, JobError> {
        let mut state = self.state.lock().await;
        if state.done.contains(identity) {
            debug!("Ledger already holds {}", identity.short());
            return Ok(false);
        }

        let record = ProcessedRecord {
            identity: identity.clone(),
            completed_at: Utc::now(),
            source: source.to_path_buf(),
            output_paths: output_paths.to_vec(),
        };

        if let Err(e) = self.append(&mut state, &record).await {
            // Drop the handle; the next attempt reopens from scratch.
            state.file = None;
            error!(
                "Ledger append failed for {} ({}): {}",
                identity.short(),
                source.display(),
                e
            );
            return Err(JobError::LedgerWrite {
                path: self.path.clone(),
                detail: e.to_string(),
            });
        }

        state.done.insert(record.identity);
        Ok(true)
    }

    async fn append(&self, state: &mut LedgerState, record: &ProcessedRecord) -> std::io::Result<()> {
        if state.file.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            state.file = Some(file);
        }
        let Some(file) = state.file.as_mut() else {
            return Err(std::io::Error::other("ledger handle missing"));
        };
        file.write_all(record.to_line().as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await
    }

    /// Clear every record: truncate the file and empty the in-memory set.
    pub async fn reset(&self) -> Result<(), PdfSplitError> {
        let mut state = self.state.lock().await;
        state.file = None;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| PdfSplitError::LedgerUnavailable {
                    path: self.path.clone(),
                    source,
                })?;
        }
        File::create(&self.path)
            .await
            .map_err(|source| PdfSplitError::LedgerUnavailable {
                path: self.path.clone(),
                source,
            })?;
        let cleared = state.done.len();
        state.done.clear();
        info!("Ledger reset: {} records cleared", cleared);
        Ok(())
    }
}
