//! File identities: a stable fingerprint of "this file in this state".
//!
//! An [`Identity`] is a SHA-256 digest over the file's path and either its
//! metadata (size + modification time) or its full contents, depending on
//! [`IdentityMode`]. Equal identities mean the same logical file state; any
//! change to the content shifts size/mtime (or the hash) and therefore yields
//! a new identity, which is what lets an edited file be processed again while
//! an untouched one is skipped.
//!
//! Identities are hex strings so they can be written one per line to the
//! ledger without escaping, whatever characters the source path contains.

use crate::config::IdentityMode;
use crate::error::JobError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Deterministic fingerprint of a file state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Wrap an already-computed identity string (e.g. one read from the ledger).
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, enough to tell jobs apart in log lines.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        self.0.get(..end).unwrap_or(&self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes [`Identity`] values for paths under the watch root.
#[derive(Debug, Clone, Copy)]
pub struct IdentityResolver {
    mode: IdentityMode,
}

impl IdentityResolver {
    pub fn new(mode: IdentityMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> IdentityMode {
        self.mode
    }

    /// Resolve the identity of `path` off the async executor.
    ///
    /// Content mode reads the whole file, so this always hops onto the
    /// blocking pool.
    pub async fn resolve(&self, path: &Path) -> Result<Identity, JobError> {
        let resolver = *self;
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || resolver.fingerprint(&owned))
            .await
            .map_err(|e| JobError::Internal(format!("Identity task panicked: {e}")))?
    }

    /// Blocking implementation of [`IdentityResolver::resolve`].
    pub fn fingerprint(&self, path: &Path) -> Result<Identity, JobError> {
        let meta = std::fs::metadata(path).map_err(|e| JobError::from_source_io(path, &e))?;
        if !meta.is_file() {
            return Err(JobError::SourceMissing {
                path: path.to_path_buf(),
            });
        }

        let mut hasher = Sha256::new();
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update([0u8]);

        match self.mode {
            IdentityMode::Metadata => {
                // Pre-epoch or unsupported mtimes collapse to 0; size still separates them.
                let mtime_nanos = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_nanos())
                    .unwrap_or(0);
                hasher.update(b"meta");
                hasher.update(meta.len().to_le_bytes());
                hasher.update(mtime_nanos.to_le_bytes());
            }
            IdentityMode::Content => {
                hasher.update(b"content");
                let mut file = File::open(path).map_err(|e| JobError::from_source_io(path, &e))?;
                let mut buf = [0u8; 64 * 1024];
                loop {
                    let n = file
                        .read(&mut buf)
                        .map_err(|e| JobError::from_source_io(path, &e))?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
            }
        }

        Ok(Identity(hex::encode(hasher.finalize())))
    }
}

/// Whether `path` looks like a PDF by extension (case-insensitive).
pub fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"))
}

/// Path of `path` relative to `root`, or the file name alone if it lies outside.
pub fn relative_to(root: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix(root) {
        Ok(rel) => rel.to_path_buf(),
        Err(_) => path.file_name().map(PathBuf::from).unwrap_or_default(),
    }
}
