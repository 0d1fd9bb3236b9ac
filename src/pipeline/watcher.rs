//! Watch root observation: filesystem notifications plus an initial scan.
//!
//! Both sources feed the same channel of [`RawEvent`]s. The notification
//! backend is registered *before* the scan starts, so a file that lands while
//! the scan is running is reported at least once; duplicates are harmless
//! because the debouncer and the queue collapse them.
//!
//! Only `.pdf` paths are reported. Anything under the output root is ignored
//! so that a nested output folder never feeds its own pages back in.

use crate::error::PdfSplitError;
use crate::identity::is_pdf;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How a path came to our attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    /// Found by the startup scan.
    Discovered,
    Created,
    Modified,
}

/// A PDF path that may have appeared or changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub path: PathBuf,
    pub kind: RawEventKind,
}

/// Keeps the notification backend alive; dropping it stops the watch.
pub struct DirectoryWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
    scan: Option<JoinHandle<usize>>,
}

impl std::fmt::Debug for DirectoryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryWatcher")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl DirectoryWatcher {
    /// Start watching `root` recursively and kick off the startup scan.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        root: &Path,
        ignore: Option<&Path>,
        tx: mpsc::Sender<RawEvent>,
    ) -> Result<Self, PdfSplitError> {
        if !root.is_dir() {
            return Err(PdfSplitError::WatchRootMissing {
                path: root.to_path_buf(),
            });
        }
        let ignore = ignore.map(Path::to_path_buf);

        let tx_event = tx.clone();
        let ignore_event = ignore.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let Some(kind) = classify(&event.kind) else {
                        return;
                    };
                    for path in event.paths {
                        if !wanted(&path, ignore_event.as_deref()) {
                            continue;
                        }
                        if tx_event.blocking_send(RawEvent { path, kind }).is_err() {
                            // Receiver gone: the service is shutting down.
                            return;
                        }
                    }
                }
                Err(err) => error!("Watch error: {}", err),
            },
            NotifyConfig::default(),
        )
        .map_err(|e| PdfSplitError::WatcherFailed {
            path: root.to_path_buf(),
            detail: e.to_string(),
        })?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| PdfSplitError::WatcherFailed {
                path: root.to_path_buf(),
                detail: e.to_string(),
            })?;
        info!("Watching {}", root.display());

        let scan_root = root.to_path_buf();
        let scan = tokio::task::spawn_blocking(move || {
            let found = scan_tree(&scan_root, ignore.as_deref(), &tx);
            info!("Startup scan found {} PDF(s) in {}", found, scan_root.display());
            found
        });

        Ok(Self {
            root: root.to_path_buf(),
            _watcher: watcher,
            scan: Some(scan),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Wait for the startup scan to finish; returns how many PDFs it reported.
    ///
    /// Returns 0 on any call after the first.
    pub async fn scan_finished(&mut self) -> usize {
        let Some(scan) = self.scan.take() else {
            return 0;
        };
        scan.await.unwrap_or_else(|e| {
            error!("Startup scan panicked: {}", e);
            0
        })
    }
}

fn classify(kind: &EventKind) -> Option<RawEventKind> {
    match kind {
        EventKind::Create(_) => Some(RawEventKind::Created),
        EventKind::Modify(_) => Some(RawEventKind::Modified),
        _ => None,
    }
}

fn wanted(path: &Path, ignore: Option<&Path>) -> bool {
    if ignore.is_some_and(|dir| path.starts_with(dir)) {
        return false;
    }
    is_pdf(path)
}

/// Walk `root` depth-first, sending a `Discovered` event for every PDF.
fn scan_tree(root: &Path, ignore: Option<&Path>, tx: &mpsc::Sender<RawEvent>) -> usize {
    let mut found = 0;
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        if ignore.is_some_and(|i| dir.starts_with(i)) {
            continue;
        }
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Skipping unreadable directory {}: {}", dir.display(), e);
                continue;
            }
        };
        let mut files = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => stack.push(path),
                Ok(ft) if ft.is_file() => files.push(path),
                _ => {}
            }
        }
        files.sort();
        for path in files {
            if !wanted(&path, ignore) {
                continue;
            }
            debug!("Discovered {}", path.display());
            if tx
                .blocking_send(RawEvent {
                    path,
                    kind: RawEventKind::Discovered,
                })
                .is_err()
            {
                return found;
            }
            found += 1;
        }
    }

    found
}
