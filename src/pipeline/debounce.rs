//! Debouncer: collapse bursts of events for one path into a single signal.
//!
//! Copy tools and scanner drivers write a PDF in several steps, each firing
//! its own create/modify notification. A path is only delivered once no
//! further event for it has arrived within the quiet window. Each path has
//! its own deadline, so a busy file never holds back a settled one.

use crate::pipeline::watcher::RawEvent;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, trace};

/// Paths waiting for their quiet window to elapse.
#[derive(Debug, Default)]
pub struct PendingPaths {
    deadlines: HashMap<PathBuf, Instant>,
}

impl PendingPaths {
    /// Record an event for `path`, pushing its deadline to `now + window`.
    pub fn touch(&mut self, path: PathBuf, now: Instant, window: Duration) {
        self.deadlines.insert(path, now + window);
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every path whose deadline has passed, oldest first.
    pub fn drain_due(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut due: Vec<(Instant, PathBuf)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(p, &at)| (at, p.clone()))
            .collect();
        due.sort();
        for (_, p) in &due {
            self.deadlines.remove(p);
        }
        due.into_iter().map(|(_, p)| p).collect()
    }

    /// Remove and return everything still pending.
    pub fn drain_all(&mut self) -> Vec<PathBuf> {
        let mut all: Vec<(Instant, PathBuf)> =
            self.deadlines.drain().map(|(p, at)| (at, p)).collect();
        all.sort();
        all.into_iter().map(|(_, p)| p).collect()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

/// Per-path quiet-window debouncer.
#[derive(Debug, Clone, Copy)]
pub struct Debouncer {
    window: Duration,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// Run the debounce loop until `events` closes.
    ///
    /// Settled paths are sent to `ready`. When the input side closes, paths
    /// still inside their window are flushed immediately; when the output
    /// side closes, the loop stops.
    pub fn spawn(
        self,
        mut events: mpsc::Receiver<RawEvent>,
        ready: mpsc::Sender<PathBuf>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut pending = PendingPaths::default();

            loop {
                // A disabled select branch still builds its future, so give it a far deadline.
                let wake = pending
                    .next_deadline()
                    .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

                tokio::select! {
                    msg = events.recv() => match msg {
                        Some(event) => {
                            trace!("Raw {:?} for {}", event.kind, event.path.display());
                            pending.touch(event.path, Instant::now(), self.window);
                        }
                        None => break,
                    },
                    _ = sleep_until(wake), if !pending.is_empty() => {
                        for path in pending.drain_due(Instant::now()) {
                            debug!("Settled: {}", path.display());
                            if ready.send(path).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }

            for path in pending.drain_all() {
                if ready.send(path).await.is_err() {
                    return;
                }
            }
        })
    }
}
