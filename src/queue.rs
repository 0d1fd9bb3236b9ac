//! Job queue with per-identity in-flight deduplication.
//!
//! The queue tracks every identity that is either waiting to be claimed,
//! being processed, or sleeping before a retry. An [`enqueue`] for any of
//! those identities is dropped, so no two workers ever hold the same file
//! state and a burst of duplicate events collapses into one job.
//!
//! The check-and-insert happens under a single mutex; the lock is never held
//! across an `.await`.
//!
//! [`enqueue`]: JobQueue::enqueue

use crate::identity::Identity;
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

/// One unit of work: split a single source PDF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdfJob {
    pub identity: Identity,
    pub source_path: PathBuf,
    pub discovered_at: DateTime<Utc>,
    /// Number of attempts that have already failed.
    pub attempt_count: u32,
}

impl PdfJob {
    pub fn new(identity: Identity, source_path: impl Into<PathBuf>) -> Self {
        Self {
            identity,
            source_path: source_path.into(),
            discovered_at: Utc::now(),
            attempt_count: 0,
        }
    }
}

/// Result of [`JobQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The job was accepted.
    Queued,
    /// A job with the same identity is already queued or in flight.
    Duplicate,
    /// The queue is shutting down.
    Closed,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PdfJob>,
    in_flight: HashSet<Identity>,
    closed: bool,
}

/// FIFO of pending jobs plus the set of identities currently owned by the pipeline.
#[derive(Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    available: Notify,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.lock();
        f.debug_struct("JobQueue")
            .field("pending", &s.pending.len())
            .field("in_flight", &s.in_flight.len())
            .field("closed", &s.closed)
            .finish()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic while holding this lock cannot leave the state half-updated:
        // every critical section is a single push/pop/insert/remove.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Accept `job` unless its identity is already owned by the pipeline.
    pub fn enqueue(&self, job: PdfJob) -> EnqueueOutcome {
        {
            let mut s = self.lock();
            if s.closed {
                return EnqueueOutcome::Closed;
            }
            if !s.in_flight.insert(job.identity.clone()) {
                return EnqueueOutcome::Duplicate;
            }
            s.pending.push_back(job);
        }
        self.available.notify_one();
        EnqueueOutcome::Queued
    }

    /// Put a job that is already in flight back at the end of the queue.
    ///
    /// Used after a retry delay: the identity never left the in-flight set,
    /// so the dedup check is skipped. If the queue closed meanwhile the job
    /// is dropped and its identity released.
    pub fn requeue(&self, job: PdfJob) -> EnqueueOutcome {
        {
            let mut s = self.lock();
            if s.closed {
                s.in_flight.remove(&job.identity);
                return EnqueueOutcome::Closed;
            }
            s.in_flight.insert(job.identity.clone());
            s.pending.push_back(job);
        }
        self.available.notify_one();
        EnqueueOutcome::Queued
    }

    /// Wait for the next job. Returns `None` once the queue is closed.
    ///
    /// Jobs still pending at close are not handed out; their identities stay
    /// unrecorded in the ledger, so they are picked up again after a restart.
    pub async fn claim(&self) -> Option<PdfJob> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so a close/enqueue between the check and
            // the await still wakes us.
            notified.as_mut().enable();

            {
                let mut s = self.lock();
                if s.closed {
                    return None;
                }
                if let Some(job) = s.pending.pop_front() {
                    return Some(job);
                }
            }

            notified.await;
        }
    }

    /// Forget `identity`: it is no longer queued or in flight.
    pub fn release(&self, identity: &Identity) {
        self.lock().in_flight.remove(identity);
    }

    /// Whether `identity` is queued, running, or waiting for a retry.
    pub fn is_in_flight(&self, identity: &Identity) -> bool {
        self.lock().in_flight.contains(identity)
    }

    /// Number of jobs waiting to be claimed.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Number of identities owned by the pipeline (pending + running + retrying).
    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Stop accepting work and wake every waiting worker.
    ///
    /// Pending jobs are discarded and their identities released.
    pub fn close(&self) {
        {
            let mut s = self.lock();
            s.closed = true;
            let dropped: Vec<PdfJob> = s.pending.drain(..).collect();
            for job in dropped {
                s.in_flight.remove(&job.identity);
            }
        }
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
