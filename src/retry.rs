//! Retry policy: which failures are worth another attempt, and when.
//!
//! The policy is a pure value so the worker's control flow stays a single
//! `match` on [`RetryPolicy::decide`]. Attempt counts are the number of
//! attempts that have already failed, so with `max_attempts = 5` a job that
//! keeps failing runs exactly five times before it is dead-lettered.

use crate::config::{Backoff, WatchConfig};
use crate::error::JobError;
use std::time::Duration;

/// Upper bound on a single exponential-backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Whether an error can clear up by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Terminal,
}

/// What to do with a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue after this delay.
    Retry(Duration),
    /// Give up and send the job to the error sink.
    DeadLetter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff,
        }
    }

    pub fn from_config(config: &WatchConfig) -> Self {
        Self::new(
            config.retries,
            Duration::from_millis(config.retry_delay_ms),
            config.retry_backoff,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Classify a job failure.
    ///
    /// Corrupt or vanished input will fail the same way every time; I/O
    /// contention, engine outages and write failures may not.
    pub fn classify(&self, err: &JobError) -> ErrorClass {
        match err {
            JobError::TransientIo { .. }
            | JobError::EngineUnavailable { .. }
            | JobError::OutputWrite { .. }
            | JobError::LedgerWrite { .. } => ErrorClass::Retryable,
            JobError::SourceMissing { .. }
            | JobError::CorruptInput { .. }
            | JobError::Cancelled
            | JobError::Internal(_) => ErrorClass::Terminal,
        }
    }

    /// True while fewer than `max_attempts` attempts have failed.
    pub fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }

    /// Delay before the attempt following failure number `attempt_count` (1-based).
    pub fn next_delay(&self, attempt_count: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => {
                let exp = attempt_count.saturating_sub(1).min(16);
                self.delay.saturating_mul(1u32 << exp).min(MAX_BACKOFF)
            }
        }
    }

    /// Decide the fate of a job whose `attempt_count`-th attempt failed with `err`.
    pub fn decide(&self, err: &JobError, attempt_count: u32) -> RetryDecision {
        match self.classify(err) {
            ErrorClass::Retryable if self.should_retry(attempt_count) => {
                RetryDecision::Retry(self.next_delay(attempt_count))
            }
            _ => RetryDecision::DeadLetter,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&WatchConfig::default())
    }
}
