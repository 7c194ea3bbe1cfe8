//! Data model shared by the queue trait, the engine, and job handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of a job. See spec.md S3 for the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Leased,
    Done,
    Dead,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Dead)
    }
}

/// A durable unit of work drained from the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub job_type: String,
    pub key: String,
    pub priority: i32,
    pub payload: Vec<u8>,
    pub state: JobState,
    pub attempts: i32,
    pub max_attempts: i32,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Options for [`crate::queue::JobStore::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueOpts {
    pub job_type: String,
    pub key: String,
    pub priority: i32,
    pub payload: Vec<u8>,
    pub max_attempts: i32,
}

impl EnqueueOpts {
    pub fn new(job_type: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            job_type: job_type.into(),
            key: key.into(),
            priority: 0,
            payload,
            max_attempts: 5,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Result of a call to [`crate::queue::JobStore::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Ok,
    Deduped,
}

/// Class of an `Release`/handler outcome, see spec.md S3 "Outcome".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeClass {
    Ok,
    Transient,
    Permanent,
}

/// A handler's report on a single dispatch, fed to `JobStore::release`
/// and to both adaptive controllers via [`crate::pressure::Observation`].
#[derive(Debug, Clone)]
pub struct Outcome {
    pub class: OutcomeClass,
    pub error: Option<String>,
    pub latency: Duration,
}

impl Outcome {
    pub fn ok(latency: Duration) -> Self {
        Self {
            class: OutcomeClass::Ok,
            error: None,
            latency,
        }
    }

    pub fn transient(error: impl Into<String>, latency: Duration) -> Self {
        Self {
            class: OutcomeClass::Transient,
            error: Some(error.into()),
            latency,
        }
    }

    pub fn permanent(error: impl Into<String>, latency: Duration) -> Self {
        Self {
            class: OutcomeClass::Permanent,
            error: Some(error.into()),
            latency,
        }
    }
}

/// Snapshot returned by [`crate::queue::JobStore::stats`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub leased: i64,
    pub dead: i64,
    pub done: i64,
}

/// Exponential backoff with a cap and bounded jitter, shared by every
/// `JobStore` implementation. `min(cap, base * 2^attempts)`, plus up to
/// 20% positive jitter so retrying workers don't thunder-herd.
pub fn backoff(attempts: i32, base: Duration, cap: Duration) -> Duration {
    let exp = 2u64.saturating_pow(attempts.max(0) as u32);
    let scaled = base.saturating_mul(exp as u32);
    let capped = scaled.min(cap);
    let jitter_frac = fastrand::f64() * 0.2;
    capped.mul_f64(1.0 + jitter_frac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_bounded_by_cap() {
        let cap = Duration::from_secs(30);
        for attempts in 0..20 {
            let d = backoff(attempts, Duration::from_secs(1), cap);
            assert!(d <= cap.mul_f64(1.2));
        }
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(30);
        let first = backoff(0, base, cap);
        let second = backoff(3, base, cap);
        assert!(second > first);
    }
}
