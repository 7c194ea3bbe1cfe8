//! A smoothing rate limiter (spec.md S4.2).
//!
//! Unlike a per-minute counter, which grants a full minute's budget at
//! once and then blocks until the next window, this bucket emits tokens
//! at an even cadence (`rpm / 60` tokens/s) with burst capacity of
//! exactly one. `Wait` reserves the next emit slot under a lock and then
//! sleeps outside it, so concurrent callers queue FIFO without missing or
//! duplicating a slot.

use crate::cancellation::Cancellation;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ok,
    Cancelled,
}

struct State {
    interval: Option<Duration>,
    next_slot: Instant,
    closed: bool,
}

/// Smooth per-endpoint request pacer. Cloneable; clones share the same
/// underlying schedule.
#[derive(Clone)]
pub struct LeakyBucket {
    state: std::sync::Arc<Mutex<State>>,
}

impl LeakyBucket {
    /// Construct with an initial requests-per-minute setpoint. `rpm <= 0`
    /// starts the bucket disabled.
    pub fn new(rpm: f64) -> Self {
        let bucket = Self {
            state: std::sync::Arc::new(Mutex::new(State {
                interval: None,
                next_slot: Instant::now(),
                closed: false,
            })),
        };
        bucket.set_rpm(rpm);
        bucket
    }

    /// Live setpoint update. `rpm <= 0` disables the bucket (`Wait`
    /// returns immediately). Takes effect at the next emit boundary; no
    /// tokens are lost or duplicated.
    pub fn set_rpm(&self, rpm: f64) {
        let mut state = self.state.lock().unwrap();
        state.interval = if rpm > 0.0 {
            Some(Duration::from_secs_f64(60.0 / rpm))
        } else {
            None
        };
    }

    /// Idempotent; future `Wait` calls return immediately.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }

    /// Block until one token is available or `cancellation` fires.
    /// Always returns in bounded time when the setpoint is positive.
    pub async fn wait(&self, cancellation: &Cancellation) -> WaitOutcome {
        let sleep_for = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return WaitOutcome::Ok;
            }
            let Some(interval) = state.interval else {
                return WaitOutcome::Ok;
            };
            let now = Instant::now();
            let slot = state.next_slot.max(now);
            state.next_slot = slot + interval;
            slot.saturating_duration_since(now)
        };
        if sleep_for.is_zero() {
            return WaitOutcome::Ok;
        }
        match cancellation.race(tokio::time::sleep(sleep_for)).await {
            Some(()) => WaitOutcome::Ok,
            None => WaitOutcome::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn disabled_bucket_never_blocks() {
        let bucket = LeakyBucket::new(0.0);
        let cancel = Cancellation::new();
        let start = Instant::now();
        for _ in 0..100 {
            assert_eq!(bucket.wait(&cancel).await, WaitOutcome::Ok);
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn paced_bucket_spaces_out_tokens() {
        let bucket = LeakyBucket::new(600.0); // 10/s -> 100ms apart
        let cancel = Cancellation::new();
        let start = Instant::now();
        for _ in 0..5 {
            bucket.wait(&cancel).await;
        }
        // 5 tokens at 100ms apart: first is immediate, remaining 4 cost 400ms.
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_bucket_returns_immediately() {
        let bucket = LeakyBucket::new(60.0);
        bucket.close();
        let cancel = Cancellation::new();
        let start = Instant::now();
        bucket.wait(&cancel).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_short_circuits_wait() {
        let bucket = LeakyBucket::new(6.0); // one token every 10s
        let cancel = Cancellation::new();
        bucket.wait(&cancel).await; // consume the immediate slot
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel_clone.cancel();
        });
        let outcome = bucket.wait(&cancel).await;
        assert_eq!(outcome, WaitOutcome::Cancelled);
    }
}
