//! Watches handler completions and re-tunes the in-flight concurrency cap
//! (spec.md S4.4). Shares the pressure classification of
//! [`crate::auto_rpm::AutoRpmController`] (timeouts, resets, 429s) but
//! reacts on a different axis: a weak uplink can cascade connection
//! resets with zero 429s, which RPM pacing alone would never see.

use crate::adaptive_semaphore::AdaptiveSemaphore;
use crate::cancellation::Cancellation;
use crate::pressure::{summarize, Observation, PressureClass};
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct AdaptiveControllerConfig {
    pub initial_cap: usize,
    pub min_cap: usize,
    /// Upper bound, per spec.md S4.4: "bounded above by the initial
    /// worker count".
    pub max_cap: usize,
    pub window_horizon: Duration,
    pub evaluate_interval: Duration,
    pub min_samples: usize,
    pub pressure_high: f64,
    pub pressure_low: f64,
    pub error_low: f64,
    pub decrease_factor: f64,
    pub increase_step: usize,
}

impl AdaptiveControllerConfig {
    pub fn for_worker_count(worker_count: usize) -> Self {
        Self {
            initial_cap: worker_count,
            min_cap: 1,
            max_cap: worker_count,
            window_horizon: Duration::from_secs(10),
            evaluate_interval: Duration::from_secs(2),
            min_samples: 5,
            pressure_high: 0.2,
            pressure_low: 0.02,
            error_low: 0.05,
            decrease_factor: 0.7,
            increase_step: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InflightSnapshot {
    pub cap: usize,
    pub min_cap: usize,
    pub max_cap: usize,
    pub inflight: usize,
    pub pressure_rate: f64,
    pub error_rate: f64,
    pub samples: usize,
}

struct Inner {
    cap: usize,
    window: Vec<Observation>,
    last_summary: crate::pressure::WindowSummary,
}

/// Background loop pairing one [`AdaptiveSemaphore`] with the outcome
/// stream of the handlers contending for it.
pub struct AdaptiveController {
    config: AdaptiveControllerConfig,
    semaphore: AdaptiveSemaphore,
    inner: Mutex<Inner>,
}

impl AdaptiveController {
    pub fn new(config: AdaptiveControllerConfig, semaphore: AdaptiveSemaphore) -> Self {
        semaphore.set_cap(config.initial_cap);
        Self {
            inner: Mutex::new(Inner {
                cap: config.initial_cap,
                window: Vec::new(),
                last_summary: Default::default(),
            }),
            config,
            semaphore,
        }
    }

    /// Classify and record one handler completion's (latency, error)
    /// pair. `err` is `None` on success.
    pub fn observe(&self, latency: Duration, class: PressureClass) {
        let mut inner = self.inner.lock().unwrap();
        inner.window.push(Observation::now(class, latency));
    }

    pub fn current_cap(&self) -> usize {
        self.inner.lock().unwrap().cap
    }

    pub fn snapshot(&self) -> InflightSnapshot {
        let inner = self.inner.lock().unwrap();
        InflightSnapshot {
            cap: inner.cap,
            min_cap: self.config.min_cap,
            max_cap: self.config.max_cap,
            inflight: self.config.initial_cap.saturating_sub(self.semaphore.available_permits()),
            pressure_rate: inner.last_summary.pressure_rate,
            error_rate: inner.last_summary.error_rate,
            samples: inner.last_summary.samples,
        }
    }

    pub async fn start(&self, cancellation: Cancellation) {
        let mut ticker = tokio::time::interval(self.config.evaluate_interval);
        loop {
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    debug!("adaptive_controller evaluator cancelled");
                    return;
                }
                _ = ticker.tick() => {
                    self.evaluate_tick();
                }
            }
        }
    }

    fn evaluate_tick(&self) {
        let horizon = self.config.window_horizon;
        let mut inner = self.inner.lock().unwrap();
        let now = std::time::Instant::now();
        inner.window.retain(|o| now.duration_since(o.at) <= horizon);

        let summary = summarize(&inner.window);
        inner.last_summary = summary;
        if summary.samples < self.config.min_samples {
            return;
        }

        if summary.pressure_rate > self.config.pressure_high {
            let next = ((inner.cap as f64) * self.config.decrease_factor).floor() as usize;
            inner.cap = next.max(self.config.min_cap);
            info!(cap = inner.cap, pressure = summary.pressure_rate, "adaptive_controller: shrinking cap");
            self.semaphore.set_cap(inner.cap);
        } else if summary.pressure_rate < self.config.pressure_low
            && summary.error_rate < self.config.error_low
        {
            let next = inner.cap + self.config.increase_step;
            inner.cap = next.min(self.config.max_cap);
            debug!(cap = inner.cap, "adaptive_controller: growing cap");
            self.semaphore.set_cap(inner.cap);
        }

        inner.window.clear();
    }
}
