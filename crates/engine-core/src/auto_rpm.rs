//! Discovers and tracks the sustainable request rate per endpoint family
//! (spec.md S4.3).

use crate::cancellation::Cancellation;
use crate::leaky_bucket::LeakyBucket;
use crate::pressure::{summarize, Observation, PressureClass};
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct AutoRpmConfig {
    pub initial_rpm: f64,
    pub min_rpm: f64,
    pub max_rpm: f64,
    /// How far back the sliding window looks.
    pub window_horizon: Duration,
    /// How often the evaluator ticks.
    pub evaluate_interval: Duration,
    /// Minimum samples in a window before the evaluator acts.
    pub min_samples: usize,
    /// Pressure rate above which the setpoint is cut.
    pub pressure_high: f64,
    /// Pressure rate below which (with low error rate) the setpoint grows.
    pub pressure_low: f64,
    /// Error rate ceiling for the setpoint to be allowed to grow.
    pub error_low: f64,
    /// Multiplicative decrease factor applied on elevated pressure.
    pub decrease_factor: f64,
    /// Additive increase applied on sustained low pressure.
    pub increase_step: f64,
}

impl Default for AutoRpmConfig {
    fn default() -> Self {
        Self {
            initial_rpm: 600.0,
            min_rpm: 30.0,
            max_rpm: 3000.0,
            window_horizon: Duration::from_secs(10),
            evaluate_interval: Duration::from_secs(2),
            min_samples: 5,
            pressure_high: 0.2,
            pressure_low: 0.02,
            error_low: 0.05,
            decrease_factor: 0.7,
            increase_step: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RpmSnapshot {
    pub rpm: f64,
    pub min_rpm: f64,
    pub max_rpm: f64,
    pub pressure_rate: f64,
    pub error_rate: f64,
    pub samples: usize,
}

struct Inner {
    rpm: f64,
    window: Vec<Observation>,
    last_summary: crate::pressure::WindowSummary,
}

/// Probes sustainable request rate and feeds the live setpoint to a
/// [`LeakyBucket`]. See spec.md S4.3 for the evaluation-tick algorithm.
pub struct AutoRpmController {
    config: AutoRpmConfig,
    bucket: LeakyBucket,
    inner: Mutex<Inner>,
}

impl AutoRpmController {
    pub fn new(config: AutoRpmConfig, bucket: LeakyBucket) -> Self {
        bucket.set_rpm(config.initial_rpm);
        Self {
            inner: Mutex::new(Inner {
                rpm: config.initial_rpm,
                window: Vec::new(),
                last_summary: Default::default(),
            }),
            config,
            bucket,
        }
    }

    /// Classify and record one provider-call completion.
    pub fn observe(&self, class: PressureClass, latency: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.window.push(Observation::now(class, latency));
    }

    pub fn current_rpm(&self) -> f64 {
        self.inner.lock().unwrap().rpm
    }

    pub fn snapshot(&self) -> RpmSnapshot {
        let inner = self.inner.lock().unwrap();
        RpmSnapshot {
            rpm: inner.rpm,
            min_rpm: self.config.min_rpm,
            max_rpm: self.config.max_rpm,
            pressure_rate: inner.last_summary.pressure_rate,
            error_rate: inner.last_summary.error_rate,
            samples: inner.last_summary.samples,
        }
    }

    /// Run the background evaluator until `cancellation` fires. No
    /// outstanding setpoint emission survives cancellation: the loop
    /// checks the token before every tick and exits promptly.
    pub async fn start(&self, cancellation: Cancellation) {
        let mut ticker = tokio::time::interval(self.config.evaluate_interval);
        loop {
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    debug!("auto_rpm evaluator cancelled");
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
            inner.rpm = (inner.rpm * self.config.decrease_factor).max(self.config.min_rpm);
            info!(rpm = inner.rpm, pressure = summary.pressure_rate, "auto_rpm: decreasing setpoint");
            self.bucket.set_rpm(inner.rpm);
        } else if summary.pressure_rate < self.config.pressure_low
            && summary.error_rate < self.config.error_low
        {
            inner.rpm = (inner.rpm + self.config.increase_step).min(self.config.max_rpm);
            debug!(rpm = inner.rpm, "auto_rpm: increasing setpoint");
            self.bucket.set_rpm(inner.rpm);
        }

        inner.window.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sustained_pressure_decreases_setpoint() {
        let bucket = LeakyBucket::new(600.0);
        let config = AutoRpmConfig {
            min_samples: 3,
            ..Default::default()
        };
        let controller = AutoRpmController::new(config, bucket);
        for _ in 0..10 {
            controller.observe(PressureClass::RateLimited, Duration::from_millis(5));
        }
        controller.evaluate_tick();
        assert!(controller.current_rpm() < 600.0);
    }

    #[tokio::test]
    async fn sustained_success_increases_setpoint_up_to_cap() {
        let bucket = LeakyBucket::new(600.0);
        let config = AutoRpmConfig {
            min_samples: 3,
            max_rpm: 650.0,
            ..Default::default()
        };
        let controller = AutoRpmController::new(config, bucket);
        for _ in 0..10 {
            controller.observe(PressureClass::Success, Duration::from_millis(5));
        }
        controller.evaluate_tick();
        assert!(controller.current_rpm() > 600.0);
        assert!(controller.current_rpm() <= 650.0);
    }

    #[tokio::test]
    async fn below_min_samples_holds() {
        let bucket = LeakyBucket::new(600.0);
        let config = AutoRpmConfig {
            min_samples: 100,
            ..Default::default()
        };
        let controller = AutoRpmController::new(config, bucket);
        controller.observe(PressureClass::RateLimited, Duration::from_millis(5));
        controller.evaluate_tick();
        assert_eq!(controller.current_rpm(), 600.0);
    }
}
