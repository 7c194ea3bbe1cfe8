//! Shared outcome classification consumed by [`crate::auto_rpm::AutoRpmController`]
//! and [`crate::adaptive_controller::AdaptiveController`].
//!
//! Per spec.md S9 open question: classification of network errors stays
//! broad (any network error counts as pressure) rather than distinguishing
//! DNS from TLS from reset.

use std::time::Duration;

/// The classification of a single provider-call completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureClass {
    RateLimited,
    Timeout,
    ConnectionReset,
    ServerError,
    OtherError,
    Success,
}

impl PressureClass {
    /// Rate-limit, timeout, and connection-reset are "pressure": signals
    /// that the engine is pushing the provider or the network harder than
    /// it can sustain.
    pub fn is_pressure(self) -> bool {
        matches!(
            self,
            PressureClass::RateLimited | PressureClass::Timeout | PressureClass::ConnectionReset
        )
    }

    pub fn is_error(self) -> bool {
        !matches!(self, PressureClass::Success)
    }
}

/// One (timestamp, class) sample in a controller's sliding window.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub at: std::time::Instant,
    pub class: PressureClass,
    pub latency: Duration,
}

impl Observation {
    pub fn now(class: PressureClass, latency: Duration) -> Self {
        Self {
            at: std::time::Instant::now(),
            class,
            latency,
        }
    }
}

/// Summary of a controller's sliding window at one evaluation tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowSummary {
    pub pressure_rate: f64,
    pub error_rate: f64,
    pub samples: usize,
}

/// Compute a [`WindowSummary`] from a slice of observations newer than
/// `horizon`. Shared by both controllers so their evaluation ticks agree
/// on what "pressure" and "error" mean.
pub fn summarize(window: &[Observation]) -> WindowSummary {
    let n = window.len();
    if n == 0 {
        return WindowSummary::default();
    }
    let pressure = window.iter().filter(|o| o.class.is_pressure()).count();
    let errors = window.iter().filter(|o| o.class.is_error()).count();
    WindowSummary {
        pressure_rate: pressure as f64 / n as f64,
        error_rate: errors as f64 / n as f64,
        samples: n,
    }
}
