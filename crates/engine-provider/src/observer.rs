//! Narrow observation interfaces (spec.md S9: "Callback-based outcome
//! observation -> a narrow interface"), so [`crate::http::HttpProviderClient`]
//! can be unit-tested against fakes without depending on the concrete
//! controller types.

use engine_core::{AdaptiveController, AutoRpmController, PressureClass};
use std::time::Duration;

pub trait RateObserver: Send + Sync {
    fn observe(&self, class: PressureClass, latency: Duration);
}

pub trait InflightObserver: Send + Sync {
    fn observe(&self, latency: Duration, class: PressureClass);
}

impl RateObserver for AutoRpmController {
    fn observe(&self, class: PressureClass, latency: Duration) {
        AutoRpmController::observe(self, class, latency)
    }
}

impl InflightObserver for AdaptiveController {
    fn observe(&self, latency: Duration, class: PressureClass) {
        AdaptiveController::observe(self, latency, class)
    }
}
