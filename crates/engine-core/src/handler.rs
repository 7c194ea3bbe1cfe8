//! The pluggable job-handler interface (spec.md S4.6/S4.7).
//!
//! A handler is business logic the engine knows nothing about: it
//! compiles input, makes zero or more provider calls, parses responses,
//! and submits writes. The engine only needs to dispatch a job's payload
//! to the handler registered for its `job_type` and map the resulting
//! [`crate::error::ErrorClass`] to a queue [`crate::model::Outcome`].

use crate::cancellation::Cancellation;
use crate::error::HandlerError;
use crate::model::Job;
use async_trait::async_trait;

/// One job type's business logic. Implementations must be idempotent:
/// spec.md S8 requires that a job re-run after a simulated crash between
/// handler success and release produces the same final warehouse state.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, cancellation: Cancellation, job: &Job) -> Result<(), HandlerError>;
}

/// A handler for the `fake` job type (spec.md S9 open question):
/// a trivial sleep-then-succeed stub, registered so the engine's wiring
/// can be exercised without a real provider or warehouse.
pub struct FakeHandler {
    pub sleep: std::time::Duration,
}

impl Default for FakeHandler {
    fn default() -> Self {
        Self {
            sleep: std::time::Duration::from_millis(50),
        }
    }
}

#[async_trait]
impl Handler for FakeHandler {
    async fn handle(&self, cancellation: Cancellation, _job: &Job) -> Result<(), HandlerError> {
        match cancellation.race(tokio::time::sleep(self.sleep)).await {
            Some(()) => Ok(()),
            None => Err(HandlerError::transient("cancelled during fake sleep")),
        }
    }
}
