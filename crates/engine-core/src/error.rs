use thiserror::Error;

/// Errors surfaced by the queue store itself (not application-level job
/// failures, which are reported through [`crate::model::Outcome`]).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// The class an error belongs to for the purposes of outcome mapping and
/// pressure classification. Shared by provider clients and job handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Should be retried: network errors, timeouts, connection resets,
    /// rate limiting (429), and 5xx server errors.
    Transient,
    /// Should not be retried: malformed payloads, schema violations,
    /// missing foreign data.
    Permanent,
}

/// A trait for errors that know which bucket they belong in. Handlers and
/// provider clients implement this so the engine can map failures to a
/// queue [`crate::model::Outcome`] without matching on error variants by
/// hand at every call site.
pub trait Categorizable {
    fn class(&self) -> ErrorClass;
}

/// A generic handler error carrying its class and an optional message,
/// used by [`crate::engine::Handler`] implementations.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub class: ErrorClass,
    pub message: String,
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }
}

impl Categorizable for HandlerError {
    fn class(&self) -> ErrorClass {
        self.class
    }
}
