use engine_core::{Categorizable, ErrorClass, PressureClass};
use thiserror::Error;

/// Errors surfaced by a [`crate::client::ProviderClient`] call, after the
/// retry policy has given up (spec.md S7's provider error taxonomy).
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider rate limited (429)")]
    RateLimited,
    #[error("provider server error ({status})")]
    ServerError { status: u16 },
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("cancelled before completion")]
    Cancelled,
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl Categorizable for ProviderError {
    fn class(&self) -> ErrorClass {
        match self {
            ProviderError::RateLimited
            | ProviderError::ServerError { .. }
            | ProviderError::Network(_)
            | ProviderError::Timeout
            | ProviderError::Cancelled => ErrorClass::Transient,
            ProviderError::UnexpectedResponse(_) => ErrorClass::Permanent,
        }
    }
}

impl ProviderError {
    /// Whether the retry loop should attempt again (given attempts
    /// remain). Matches spec.md S4.7 step 3: "{429, 5xx, network}".
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited
                | ProviderError::ServerError { .. }
                | ProviderError::Network(_)
                | ProviderError::Timeout
        )
    }

    /// The pressure signal one completed attempt feeds to both
    /// controllers. `None` for cancellation: it is not a provider signal
    /// (spec.md S7: "Cancellation: not an error").
    pub fn pressure_class(&self) -> Option<PressureClass> {
        match self {
            ProviderError::RateLimited => Some(PressureClass::RateLimited),
            ProviderError::Timeout => Some(PressureClass::Timeout),
            ProviderError::Network(_) => Some(PressureClass::ConnectionReset),
            ProviderError::ServerError { .. } => Some(PressureClass::ServerError),
            ProviderError::UnexpectedResponse(_) => Some(PressureClass::OtherError),
            ProviderError::Cancelled => None,
        }
    }

    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        match status {
            429 => ProviderError::RateLimited,
            500..=599 => ProviderError::ServerError { status },
            _ => ProviderError::UnexpectedResponse(format!("status {status}: {}", body.into())),
        }
    }
}
