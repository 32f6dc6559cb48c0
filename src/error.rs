//! Error kinds surfaced by the relay core.
//!
//! None of these cross the session boundary as faults: the session converts
//! each into an acknowledgment with [`RelayError::client_message`] and keeps
//! the connection open.

use std::time::Duration;

use thiserror::Error;

use crate::payload::PayloadError;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed registration or message.
    #[error("validation failed: {0}")]
    Validation(PayloadError),

    /// Sender is blocked for this event type.
    #[error("rate limit exceeded for '{event}', retry after {retry_after:?}")]
    RateLimited { event: String, retry_after: Duration },

    /// A resource was held by someone else at the time of the attempt.
    #[error("resource '{resource}' is busy")]
    LockContention { resource: String },

    /// Serialized payload exceeds the configured ceiling.
    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Anything unexpected while processing an event.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Text placed in the acknowledgment sent back to the client.
    ///
    /// Internal details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            RelayError::Validation(e) => format!("Invalid data: {}", e),
            RelayError::RateLimited { .. } => {
                "Too many requests. Try again later.".to_string()
            }
            RelayError::LockContention { .. } => {
                "Resource temporarily unavailable. Try again.".to_string()
            }
            RelayError::PayloadTooLarge { limit, .. } => {
                format!("Message too large (limit {} bytes)", limit)
            }
            RelayError::Internal(_) => "Internal error while processing request".to_string(),
        }
    }
}

impl From<PayloadError> for RelayError {
    fn from(err: PayloadError) -> Self {
        match err {
            PayloadError::TooLarge { size, limit } => RelayError::PayloadTooLarge { size, limit },
            other => RelayError::Validation(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_payload_maps_to_its_own_kind() {
        let err: RelayError = PayloadError::TooLarge { size: 10, limit: 5 }.into();
        assert!(matches!(err, RelayError::PayloadTooLarge { size: 10, limit: 5 }));
    }

    #[test]
    fn internal_details_do_not_leak() {
        let err = RelayError::Internal("poisoned mutex in directory".to_string());
        assert!(!err.client_message().contains("mutex"));
    }
}
