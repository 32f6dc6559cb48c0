//! Inbound payload handling.
//!
//! # Data Flow
//! ```text
//! raw JSON from a session
//!     → sanitize.rs (trim, escape, clamp; recursive)
//!     → schema.rs (registration / message shape checks → typed values)
//!     → integrity.rs (cross-field consistency of the typed message)
//!     → handed to the directory or the router
//! ```
//!
//! # Design Decisions
//! - Message payloads are a closed union (`TypedPayload`); every kind is
//!   matched exhaustively, so a new kind does not compile until handled
//! - The sanitized JSON is what gets forwarded; typed values only drive checks
//! - One size ceiling, passed in by the caller

pub mod integrity;
pub mod sanitize;
pub mod schema;

use thiserror::Error;

pub use integrity::check_integrity;
pub use sanitize::sanitize;
pub use schema::{
    validate_message, validate_registration, AlertLevel, ClientKind, CommandAction,
    OutboundMessage, PayloadKind, Registration, TypedPayload,
};

/// Why an inbound payload was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PayloadError {
    #[error("{0} must be an object")]
    NotAnObject(&'static str),

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("field '{field}' exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },

    #[error("field '{field}' has unsupported value '{value}'")]
    NotAllowed { field: &'static str, value: String },

    #[error("target list must hold 1 to {max} entries, got {count}")]
    TargetCount { count: usize, max: usize },

    #[error("setting '{field}' must be between {min} and {max}")]
    OutOfRange {
        field: String,
        min: f64,
        max: f64,
    },

    #[error("unknown setting '{0}'")]
    UnknownSetting(String),

    #[error("field '{0}' is not a valid timestamp")]
    BadTimestamp(&'static str),

    #[error("message already expired")]
    Expired,

    #[error("critical alerts require an action")]
    MissingAction,

    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },
}
