//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Any HTTP request:
//!     → http_limit.rs (per-address token bucket)
//!
//! Upgrade request:
//!     → admission.rs (blacklist, user agent, reconnect throttle, per-ip cap)
//!     → headers.rs (hardening headers on every response)
//!
//! Per event on an open session:
//!     → rate_limit.rs (per-connection, per-event windows)
//!
//! Bound connections:
//!     → ip_tracker.rs (attribution to source address)
//! ```
//!
//! # Design Decisions
//! - Fail closed: reject on any admission check failure
//! - Rate limiting runs before any payload is inspected
//! - No trust in client input

pub mod admission;
pub mod headers;
pub mod http_limit;
pub mod ip_tracker;
pub mod rate_limit;

pub use admission::{AdmissionControl, AdmissionError};
pub use http_limit::HttpRateLimiter;
pub use ip_tracker::{IpConnectionTracker, IpSummary};
pub use rate_limit::{EventKind, RateLimiter};
