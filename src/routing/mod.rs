//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! send frame
//!     → router.rs (rate check → sanitize → validate → integrity)
//!     → router.rs route(): per target, in caller order
//!         unknown  → skip
//!         locked   → skip
//!         otherwise snapshot handles → emit `message`
//!     → jitter.rs (uniform random delay)
//!     → `message_sent` acknowledgment
//! ```
//!
//! # Design Decisions
//! - Delivery is best effort; offline targets are not queued
//! - The acknowledgment delay is never skipped, on success or failure

pub mod jitter;
pub mod router;

pub use jitter::Jitter;
pub use router::{MessageRouter, RouteReport, SessionState};
