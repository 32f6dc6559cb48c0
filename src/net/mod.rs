//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → tls.rs (optional TLS handshake, via axum-server)
//!     → connection.rs (session slot, connection id)
//!     → Hand off to the WebSocket session
//! ```

pub mod connection;
pub mod tls;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
