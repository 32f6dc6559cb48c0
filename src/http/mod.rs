//! HTTP and WebSocket surface.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, middleware)
//!     → request.rs (request ID, tracing span)
//!     → websocket.rs (admission, upgrade, session loop)
//!       or admin (status snapshot)
//! ```

pub mod request;
pub mod server;
pub mod websocket;

pub use request::{RequestIdSpan, UuidRequestId, X_REQUEST_ID};
pub use server::{AppState, HttpServer};
