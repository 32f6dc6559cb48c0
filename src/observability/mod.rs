//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → stdout (fmt subscriber, filtered by RUST_LOG or config)
//!     → Metrics endpoint (Prometheus scrape)
//!     → /status (connection statistics, served by the admin module)
//! ```
//!
//! # Design Decisions
//! - Structured fields on every event (connection id, client id, ip)
//! - Metrics are cheap (atomic increments behind the `metrics` facade)
//! - Nothing here mutates relay state

pub mod logging;
pub mod metrics;
