//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → RelayConfig (validated, immutable)
//!     → shared with the hub at startup
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → sent to the server, which swaps the reloadable sections
//!       (security, rate_limit, routing) into the hub
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Listener, lock and maintenance settings need a restart

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use schema::{
    EventLimit, IpTrackingConfig, ListenerConfig, LockConfig, MaintenanceConfig,
    ObservabilityConfig, RateLimitConfig, RelayConfig, RoutingConfig, SecurityConfig,
    StatusConfig, TlsConfig,
};
