//! In-memory client directory and message fan-out relay.

pub mod admin;
pub mod config;
pub mod coordination;
pub mod directory;
pub mod error;
pub mod http;
pub mod hub;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod payload;
pub mod protocol;
pub mod routing;
pub mod security;

pub use config::RelayConfig;
pub use error::RelayError;
pub use http::HttpServer;
pub use hub::RelayHub;
pub use lifecycle::Shutdown;
