//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the relay.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the relay.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    /// Listener configuration (bind address, TLS, global connection cap).
    pub listener: ListenerConfig,

    /// Admission control and payload limits.
    pub security: SecurityConfig,

    /// Per-connection, per-event rate limiting.
    pub rate_limit: RateLimitConfig,

    /// Advisory lock timeouts.
    pub locks: LockConfig,

    /// Per-address connection bookkeeping.
    pub ip_tracking: IpTrackingConfig,

    /// Message routing settings.
    pub routing: RoutingConfig,

    /// Periodic maintenance intervals.
    pub maintenance: MaintenanceConfig,

    /// Status endpoint settings.
    pub status: StatusConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:3001").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrent WebSocket sessions for the whole process.
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3001".to_string(),
            tls: None,
            max_connections: 50,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Admission control and payload limits. Hot-reloadable.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Maximum bound connections attributed to one source address.
    pub max_connections_per_ip: usize,

    /// Source addresses refused outright.
    pub blacklist: Vec<String>,

    /// Minimum spacing between two upgrades from the same address and agent.
    pub reconnect_interval_ms: u64,

    /// Case-insensitive substrings that mark a user agent as hostile.
    pub blocked_user_agents: Vec<String>,

    /// Hard lifetime of a session before it is closed.
    pub session_lifetime_secs: u64,

    /// Ceiling for a serialized message payload.
    pub max_payload_bytes: usize,

    /// Outbound frames buffered per session before emits start failing.
    pub outbound_buffer: usize,

    /// HTTP requests (upgrades and status) admitted per source address per window.
    pub http_requests_per_window: u32,

    /// Window over which the HTTP request allowance refills.
    pub http_window_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_connections_per_ip: 5,
            blacklist: Vec::new(),
            reconnect_interval_ms: 100,
            blocked_user_agents: vec![
                "malware".to_string(),
                "exploit".to_string(),
                "attack".to_string(),
            ],
            session_lifetime_secs: 4 * 60 * 60,
            max_payload_bytes: 1024 * 1024, // 1MB
            outbound_buffer: 64,
            http_requests_per_window: 100,
            http_window_secs: 15 * 60,
        }
    }
}

impl SecurityConfig {
    pub fn session_lifetime(&self) -> Duration {
        Duration::from_secs(self.session_lifetime_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Largest frame the transport accepts: the payload ceiling plus envelope room.
    pub fn max_frame_bytes(&self) -> usize {
        self.max_payload_bytes.saturating_add(64 * 1024)
    }
}

/// Limit for one event type.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct EventLimit {
    /// Calls admitted per window.
    pub max_per_window: u32,

    /// How long a sender stays blocked after exceeding the limit.
    pub block_secs: u64,
}

impl EventLimit {
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_secs)
    }
}

/// Rate limiting configuration. Hot-reloadable.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Window length in seconds.
    pub window_secs: u64,

    /// Windows untouched for this long are swept.
    pub idle_secs: u64,

    pub register: EventLimit,
    pub send: EventLimit,
    pub default: EventLimit,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            idle_secs: 60 * 60,
            register: EventLimit {
                max_per_window: 5,
                block_secs: 60,
            },
            send: EventLimit {
                max_per_window: 30,
                block_secs: 120,
            },
            default: EventLimit {
                max_per_window: 60,
                block_secs: 30,
            },
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }
}

/// Advisory lock timeouts in milliseconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease for single-client mutations (bind, unbind).
    pub default_timeout_ms: u64,

    /// Lease for one target during fan-out.
    pub route_timeout_ms: u64,

    /// Lease for whole-table scans.
    pub scan_timeout_ms: u64,

    /// Lease for one ip record.
    pub ip_timeout_ms: u64,

    /// How long disconnect cleanup keeps retrying a contended lease before
    /// handing the work to maintenance.
    pub cleanup_wait_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 1000,
            route_timeout_ms: 300,
            scan_timeout_ms: 2000,
            ip_timeout_ms: 500,
            cleanup_wait_ms: 50,
        }
    }
}

impl LockConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn route_timeout(&self) -> Duration {
        Duration::from_millis(self.route_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn ip_timeout(&self) -> Duration {
        Duration::from_millis(self.ip_timeout_ms)
    }

    pub fn cleanup_wait(&self) -> Duration {
        Duration::from_millis(self.cleanup_wait_ms)
    }
}

/// Per-address bookkeeping configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IpTrackingConfig {
    /// Run the stale sweep on every Nth `track` call.
    pub sweep_every: u64,

    /// Records idle longer than this are removed by the sweep.
    pub stale_after_secs: u64,
}

impl Default for IpTrackingConfig {
    fn default() -> Self {
        Self {
            sweep_every: 100,
            stale_after_secs: 24 * 60 * 60,
        }
    }
}

impl IpTrackingConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Routing configuration. Hot-reloadable.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Lower bound of the acknowledgment delay.
    pub jitter_min_ms: u64,

    /// Upper bound of the acknowledgment delay.
    pub jitter_max_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            jitter_min_ms: 10,
            jitter_max_ms: 60,
        }
    }
}

/// Periodic maintenance intervals in seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub dead_handle_sweep_secs: u64,
    pub rate_window_sweep_secs: u64,
    pub lock_reap_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            dead_handle_sweep_secs: 30 * 60,
            rate_window_sweep_secs: 60 * 60,
            lock_reap_secs: 60,
        }
    }
}

/// Status endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StatusConfig {
    /// System name reported by `/status`.
    pub name: String,

    /// Token unlocking the detailed view. Generated at startup when absent.
    pub access_token: Option<String>,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            name: "relay-hub".to_string(),
            access_token: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: RelayConfig = toml::from_str(
            r#"
            [security]
            max_connections_per_ip = 2

            [rate_limit.send]
            max_per_window = 10
            block_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.security.max_connections_per_ip, 2);
        assert_eq!(config.security.max_payload_bytes, 1024 * 1024);
        assert_eq!(config.rate_limit.send.max_per_window, 10);
        assert_eq!(config.rate_limit.register.max_per_window, 5);
        assert_eq!(config.listener.max_connections, 50);
        assert_eq!(config.routing.jitter_min_ms, 10);
    }
}
