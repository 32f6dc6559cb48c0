//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, jitter bounds ordered)
//! - Check addresses parse (bind, metrics, blacklist entries)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RelayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::config::schema::{EventLimit, RelayConfig};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &RelayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new("listener.bind_address", "not a socket address"));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be > 0"));
    }

    let security = &config.security;
    if security.max_connections_per_ip == 0 {
        errors.push(ValidationError::new("security.max_connections_per_ip", "must be > 0"));
    }
    if security.max_payload_bytes == 0 {
        errors.push(ValidationError::new("security.max_payload_bytes", "must be > 0"));
    }
    if security.outbound_buffer == 0 {
        errors.push(ValidationError::new("security.outbound_buffer", "must be > 0"));
    }
    if security.http_requests_per_window == 0 {
        errors.push(ValidationError::new("security.http_requests_per_window", "must be > 0"));
    }
    if security.http_window_secs == 0 {
        errors.push(ValidationError::new("security.http_window_secs", "must be > 0"));
    }
    if security.session_lifetime_secs == 0 {
        errors.push(ValidationError::new("security.session_lifetime_secs", "must be > 0"));
    }
    for entry in &security.blacklist {
        if entry.parse::<IpAddr>().is_err() {
            errors.push(ValidationError::new(
                "security.blacklist",
                format!("'{}' is not an ip address", entry),
            ));
        }
    }

    let rate = &config.rate_limit;
    if rate.window_secs == 0 {
        errors.push(ValidationError::new("rate_limit.window_secs", "must be > 0"));
    }
    check_limit(&mut errors, "rate_limit.register", &rate.register);
    check_limit(&mut errors, "rate_limit.send", &rate.send);
    check_limit(&mut errors, "rate_limit.default", &rate.default);

    let locks = &config.locks;
    for (field, value) in [
        ("locks.default_timeout_ms", locks.default_timeout_ms),
        ("locks.route_timeout_ms", locks.route_timeout_ms),
        ("locks.scan_timeout_ms", locks.scan_timeout_ms),
        ("locks.ip_timeout_ms", locks.ip_timeout_ms),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be > 0"));
        }
    }

    if config.ip_tracking.sweep_every == 0 {
        errors.push(ValidationError::new("ip_tracking.sweep_every", "must be > 0"));
    }

    if config.routing.jitter_min_ms > config.routing.jitter_max_ms {
        errors.push(ValidationError::new(
            "routing.jitter_min_ms",
            "must not exceed routing.jitter_max_ms",
        ));
    }

    let maintenance = &config.maintenance;
    if maintenance.dead_handle_sweep_secs == 0
        || maintenance.rate_window_sweep_secs == 0
        || maintenance.lock_reap_secs == 0
    {
        errors.push(ValidationError::new("maintenance", "intervals must be > 0"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "not a socket address",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_limit(errors: &mut Vec<ValidationError>, field: &str, limit: &EventLimit) {
    if limit.max_per_window == 0 {
        errors.push(ValidationError::new(field, "max_per_window must be > 0"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&RelayConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = RelayConfig::default();
        config.listener.bind_address = "nowhere".to_string();
        config.security.blacklist = vec!["10.0.0.1".to_string(), "bogus".to_string()];
        config.rate_limit.send.max_per_window = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec!["listener.bind_address", "security.blacklist", "rate_limit.send"]
        );
    }
}
