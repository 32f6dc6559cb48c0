//! Admission control for WebSocket upgrades.
//!
//! # Responsibilities
//! - Refuse blacklisted source addresses
//! - Refuse user agents carrying hostile markers
//! - Throttle reconnect storms from one address and agent
//! - Enforce the per-address connection cap
//!
//! # Design Decisions
//! - Checks run before the upgrade, so a refusal is a plain HTTP status
//! - The process-wide cap is enforced separately by the connection tracker

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::http::StatusCode;
use thiserror::Error;

use crate::config::SecurityConfig;
use crate::observability::metrics;
use crate::security::ip_tracker::IpConnectionTracker;

/// Leading user-agent characters that identify a client for reconnect throttling.
const RECONNECT_AGENT_CHARS: usize = 20;

/// Reasons an upgrade is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("address {0} is blacklisted")]
    Blacklisted(IpAddr),

    #[error("user agent rejected")]
    SuspiciousAgent,

    #[error("reconnecting too fast")]
    ReconnectTooFast,

    #[error("too many connections from {ip} ({count}/{max})")]
    PerIpLimit { ip: IpAddr, count: usize, max: usize },

    #[error("server is at capacity ({max} connections)")]
    TotalLimit { max: usize },
}

impl AdmissionError {
    pub fn status(&self) -> StatusCode {
        match self {
            AdmissionError::Blacklisted(_) | AdmissionError::SuspiciousAgent => StatusCode::FORBIDDEN,
            AdmissionError::ReconnectTooFast | AdmissionError::PerIpLimit { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            AdmissionError::TotalLimit { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Label used for the rejection counter.
    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionError::Blacklisted(_) => "blacklisted",
            AdmissionError::SuspiciousAgent => "user_agent",
            AdmissionError::ReconnectTooFast => "reconnect",
            AdmissionError::PerIpLimit { .. } => "per_ip",
            AdmissionError::TotalLimit { .. } => "total",
        }
    }

    /// Body sent with the refusal.
    pub fn public_message(&self) -> &'static str {
        match self {
            AdmissionError::Blacklisted(_) | AdmissionError::SuspiciousAgent => "Access denied",
            AdmissionError::ReconnectTooFast => "Reconnecting too fast",
            AdmissionError::PerIpLimit { .. } => "Too many connections from this address",
            AdmissionError::TotalLimit { .. } => "Server at capacity, try again later",
        }
    }
}

pub struct AdmissionControl {
    config: ArcSwap<SecurityConfig>,
    blacklist: ArcSwap<Vec<IpAddr>>,
    recent: Mutex<HashMap<String, Instant>>,
}

impl AdmissionControl {
    pub fn new(config: SecurityConfig) -> Self {
        let blacklist = parse_blacklist(&config.blacklist);
        Self {
            config: ArcSwap::from_pointee(config),
            blacklist: ArcSwap::from_pointee(blacklist),
            recent: Mutex::new(HashMap::new()),
        }
    }

    pub fn reload(&self, config: SecurityConfig) {
        self.blacklist.store(Arc::new(parse_blacklist(&config.blacklist)));
        self.config.store(Arc::new(config));
    }

    pub fn config(&self) -> Arc<SecurityConfig> {
        self.config.load_full()
    }

    /// Decide whether a new upgrade from `ip` with `user_agent` may proceed.
    pub fn check(
        &self,
        ip: Option<IpAddr>,
        user_agent: &str,
        ips: &IpConnectionTracker,
    ) -> Result<(), AdmissionError> {
        self.check_at(ip, user_agent, ips, Instant::now())
    }

    pub fn check_at(
        &self,
        ip: Option<IpAddr>,
        user_agent: &str,
        ips: &IpConnectionTracker,
        now: Instant,
    ) -> Result<(), AdmissionError> {
        let result = self.evaluate(ip, user_agent, ips, now);
        if let Err(e) = &result {
            tracing::warn!(
                ip = ?ip,
                user_agent = %user_agent,
                reason = e.reason(),
                "Connection refused: {}",
                e
            );
            metrics::record_admission_rejected(e.reason());
        }
        result
    }

    fn evaluate(
        &self,
        ip: Option<IpAddr>,
        user_agent: &str,
        ips: &IpConnectionTracker,
        now: Instant,
    ) -> Result<(), AdmissionError> {
        let config = self.config.load();

        if let Some(ip) = ip {
            if self.blacklist.load().contains(&ip) {
                return Err(AdmissionError::Blacklisted(ip));
            }
        }

        let agent = user_agent.to_ascii_lowercase();
        if config
            .blocked_user_agents
            .iter()
            .any(|marker| !marker.is_empty() && agent.contains(&marker.to_ascii_lowercase()))
        {
            return Err(AdmissionError::SuspiciousAgent);
        }

        let key = format!(
            "{}|{}",
            ip.map(|ip| ip.to_string()).unwrap_or_default(),
            user_agent.chars().take(RECONNECT_AGENT_CHARS).collect::<String>()
        );
        {
            let mut recent = self.recent.lock().expect("admission mutex poisoned");
            let too_fast = recent
                .get(&key)
                .is_some_and(|last| now.saturating_duration_since(*last) < config.reconnect_interval());
            recent.insert(key, now);
            if too_fast {
                return Err(AdmissionError::ReconnectTooFast);
            }
        }

        if let Some(ip) = ip {
            let count = ips.count(ip);
            if count >= config.max_connections_per_ip {
                return Err(AdmissionError::PerIpLimit {
                    ip,
                    count,
                    max: config.max_connections_per_ip,
                });
            }
        }

        Ok(())
    }

    /// Forget reconnect timestamps older than `max_age`.
    pub fn prune_recent(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut recent = self.recent.lock().expect("admission mutex poisoned");
        let before = recent.len();
        recent.retain(|_, last| now.saturating_duration_since(*last) <= max_age);
        before - recent.len()
    }
}

fn parse_blacklist(entries: &[String]) -> Vec<IpAddr> {
    entries
        .iter()
        .filter_map(|entry| match entry.parse::<IpAddr>() {
            Ok(ip) => Some(ip),
            Err(_) => {
                tracing::warn!(entry = %entry, "Ignoring unparsable blacklist entry");
                None
            }
        })
        .collect()
}
