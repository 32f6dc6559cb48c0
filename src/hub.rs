//! The relay core: one owner for every shared table.
//!
//! # Responsibilities
//! - Build the lock table, ip table, directory, limiter and router together
//! - Hand out shared references to the HTTP layer and maintenance task
//! - Apply hot-reloaded configuration to the reloadable parts
//! - Tear everything down on shutdown

use std::sync::Arc;
use std::time::Instant;

use crate::config::RelayConfig;
use crate::coordination::LockManager;
use crate::directory::ClientDirectory;
use crate::net::connection::ConnectionTracker;
use crate::routing::{MessageRouter, SessionState};
use crate::security::{AdmissionControl, HttpRateLimiter, IpConnectionTracker, RateLimiter};

pub struct RelayHub {
    pub locks: Arc<LockManager>,
    pub ips: Arc<IpConnectionTracker>,
    pub directory: Arc<ClientDirectory>,
    pub limiter: Arc<RateLimiter>,
    pub router: MessageRouter,
    pub admission: AdmissionControl,
    pub http_limiter: HttpRateLimiter,
    pub sessions: ConnectionTracker,
    max_connections: usize,
    started_at: Instant,
}

impl RelayHub {
    pub fn new(config: &RelayConfig) -> Self {
        let locks = Arc::new(LockManager::new());
        let ips = Arc::new(IpConnectionTracker::new(
            locks.clone(),
            config.ip_tracking.clone(),
            config.locks.clone(),
        ));
        let directory = Arc::new(ClientDirectory::new(
            locks.clone(),
            ips.clone(),
            config.locks.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let router = MessageRouter::new(
            locks.clone(),
            directory.clone(),
            limiter.clone(),
            config.locks.clone(),
            &config.routing,
            config.security.max_payload_bytes,
        );

        Self {
            locks,
            ips,
            directory,
            limiter,
            router,
            admission: AdmissionControl::new(config.security.clone()),
            http_limiter: HttpRateLimiter::new(),
            sessions: ConnectionTracker::new(),
            max_connections: config.listener.max_connections,
            started_at: Instant::now(),
        }
    }

    /// Apply the hot-reloadable sections of a new configuration.
    pub fn apply_reload(&self, config: &RelayConfig) {
        self.admission.reload(config.security.clone());
        self.limiter.reload(config.rate_limit.clone());
        self.router
            .reload(&config.routing, config.security.max_payload_bytes);
        tracing::info!(
            max_connections_per_ip = config.security.max_connections_per_ip,
            send_limit = config.rate_limit.send.max_per_window,
            jitter_max_ms = config.routing.jitter_max_ms,
            "Configuration reloaded"
        );
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Release everything a closing session left behind.
    pub fn disconnect(&self, session: &SessionState) {
        let client_id = self.directory.unbind(session.id);
        self.limiter.forget(session.id);
        tracing::info!(
            connection_id = %session.id,
            client_id = ?client_id,
            "Client disconnected"
        );
    }

    /// Drop all bindings, windows, ip records and leases.
    pub fn shutdown(&self) {
        self.directory.clear();
        self.limiter.clear();
        self.http_limiter.clear();
        self.ips.clear();
        self.locks.clear();
        tracing::info!("Relay state cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::ConnectionId;
    use serde_json::json;
    use tokio::sync::mpsc;

    #[test]
    fn disconnect_purges_session_state() {
        let hub = RelayHub::new(&RelayConfig::default());
        let (tx, _rx) = mpsc::channel(4);
        let mut session = SessionState::new(ConnectionId::new(), Some("10.9.9.9".parse().unwrap()), tx);

        assert!(hub.router.register(&mut session, json!({ "type": "tv", "id": "tv-1" })).success);
        assert_eq!(hub.ips.count("10.9.9.9".parse().unwrap()), 1);
        assert_eq!(hub.limiter.tracked_connections(), 1);

        hub.disconnect(&session);
        assert_eq!(hub.directory.count_clients(), 0);
        assert_eq!(hub.ips.count("10.9.9.9".parse().unwrap()), 0);
        assert_eq!(hub.limiter.tracked_connections(), 0);
    }

    #[test]
    fn reload_reaches_admission_and_limits() {
        let hub = RelayHub::new(&RelayConfig::default());
        let mut config = RelayConfig::default();
        config.security.max_connections_per_ip = 1;
        config.rate_limit.send.max_per_window = 3;
        hub.apply_reload(&config);

        assert_eq!(hub.admission.config().max_connections_per_ip, 1);
        assert_eq!(hub.limiter.config().send.max_per_window, 3);
    }

    #[test]
    fn shutdown_clears_tables() {
        let hub = RelayHub::new(&RelayConfig::default());
        let (tx, _rx) = mpsc::channel(4);
        let mut session = SessionState::new(ConnectionId::new(), None, tx);
        hub.router.register(&mut session, json!({ "type": "panel", "id": "p" }));

        hub.shutdown();
        assert_eq!(hub.directory.count_connections(), 0);
        assert!(hub.locks.is_empty());
    }
}
