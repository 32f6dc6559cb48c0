//! Periodic housekeeping of the relay tables.
//!
//! # Responsibilities
//! - Drop handles of sessions that ended without a clean unbind
//! - Finish disconnect cleanup that was deferred on lease contention
//! - Sweep rate windows of idle connections and refilled HTTP buckets
//! - Reap leases that outlived their deadline
//!
//! # Design Decisions
//! - One task, one `select!` over three intervals and the shutdown signal
//! - The stale-ip sweep is not here; it piggybacks on `track` calls

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::MaintenanceConfig;
use crate::hub::RelayHub;

/// How long a reconnect timestamp is remembered by admission control.
const RECONNECT_MEMORY: Duration = Duration::from_secs(60);

pub struct Maintenance {
    hub: Arc<RelayHub>,
    config: MaintenanceConfig,
}

impl Maintenance {
    pub fn new(hub: Arc<RelayHub>, config: MaintenanceConfig) -> Self {
        Self { hub, config }
    }

    /// Run until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut handles = every(self.config.dead_handle_sweep_secs);
        let mut windows = every(self.config.rate_window_sweep_secs);
        let mut leases = every(self.config.lock_reap_secs);

        // The first tick of an interval completes immediately.
        handles.tick().await;
        windows.tick().await;
        leases.tick().await;

        tracing::debug!(
            dead_handle_sweep_secs = self.config.dead_handle_sweep_secs,
            rate_window_sweep_secs = self.config.rate_window_sweep_secs,
            lock_reap_secs = self.config.lock_reap_secs,
            "Maintenance task started"
        );

        loop {
            tokio::select! {
                _ = handles.tick() => {
                    self.retry_cleanup();
                    self.sweep_handles();
                }
                _ = windows.tick() => {
                    self.sweep_windows();
                }
                _ = leases.tick() => {
                    self.reap_leases();
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Maintenance task stopping");
                    break;
                }
            }
        }
    }

    pub fn sweep_handles(&self) -> usize {
        self.hub.directory.sweep_dead_handles()
    }

    /// Retry unbinds and untracks that gave up on a contended lease.
    pub fn retry_cleanup(&self) -> usize {
        let unbound = self.hub.directory.retry_deferred();
        let untracked = self.hub.ips.retry_deferred();
        if unbound + untracked > 0 {
            tracing::info!(unbound, untracked, "Finished deferred disconnect cleanup");
        }
        unbound + untracked
    }

    pub fn sweep_windows(&self) -> usize {
        let config = self.hub.admission.config();
        self.hub.http_limiter.prune_full(&config);
        self.hub.limiter.sweep_idle()
    }

    pub fn reap_leases(&self) -> usize {
        let reaped = self.hub.locks.reap_expired();
        self.hub.admission.prune_recent(RECONNECT_MEMORY);
        reaped
    }
}

fn every(secs: u64) -> tokio::time::Interval {
    let mut ticker = interval(Duration::from_secs(secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::coordination::ResourceKey;
    use crate::lifecycle::Shutdown;
    use crate::net::connection::ConnectionId;
    use crate::routing::SessionState;
    use serde_json::json;
    use tokio::sync::mpsc;

    #[test]
    fn sweeps_remove_abandoned_sessions() {
        let hub = Arc::new(RelayHub::new(&RelayConfig::default()));
        let (tx, rx) = mpsc::channel(4);
        let mut session = SessionState::new(ConnectionId::new(), None, tx);
        hub.router.register(&mut session, json!({ "type": "tv", "id": "ghost" }));
        drop(rx);

        let maintenance = Maintenance::new(hub.clone(), MaintenanceConfig::default());
        assert_eq!(maintenance.sweep_handles(), 1);
        assert!(!hub.directory.contains("ghost"));
        assert_eq!(maintenance.reap_leases(), 0);
    }

    #[test]
    fn deferred_unbind_is_finished_by_maintenance() {
        let hub = Arc::new(RelayHub::new(&RelayConfig::default()));
        let (tx, _rx) = mpsc::channel(4);
        let mut session = SessionState::new(ConnectionId::new(), None, tx);
        hub.router.register(&mut session, json!({ "type": "tv", "id": "busy" }));

        {
            let _held = hub
                .locks
                .try_acquire(&ResourceKey::client("busy"), Duration::from_secs(5))
                .unwrap();
            assert_eq!(hub.directory.unbind(session.id), None);
        }
        assert!(hub.directory.contains("busy"));

        let maintenance = Maintenance::new(hub.clone(), MaintenanceConfig::default());
        assert_eq!(maintenance.retry_cleanup(), 1);
        assert!(!hub.directory.contains("busy"));
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let hub = Arc::new(RelayHub::new(&RelayConfig::default()));
        let shutdown = Shutdown::new();
        let task = tokio::spawn(Maintenance::new(hub, MaintenanceConfig::default()).run(shutdown.subscribe()));

        tokio::task::yield_now().await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("maintenance did not stop")
            .unwrap();
    }
}
