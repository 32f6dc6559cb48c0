//! Logical client ids mapped to live session handles.
//!
//! # Responsibilities
//! - Bind sessions under a client id (many sessions per id allowed)
//! - Unbind a session on disconnect, deleting empty bindings
//! - Attribute bound sessions to their source address
//! - Report counts and per-address statistics
//!
//! # Design Decisions
//! - Single-binding mutations hold the `client:<id>` lease
//! - Unbind is two-phase: locate under `clients`, remove under `client:<id>`
//! - Disconnect cleanup waits briefly for contended leases; what still fails
//!   is queued and retried by maintenance
//! - The dead-handle sweep rebuilds ip attributions from the live bindings
//! - A binding with no handles never exists

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::config::LockConfig;
use crate::coordination::{LockManager, ResourceKey};
use crate::net::connection::ConnectionId;
use crate::payload::schema::MAX_CLIENT_ID_CHARS;
use crate::security::ip_tracker::{IpConnectionTracker, IpSummary};

use super::handle::ConnectionHandle;

const TOP_IPS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("client id is empty or too long")]
    Malformed,
    #[error("client '{0}' is busy")]
    Contended(String),
}

/// Snapshot for the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub client_count: usize,
    pub total_connections: usize,
    pub ip_connections_count: usize,
    pub top_ips: Vec<IpSummary>,
}

pub struct ClientDirectory {
    bindings: Mutex<HashMap<String, Vec<ConnectionHandle>>>,
    deferred: Mutex<Vec<ConnectionId>>,
    locks: Arc<LockManager>,
    ips: Arc<IpConnectionTracker>,
    lock_config: LockConfig,
}

impl ClientDirectory {
    pub fn new(locks: Arc<LockManager>, ips: Arc<IpConnectionTracker>, lock_config: LockConfig) -> Self {
        Self {
            bindings: Mutex::new(HashMap::new()),
            deferred: Mutex::new(Vec::new()),
            locks,
            ips,
            lock_config,
        }
    }

    /// Add `handle` under `client_id`.
    pub fn bind(&self, client_id: &str, handle: ConnectionHandle) -> Result<(), DirectoryError> {
        if client_id.is_empty() || client_id.chars().count() > MAX_CLIENT_ID_CHARS {
            return Err(DirectoryError::Malformed);
        }

        let key = ResourceKey::client(client_id);
        let Some(_lease) = self.locks.try_acquire(&key, self.lock_config.default_timeout()) else {
            tracing::warn!(client_id = %client_id, "Bind aborted: client is locked");
            return Err(DirectoryError::Contended(client_id.to_string()));
        };

        let (conn, source, kind) = (handle.id(), handle.source(), handle.kind());
        {
            let mut bindings = self.bindings.lock().expect("directory mutex poisoned");
            let handles = bindings.entry(client_id.to_string()).or_default();
            if handles.iter().any(|h| h.id() == conn) {
                return Ok(());
            }
            handles.push(handle);
        }
        self.ips.track(source, conn);

        tracing::info!(
            client_id = %client_id,
            kind = %kind,
            connection_id = %conn,
            ip = ?source,
            "Client registered"
        );
        Ok(())
    }

    /// Remove the handle for `conn` on disconnect. Returns the client id it was bound under.
    ///
    /// If the leases stay contended past the cleanup wait, the removal is
    /// queued for `retry_deferred` and `None` is returned.
    pub fn unbind(&self, conn: ConnectionId) -> Option<String> {
        match self.unbind_within(conn, self.lock_config.cleanup_wait()) {
            Ok(client_id) => client_id,
            Err(e) => {
                tracing::warn!(connection_id = %conn, error = %e, "Unbind deferred");
                self.deferred
                    .lock()
                    .expect("directory deferred mutex poisoned")
                    .push(conn);
                None
            }
        }
    }

    /// Remove the handle for `conn`, reporting contention to the caller instead of queueing.
    pub fn try_unbind(&self, conn: ConnectionId) -> Result<Option<String>, DirectoryError> {
        self.unbind_within(conn, self.lock_config.cleanup_wait())
    }

    fn unbind_within(&self, conn: ConnectionId, wait: Duration) -> Result<Option<String>, DirectoryError> {
        let client_id = {
            let Some(_scan) = self.locks.acquire_within(
                &ResourceKey::clients(),
                self.lock_config.scan_timeout(),
                wait,
            ) else {
                return Err(DirectoryError::Contended("clients".to_string()));
            };
            let bindings = self.bindings.lock().expect("directory mutex poisoned");
            let owner = bindings
                .iter()
                .find(|(_, handles)| handles.iter().any(|h| h.id() == conn))
                .map(|(id, _)| id.clone());
            match owner {
                Some(id) => id,
                None => return Ok(None),
            }
        };

        let key = ResourceKey::client(&client_id);
        let Some(_lease) = self
            .locks
            .acquire_within(&key, self.lock_config.default_timeout(), wait)
        else {
            return Err(DirectoryError::Contended(client_id));
        };

        let removed = {
            let mut bindings = self.bindings.lock().expect("directory mutex poisoned");
            let Some(handles) = bindings.get_mut(&client_id) else {
                return Ok(None);
            };
            let removed = handles
                .iter()
                .position(|h| h.id() == conn)
                .map(|index| handles.remove(index));
            if handles.is_empty() {
                bindings.remove(&client_id);
            }
            removed
        };
        let Some(removed) = removed else {
            return Ok(None);
        };

        self.ips.untrack(removed.source(), conn);
        tracing::info!(client_id = %client_id, connection_id = %conn, "Client unbound");
        Ok(Some(client_id))
    }

    /// Retry queued unbinds once each. Returns how many removed a handle.
    pub fn retry_deferred(&self) -> usize {
        let pending = std::mem::take(&mut *self.deferred.lock().expect("directory deferred mutex poisoned"));
        if pending.is_empty() {
            return 0;
        }

        let mut removed = 0;
        let mut still_busy = Vec::new();
        for conn in pending {
            match self.unbind_within(conn, Duration::ZERO) {
                Ok(Some(_)) => removed += 1,
                Ok(None) => {}
                Err(_) => still_busy.push(conn),
            }
        }
        if !still_busy.is_empty() {
            tracing::debug!(pending = still_busy.len(), "Deferred unbinds still contended");
            self.deferred
                .lock()
                .expect("directory deferred mutex poisoned")
                .extend(still_busy);
        }
        removed
    }

    /// Unbinds waiting for a retry.
    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().expect("directory deferred mutex poisoned").len()
    }

    /// Copy of the handles bound under `client_id`.
    pub fn handles(&self, client_id: &str) -> Vec<ConnectionHandle> {
        let bindings = self.bindings.lock().expect("directory mutex poisoned");
        bindings.get(client_id).cloned().unwrap_or_default()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        let bindings = self.bindings.lock().expect("directory mutex poisoned");
        bindings.contains_key(client_id)
    }

    /// Distinct client ids with at least one handle.
    pub fn count_clients(&self) -> usize {
        self.bindings.lock().expect("directory mutex poisoned").len()
    }

    /// Handles across all client ids.
    pub fn count_connections(&self) -> usize {
        let bindings = self.bindings.lock().expect("directory mutex poisoned");
        bindings.values().map(Vec::len).sum()
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        let (client_count, total_connections) = {
            let bindings = self.bindings.lock().expect("directory mutex poisoned");
            (bindings.len(), bindings.values().map(Vec::len).sum())
        };
        ConnectionStats {
            client_count,
            total_connections,
            ip_connections_count: self.ips.len(),
            top_ips: self.ips.top(TOP_IPS),
        }
    }

    /// Drop handles whose session has ended. Skipped if the table is busy.
    pub fn sweep_dead_handles(&self) -> usize {
        let Some(_scan) = self
            .locks
            .try_acquire(&ResourceKey::clients(), self.lock_config.scan_timeout())
        else {
            tracing::debug!("Client table busy, dead-handle sweep skipped");
            return 0;
        };

        let mut dead = 0;
        let mut bindings = self.bindings.lock().expect("directory mutex poisoned");
        bindings.retain(|_, handles| {
            let before = handles.len();
            handles.retain(|h| !h.is_closed());
            dead += before - handles.len();
            !handles.is_empty()
        });

        // Binds push before tracking and unbinds remove before untracking, so
        // with the table held every attribution missing here is stale.
        let mut live: HashMap<IpAddr, HashSet<ConnectionId>> = HashMap::new();
        for handle in bindings.values().flatten() {
            if let Some(ip) = handle.source() {
                live.entry(ip).or_default().insert(handle.id());
            }
        }
        self.ips.reconcile(&live);
        drop(bindings);

        if dead > 0 {
            tracing::info!(removed = dead, "Swept dead connection handles");
        }
        dead
    }

    pub fn clear(&self) {
        self.bindings.lock().expect("directory mutex poisoned").clear();
        self.deferred.lock().expect("directory deferred mutex poisoned").clear();
    }
}
