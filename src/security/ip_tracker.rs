//! Per-address connection bookkeeping.
//!
//! # Responsibilities
//! - Attribute bound connections to their source address
//! - Answer `count(ip)` for the per-address admission cap
//! - Sweep records that have been idle for a day
//!
//! # Design Decisions
//! - Row mutations take the `ip:<addr>` lease; a contended `track` is skipped
//! - `untrack` waits briefly for the lease and queues the decrement if it
//!   still cannot get it; maintenance retries the queue
//! - `reconcile` rebuilds attributions from the live directory
//! - The sweep piggybacks on every Nth `track` call and holds the `ips` lease
//! - Connections without a known address are not tracked

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::config::{IpTrackingConfig, LockConfig};
use crate::coordination::{LockManager, ResourceKey};
use crate::net::connection::ConnectionId;

#[derive(Debug, Clone)]
struct IpRecord {
    count: usize,
    connection_ids: Vec<ConnectionId>,
    first_seen: Instant,
    last_seen: Instant,
    first_seen_unix: u64,
    last_seen_unix: u64,
}

/// Reporting view of one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpSummary {
    pub ip: IpAddr,
    pub count: usize,
    pub first_seen: u64,
    pub last_seen: u64,
}

pub struct IpConnectionTracker {
    records: Mutex<HashMap<IpAddr, IpRecord>>,
    deferred: Mutex<Vec<(IpAddr, ConnectionId)>>,
    locks: Arc<LockManager>,
    track_calls: AtomicU64,
    config: IpTrackingConfig,
    lock_config: LockConfig,
}

impl IpConnectionTracker {
    pub fn new(locks: Arc<LockManager>, config: IpTrackingConfig, lock_config: LockConfig) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            deferred: Mutex::new(Vec::new()),
            locks,
            track_calls: AtomicU64::new(0),
            config,
            lock_config,
        }
    }

    /// Attribute `conn` to `ip`.
    pub fn track(&self, ip: Option<IpAddr>, conn: ConnectionId) {
        self.track_at(ip, conn, Instant::now());
    }

    pub fn track_at(&self, ip: Option<IpAddr>, conn: ConnectionId, now: Instant) {
        let Some(ip) = ip else {
            tracing::debug!(connection_id = %conn, "No source address, skipping ip tracking");
            return;
        };

        let calls = self.track_calls.fetch_add(1, Ordering::Relaxed) + 1;
        if self.config.sweep_every > 0 && calls % self.config.sweep_every == 0 {
            self.sweep_stale_at(now);
        }

        let key = ResourceKey::ip(ip);
        let Some(_lease) = self.locks.try_acquire(&key, self.lock_config.ip_timeout()) else {
            tracing::warn!(ip = %ip, connection_id = %conn, "ip record busy, connection not attributed");
            return;
        };

        let unix = unix_now();
        let mut records = self.records.lock().expect("ip table mutex poisoned");
        let record = records.entry(ip).or_insert_with(|| IpRecord {
            count: 0,
            connection_ids: Vec::new(),
            first_seen: now,
            last_seen: now,
            first_seen_unix: unix,
            last_seen_unix: unix,
        });
        if !record.connection_ids.contains(&conn) {
            record.connection_ids.push(conn);
            record.count += 1;
        }
        record.last_seen = now;
        record.last_seen_unix = unix;
    }

    /// Remove the attribution of `conn` to `ip`.
    pub fn untrack(&self, ip: Option<IpAddr>, conn: ConnectionId) {
        let Some(ip) = ip else { return };

        if !self.untrack_within(ip, conn, self.lock_config.cleanup_wait()) {
            tracing::warn!(ip = %ip, connection_id = %conn, "ip record busy, untrack deferred");
            self.deferred
                .lock()
                .expect("ip deferred mutex poisoned")
                .push((ip, conn));
        }
    }

    fn untrack_within(&self, ip: IpAddr, conn: ConnectionId, wait: Duration) -> bool {
        let key = ResourceKey::ip(ip);
        let Some(_lease) = self
            .locks
            .acquire_within(&key, self.lock_config.ip_timeout(), wait)
        else {
            return false;
        };

        let mut records = self.records.lock().expect("ip table mutex poisoned");
        if let Some(record) = records.get_mut(&ip) {
            let before = record.connection_ids.len();
            record.connection_ids.retain(|id| *id != conn);
            if record.connection_ids.len() < before {
                record.count = record.count.saturating_sub(1);
            }
        }
        true
    }

    /// Retry queued untracks once each. Returns how many went through.
    pub fn retry_deferred(&self) -> usize {
        let pending = std::mem::take(&mut *self.deferred.lock().expect("ip deferred mutex poisoned"));
        if pending.is_empty() {
            return 0;
        }

        let mut done = 0;
        let mut still_busy = Vec::new();
        for (ip, conn) in pending {
            if self.untrack_within(ip, conn, Duration::ZERO) {
                done += 1;
            } else {
                still_busy.push((ip, conn));
            }
        }
        if !still_busy.is_empty() {
            self.deferred
                .lock()
                .expect("ip deferred mutex poisoned")
                .extend(still_busy);
        }
        done
    }

    /// Untracks waiting for a retry.
    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().expect("ip deferred mutex poisoned").len()
    }

    /// Drop attributions to connections absent from `live`, and fix every count.
    ///
    /// The caller must hold the directory table so no bind or unbind is in
    /// flight between taking `live` and applying it. Returns how many
    /// attributions were dropped.
    pub fn reconcile(&self, live: &HashMap<IpAddr, HashSet<ConnectionId>>) -> usize {
        let empty = HashSet::new();
        let mut dropped = 0;
        let mut records = self.records.lock().expect("ip table mutex poisoned");
        for (ip, record) in records.iter_mut() {
            let attached = live.get(ip).unwrap_or(&empty);
            let before = record.connection_ids.len();
            record.connection_ids.retain(|id| attached.contains(id));
            dropped += before - record.connection_ids.len();
            record.count = record.connection_ids.len();
        }
        if dropped > 0 {
            tracing::warn!(dropped, "Reconciled ip attributions with the directory");
        }
        dropped
    }

    /// Connections currently attributed to `ip`.
    pub fn count(&self, ip: IpAddr) -> usize {
        let records = self.records.lock().expect("ip table mutex poisoned");
        records.get(&ip).map_or(0, |record| record.count)
    }

    /// Remove records idle longer than the configured age. Skipped if the table is busy.
    pub fn sweep_stale(&self) -> usize {
        self.sweep_stale_at(Instant::now())
    }

    pub fn sweep_stale_at(&self, now: Instant) -> usize {
        let Some(_lease) = self
            .locks
            .try_acquire(&ResourceKey::ips(), self.lock_config.scan_timeout())
        else {
            tracing::debug!("ip table busy, stale sweep skipped");
            return 0;
        };

        let stale_after = self.config.stale_after();
        let mut records = self.records.lock().expect("ip table mutex poisoned");
        let before = records.len();
        records.retain(|_, record| now.saturating_duration_since(record.last_seen) <= stale_after);
        let removed = before - records.len();
        if removed > 0 {
            tracing::info!(removed, "Swept stale ip records");
        }
        removed
    }

    /// Addresses with the most attributed connections, busiest first.
    pub fn top(&self, n: usize) -> Vec<IpSummary> {
        let records = self.records.lock().expect("ip table mutex poisoned");
        let mut summaries: Vec<IpSummary> = records
            .iter()
            .map(|(ip, record)| IpSummary {
                ip: *ip,
                count: record.count,
                first_seen: record.first_seen_unix,
                last_seen: record.last_seen_unix,
            })
            .collect();
        summaries.sort_by(|a, b| b.count.cmp(&a.count).then(a.ip.cmp(&b.ip)));
        summaries.truncate(n);
        summaries
    }

    /// Number of addresses with a record.
    pub fn len(&self) -> usize {
        self.records.lock().expect("ip table mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records.lock().expect("ip table mutex poisoned").clear();
        self.deferred.lock().expect("ip deferred mutex poisoned").clear();
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
