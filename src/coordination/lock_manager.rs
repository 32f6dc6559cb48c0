//! Advisory, timeout-bound lock manager.
//!
//! # Responsibilities
//! - Grant at most one lease per resource key
//! - Refuse contended keys immediately (try-once semantics)
//! - Force-free leases that outlive their deadline
//!
//! # Design Decisions
//! - Leases carry a token so a stale holder cannot release its successor
//! - Expiry is checked lazily on access and in bulk by `reap_expired`

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::observability::metrics;

/// Name of a lockable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Global key guarding scans over the whole client table.
    pub fn clients() -> Self {
        Self("clients".to_string())
    }

    /// Global key guarding scans over the whole ip table.
    pub fn ips() -> Self {
        Self("ips".to_string())
    }

    /// Per-client key guarding a single binding.
    pub fn client(id: &str) -> Self {
        Self(format!("client:{}", id))
    }

    /// Per-address key guarding a single ip record.
    pub fn ip(addr: IpAddr) -> Self {
        Self(format!("ip:{}", addr))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Coarse label for metrics ("clients", "ips", "client", "ip").
    pub fn kind(&self) -> &str {
        self.0.split(':').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: u64,
    held_since: Instant,
    deadline: Instant,
}

/// Table of advisory leases keyed by resource.
#[derive(Debug, Default)]
pub struct LockManager {
    leases: Mutex<HashMap<ResourceKey, Lease>>,
    next_token: AtomicU64,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take `key` for at most `timeout`.
    ///
    /// Returns `None` right away if another unexpired lease holds the key.
    pub fn try_acquire(&self, key: &ResourceKey, timeout: Duration) -> Option<LockLease<'_>> {
        self.try_acquire_at(key, timeout, Instant::now())
    }

    pub fn try_acquire_at(
        &self,
        key: &ResourceKey,
        timeout: Duration,
        now: Instant,
    ) -> Option<LockLease<'_>> {
        let lease = self.acquire_once(key, timeout, now);
        if lease.is_none() {
            metrics::record_lock_contention(key.kind());
        }
        lease
    }

    /// Like `try_acquire`, but keeps retrying for up to `wait` before giving up.
    ///
    /// For cleanup that must not be dropped on contention. Holders never
    /// await while holding a lease, so the wait is normally a few yields.
    pub fn acquire_within(
        &self,
        key: &ResourceKey,
        timeout: Duration,
        wait: Duration,
    ) -> Option<LockLease<'_>> {
        let give_up = Instant::now() + wait;
        loop {
            let now = Instant::now();
            if let Some(lease) = self.acquire_once(key, timeout, now) {
                return Some(lease);
            }
            if now >= give_up {
                metrics::record_lock_contention(key.kind());
                return None;
            }
            std::thread::yield_now();
        }
    }

    fn acquire_once(&self, key: &ResourceKey, timeout: Duration, now: Instant) -> Option<LockLease<'_>> {
        let mut leases = self.leases.lock().expect("lock table mutex poisoned");

        if let Some(existing) = leases.get(key) {
            if now < existing.deadline {
                return None;
            }
            warn_auto_release(key, existing, now);
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        leases.insert(
            key.clone(),
            Lease {
                token,
                held_since: now,
                deadline: now + timeout,
            },
        );

        Some(LockLease {
            manager: self,
            key: key.clone(),
            token,
        })
    }

    /// Release `key` regardless of holder. Releasing a free key is a no-op.
    pub fn release(&self, key: &ResourceKey) {
        let mut leases = self.leases.lock().expect("lock table mutex poisoned");
        leases.remove(key);
    }

    fn release_token(&self, key: &ResourceKey, token: u64) {
        let mut leases = self.leases.lock().expect("lock table mutex poisoned");
        if leases.get(key).is_some_and(|lease| lease.token == token) {
            leases.remove(key);
        }
    }

    /// Whether `key` is held by an unexpired lease.
    pub fn is_held(&self, key: &ResourceKey) -> bool {
        self.is_held_at(key, Instant::now())
    }

    pub fn is_held_at(&self, key: &ResourceKey, now: Instant) -> bool {
        let leases = self.leases.lock().expect("lock table mutex poisoned");
        leases.get(key).is_some_and(|lease| now < lease.deadline)
    }

    /// Force-free every lease whose deadline has passed. Returns how many were freed.
    pub fn reap_expired(&self) -> usize {
        self.reap_expired_at(Instant::now())
    }

    pub fn reap_expired_at(&self, now: Instant) -> usize {
        let mut leases = self.leases.lock().expect("lock table mutex poisoned");
        let before = leases.len();
        leases.retain(|key, lease| {
            if now >= lease.deadline {
                warn_auto_release(key, lease, now);
                false
            } else {
                true
            }
        });
        before - leases.len()
    }

    /// Number of leases currently recorded (expired ones included until reaped).
    pub fn len(&self) -> usize {
        self.leases.lock().expect("lock table mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every lease (shutdown).
    pub fn clear(&self) {
        self.leases.lock().expect("lock table mutex poisoned").clear();
    }
}

fn warn_auto_release(key: &ResourceKey, lease: &Lease, now: Instant) {
    tracing::warn!(
        resource = %key,
        held_ms = now.duration_since(lease.held_since).as_millis() as u64,
        "Lock auto-released after timeout"
    );
    metrics::record_lock_auto_released();
}

/// A held lease. Released when dropped, unless it was already force-freed.
#[derive(Debug)]
pub struct LockLease<'a> {
    manager: &'a LockManager,
    key: ResourceKey,
    token: u64,
}

impl LockLease<'_> {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Explicit release; same as dropping the lease.
    pub fn release(self) {}
}

impl Drop for LockLease<'_> {
    fn drop(&mut self) {
        self.manager.release_token(&self.key, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_refused_until_timeout() {
        let locks = LockManager::new();
        let key = ResourceKey::from_str_for_test("k");
        let start = Instant::now();

        let first = locks.try_acquire_at(&key, Duration::from_millis(1000), start);
        assert!(first.is_some());
        assert!(locks
            .try_acquire_at(&key, Duration::from_millis(1000), start)
            .is_none());

        // Holder never releases; the lease lapses.
        std::mem::forget(first);
        let later = start + Duration::from_millis(1000);
        assert!(locks.try_acquire_at(&key, Duration::from_millis(1000), later).is_some());
    }

    #[test]
    fn dropping_lease_frees_key() {
        let locks = LockManager::new();
        let key = ResourceKey::client("tv-1");
        {
            let _lease = locks.try_acquire(&key, Duration::from_secs(1)).unwrap();
            assert!(locks.is_held(&key));
        }
        assert!(!locks.is_held(&key));
        assert!(locks.try_acquire(&key, Duration::from_secs(1)).is_some());
    }

    #[test]
    fn release_is_idempotent() {
        let locks = LockManager::new();
        let key = ResourceKey::clients();
        locks.release(&key);

        let lease = locks.try_acquire(&key, Duration::from_secs(1)).unwrap();
        locks.release(&key);
        locks.release(&key);
        drop(lease);
        assert!(locks.is_empty());
    }

    #[test]
    fn stale_lease_does_not_release_successor() {
        let locks = LockManager::new();
        let key = ResourceKey::ip("10.0.0.1".parse().unwrap());
        let start = Instant::now();

        let stale = locks.try_acquire_at(&key, Duration::from_millis(10), start).unwrap();
        let after = start + Duration::from_millis(20);
        let fresh = locks.try_acquire_at(&key, Duration::from_secs(5), after).unwrap();

        drop(stale);
        assert!(locks.is_held_at(&key, after));
        drop(fresh);
        assert!(!locks.is_held_at(&key, after));
    }

    #[test]
    fn acquire_within_waits_for_holder() {
        let locks = std::sync::Arc::new(LockManager::new());
        let key = ResourceKey::clients();
        let held = locks.try_acquire(&key, Duration::from_secs(5)).unwrap();

        let waiter = {
            let locks = locks.clone();
            let key = key.clone();
            std::thread::spawn(move || {
                locks
                    .acquire_within(&key, Duration::from_secs(1), Duration::from_secs(5))
                    .is_some()
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        drop(held);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn acquire_within_gives_up_after_wait() {
        let locks = LockManager::new();
        let key = ResourceKey::client("tv-9");
        let _held = locks.try_acquire(&key, Duration::from_secs(5)).unwrap();

        let start = Instant::now();
        assert!(locks
            .acquire_within(&key, Duration::from_secs(1), Duration::from_millis(20))
            .is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn reap_removes_only_expired() {
        let locks = LockManager::new();
        let start = Instant::now();
        let short = locks
            .try_acquire_at(&ResourceKey::client("a"), Duration::from_millis(5), start)
            .unwrap();
        let long = locks
            .try_acquire_at(&ResourceKey::client("b"), Duration::from_secs(10), start)
            .unwrap();
        std::mem::forget(short);

        assert_eq!(locks.reap_expired_at(start + Duration::from_millis(6)), 1);
        assert_eq!(locks.len(), 1);
        drop(long);
        assert!(locks.is_empty());
    }

    #[test]
    fn key_kinds() {
        assert_eq!(ResourceKey::clients().kind(), "clients");
        assert_eq!(ResourceKey::client("x").kind(), "client");
        assert_eq!(ResourceKey::client("x").as_str(), "client:x");
        assert_eq!(ResourceKey::ip("::1".parse().unwrap()).as_str(), "ip:::1");
    }

    impl ResourceKey {
        fn from_str_for_test(s: &str) -> Self {
            Self(s.to_string())
        }
    }
}
