//! Per-connection, per-event fixed-window rate limiting.
//!
//! # Responsibilities
//! - Count calls per `(connection, event class)` inside a fixed window
//! - Block a sender for a cool-down once it exceeds the event's limit
//! - Forget a connection's windows on disconnect and sweep idle ones
//!
//! # Design Decisions
//! - Windows reset on a fixed boundary, not a moving average
//! - A blocked call does not count toward the next window
//! - Each connection's windows sit behind one DashMap entry lock
//! - Every event outside the protocol shares one window, so a connection
//!   holds at most three windows whatever names it sends

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::config::{EventLimit, RateLimitConfig};
use crate::error::RelayError;
use crate::net::connection::ConnectionId;
use crate::observability::metrics;

/// Longest event name kept for replies and logs.
const MAX_EVENT_NAME_CHARS: usize = 64;

/// Inbound event, as named by the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Register,
    Send,
    Other(String),
}

impl EventKind {
    pub fn from_event_name(name: &str) -> Self {
        match name {
            "register" => EventKind::Register,
            "send" | "send_message" => EventKind::Send,
            other => EventKind::Other(other.chars().take(MAX_EVENT_NAME_CHARS).collect()),
        }
    }

    fn bucket(&self) -> Bucket {
        match self {
            EventKind::Register => Bucket::Register,
            EventKind::Send => Bucket::Send,
            EventKind::Other(_) => Bucket::Other,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Register => "register",
            EventKind::Send => "send",
            EventKind::Other(name) => name,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Window a call is counted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Bucket {
    Register,
    Send,
    Other,
}

impl Bucket {
    fn as_str(self) -> &'static str {
        match self {
            Bucket::Register => "register",
            Bucket::Send => "send",
            Bucket::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    window_start: Instant,
    blocked_until: Option<Instant>,
}

impl RateWindow {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            blocked_until: None,
        }
    }
}

#[derive(Debug)]
struct ConnectionWindows {
    windows: HashMap<Bucket, RateWindow>,
    last_seen: Instant,
}

/// Fixed-window limiter keyed by connection and event.
pub struct RateLimiter {
    connections: DashMap<ConnectionId, ConnectionWindows>,
    config: ArcSwap<RateLimitConfig>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            connections: DashMap::new(),
            config: ArcSwap::from_pointee(config),
        }
    }

    /// Swap in new limits. Existing windows keep their counts.
    pub fn reload(&self, config: RateLimitConfig) {
        self.config.store(Arc::new(config));
    }

    pub fn config(&self) -> Arc<RateLimitConfig> {
        self.config.load_full()
    }

    /// Admit or refuse one call of `event` from `conn`.
    pub fn allow(&self, conn: ConnectionId, event: &EventKind) -> Result<(), RelayError> {
        self.allow_at(conn, event, Instant::now())
    }

    pub fn allow_at(&self, conn: ConnectionId, event: &EventKind, now: Instant) -> Result<(), RelayError> {
        let config = self.config.load();
        let bucket = event.bucket();
        let limit = limit_for(&config, bucket);
        let window_len = config.window();

        let mut entry = self
            .connections
            .entry(conn)
            .or_insert_with(|| ConnectionWindows {
                windows: HashMap::new(),
                last_seen: now,
            });
        entry.last_seen = now;

        let window = entry
            .windows
            .entry(bucket)
            .or_insert_with(|| RateWindow::new(now));

        if let Some(until) = window.blocked_until {
            if now < until {
                return Err(limited(conn, bucket, until - now));
            }
            *window = RateWindow::new(now);
        }

        if now.duration_since(window.window_start) > window_len {
            window.count = 0;
            window.window_start = now;
        }

        window.count += 1;
        if window.count > limit.max_per_window {
            let block = limit.block_duration();
            window.blocked_until = Some(now + block);
            tracing::warn!(
                connection_id = %conn,
                event = bucket.as_str(),
                count = window.count,
                block_secs = block.as_secs(),
                "Rate limit exceeded, sender blocked"
            );
            return Err(limited(conn, bucket, block));
        }

        Ok(())
    }

    /// Drop every window of a connection.
    pub fn forget(&self, conn: ConnectionId) {
        self.connections.remove(&conn);
    }

    /// Remove connections whose windows have not been touched within the idle period.
    pub fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(Instant::now())
    }

    pub fn sweep_idle_at(&self, now: Instant) -> usize {
        let idle = self.config.load().idle();
        let before = self.connections.len();
        self.connections
            .retain(|_, windows| now.duration_since(windows.last_seen) <= idle);
        let removed = before.saturating_sub(self.connections.len());
        if removed > 0 {
            tracing::debug!(removed, "Swept idle rate windows");
        }
        removed
    }

    /// Number of connections with at least one window.
    pub fn tracked_connections(&self) -> usize {
        self.connections.len()
    }

    /// Windows held for `conn`.
    pub fn window_count(&self, conn: ConnectionId) -> usize {
        self.connections.get(&conn).map_or(0, |entry| entry.windows.len())
    }

    pub fn clear(&self) {
        self.connections.clear();
    }
}

fn limit_for(config: &RateLimitConfig, bucket: Bucket) -> EventLimit {
    match bucket {
        Bucket::Register => config.register,
        Bucket::Send => config.send,
        Bucket::Other => config.default,
    }
}

fn limited(conn: ConnectionId, bucket: Bucket, retry_after: Duration) -> RelayError {
    tracing::debug!(connection_id = %conn, event = bucket.as_str(), "Call refused by rate limiter");
    metrics::record_rate_limited(bucket.as_str());
    RelayError::RateLimited {
        event: bucket.as_str().to_string(),
        retry_after,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig::default())
    }

    #[test]
    fn register_blocks_on_sixth_call_until_block_ends() {
        let limiter = limiter();
        let conn = ConnectionId::new();
        let start = Instant::now();

        for _ in 0..5 {
            assert!(limiter.allow_at(conn, &EventKind::Register, start).is_ok());
        }
        assert!(matches!(
            limiter.allow_at(conn, &EventKind::Register, start),
            Err(RelayError::RateLimited { .. })
        ));

        // Still blocked after the window itself would have rolled over.
        let mid = start + Duration::from_secs(59);
        assert!(limiter.allow_at(conn, &EventKind::Register, mid).is_err());

        let after = start + Duration::from_secs(60);
        for _ in 0..5 {
            assert!(limiter.allow_at(conn, &EventKind::Register, after).is_ok());
        }
        assert!(limiter.allow_at(conn, &EventKind::Register, after).is_err());
    }

    #[test]
    fn window_resets_after_sixty_seconds() {
        let limiter = limiter();
        let conn = ConnectionId::new();
        let start = Instant::now();

        for _ in 0..30 {
            assert!(limiter.allow_at(conn, &EventKind::Send, start).is_ok());
        }
        let next_window = start + Duration::from_secs(61);
        assert!(limiter.allow_at(conn, &EventKind::Send, next_window).is_ok());
    }

    #[test]
    fn events_and_connections_are_independent() {
        let limiter = limiter();
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        let now = Instant::now();

        for _ in 0..6 {
            let _ = limiter.allow_at(a, &EventKind::Register, now);
        }
        assert!(limiter.allow_at(a, &EventKind::Register, now).is_err());
        assert!(limiter.allow_at(a, &EventKind::Send, now).is_ok());
        assert!(limiter.allow_at(b, &EventKind::Register, now).is_ok());
    }

    #[test]
    fn send_block_lasts_two_minutes() {
        let limiter = limiter();
        let conn = ConnectionId::new();
        let start = Instant::now();

        for _ in 0..30 {
            limiter.allow_at(conn, &EventKind::Send, start).unwrap();
        }
        match limiter.allow_at(conn, &EventKind::Send, start) {
            Err(RelayError::RateLimited { retry_after, event }) => {
                assert_eq!(retry_after, Duration::from_secs(120));
                assert_eq!(event, "send");
            }
            other => panic!("expected rate limit, got {:?}", other),
        }
        assert!(limiter
            .allow_at(conn, &EventKind::Send, start + Duration::from_secs(119))
            .is_err());
        assert!(limiter
            .allow_at(conn, &EventKind::Send, start + Duration::from_secs(120))
            .is_ok());
    }

    #[test]
    fn unknown_events_share_default_limit() {
        let limiter = limiter();
        let conn = ConnectionId::new();
        let now = Instant::now();
        let ping = EventKind::from_event_name("ping");

        for _ in 0..60 {
            assert!(limiter.allow_at(conn, &ping, now).is_ok());
        }
        assert!(limiter.allow_at(conn, &ping, now).is_err());
    }

    #[test]
    fn distinct_unknown_names_share_one_window() {
        let limiter = limiter();
        let conn = ConnectionId::new();
        let now = Instant::now();

        let mut refused = 0;
        for i in 0..10_000 {
            let event = EventKind::from_event_name(&format!("made-up-{}", i));
            if limiter.allow_at(conn, &event, now).is_err() {
                refused += 1;
            }
        }
        assert_eq!(refused, 10_000 - 60);
        assert_eq!(limiter.window_count(conn), 1);

        // Protocol events keep their own windows.
        assert!(limiter.allow_at(conn, &EventKind::Send, now).is_ok());
        assert_eq!(limiter.window_count(conn), 2);
    }

    #[test]
    fn long_event_names_are_clipped() {
        let name = "x".repeat(100_000);
        match EventKind::from_event_name(&name) {
            EventKind::Other(kept) => assert_eq!(kept.chars().count(), MAX_EVENT_NAME_CHARS),
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn forget_and_sweep() {
        let limiter = limiter();
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        let start = Instant::now();

        limiter.allow_at(a, &EventKind::Send, start).unwrap();
        limiter.allow_at(b, &EventKind::Send, start + Duration::from_secs(3000)).unwrap();
        assert_eq!(limiter.tracked_connections(), 2);

        assert_eq!(limiter.sweep_idle_at(start + Duration::from_secs(3601)), 1);
        limiter.forget(b);
        assert_eq!(limiter.tracked_connections(), 0);
    }

    #[test]
    fn reload_changes_limits() {
        let limiter = limiter();
        let mut config = RateLimitConfig::default();
        config.register.max_per_window = 1;
        limiter.reload(config);

        let conn = ConnectionId::new();
        let now = Instant::now();
        assert!(limiter.allow_at(conn, &EventKind::Register, now).is_ok());
        assert!(limiter.allow_at(conn, &EventKind::Register, now).is_err());
    }
}
