//! Event handling and message fan-out.
//!
//! # Responsibilities
//! - Turn `register` and `send` frames into directory and routing operations
//! - Deliver a payload to every handle of every resolved target
//! - Convert every failure into an acknowledgment for the sender
//!
//! # Design Decisions
//! - The rate check runs before the payload is sanitized or parsed
//! - Targets are processed in caller order, each under its own short lease
//! - Handles are snapshotted before emitting, so a concurrent unbind is harmless
//! - Unknown targets are skipped silently and never reported by name

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::{LockConfig, RoutingConfig};
use crate::coordination::{LockManager, ResourceKey};
use crate::directory::{ClientDirectory, ConnectionHandle, DirectoryError};
use crate::error::RelayError;
use crate::net::connection::ConnectionId;
use crate::observability::metrics;
use crate::payload::{check_integrity, sanitize, validate_message, validate_registration};
use crate::protocol::{MessageSentAck, RegisteredAck, ServerEvent};
use crate::security::rate_limit::{EventKind, RateLimiter};

use super::jitter::Jitter;

/// Per-session state the router needs to act on behalf of a connection.
#[derive(Debug)]
pub struct SessionState {
    pub id: ConnectionId,
    pub source: Option<IpAddr>,
    pub outbound: mpsc::Sender<ServerEvent>,
    /// Client id this session is currently bound under.
    pub bound: Option<String>,
}

impl SessionState {
    pub fn new(id: ConnectionId, source: Option<IpAddr>, outbound: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            id,
            source,
            outbound,
            bound: None,
        }
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteReport {
    /// Handles that accepted the payload.
    pub delivered: usize,
    pub targets_tried: usize,
    /// Targets with no binding.
    pub unknown: usize,
    /// Targets whose lease could not be taken.
    pub busy: usize,
}

pub struct MessageRouter {
    locks: Arc<LockManager>,
    directory: Arc<ClientDirectory>,
    limiter: Arc<RateLimiter>,
    lock_config: LockConfig,
    jitter: ArcSwap<Jitter>,
    max_payload_bytes: AtomicUsize,
}

impl MessageRouter {
    pub fn new(
        locks: Arc<LockManager>,
        directory: Arc<ClientDirectory>,
        limiter: Arc<RateLimiter>,
        lock_config: LockConfig,
        routing: &RoutingConfig,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            locks,
            directory,
            limiter,
            lock_config,
            jitter: ArcSwap::from_pointee(Jitter::from_config(routing)),
            max_payload_bytes: AtomicUsize::new(max_payload_bytes),
        }
    }

    pub fn reload(&self, routing: &RoutingConfig, max_payload_bytes: usize) {
        self.jitter.store(Arc::new(Jitter::from_config(routing)));
        self.max_payload_bytes.store(max_payload_bytes, Ordering::Relaxed);
    }

    pub fn jitter(&self) -> Jitter {
        **self.jitter.load()
    }

    /// Handle a `register` frame.
    pub fn register(&self, session: &mut SessionState, data: Value) -> RegisteredAck {
        if let Err(e) = self.limiter.allow(session.id, &EventKind::Register) {
            metrics::record_registration("rate_limited");
            return RegisteredAck::failed(e.client_message());
        }

        let data = sanitize(data);
        let registration = match validate_registration(&data) {
            Ok(registration) => registration,
            Err(e) => {
                tracing::warn!(connection_id = %session.id, error = %e, "Invalid registration");
                metrics::record_registration("invalid");
                return RegisteredAck::failed("Invalid registration data");
            }
        };

        if session.bound.as_deref() == Some(registration.id.as_str()) {
            metrics::record_registration("ok");
            return RegisteredAck::ok(format!("Registered as {}", registration.kind));
        }
        if let Some(previous) = session.bound.clone() {
            match self.directory.try_unbind(session.id) {
                Ok(_) => session.bound = None,
                Err(DirectoryError::Contended(resource)) => {
                    tracing::warn!(
                        connection_id = %session.id,
                        client_id = %previous,
                        "Re-registration aborted: previous binding is locked"
                    );
                    metrics::record_registration("contended");
                    return RegisteredAck::failed(RelayError::LockContention { resource }.client_message());
                }
                Err(DirectoryError::Malformed) => session.bound = None,
            }
        }

        let handle = ConnectionHandle::new(
            session.id,
            registration.kind,
            session.source,
            session.outbound.clone(),
        );
        match self.directory.bind(&registration.id, handle) {
            Ok(()) => {
                session.bound = Some(registration.id);
                metrics::record_registration("ok");
                RegisteredAck::ok(format!("Registered as {}", registration.kind))
            }
            Err(DirectoryError::Contended(resource)) => {
                metrics::record_registration("contended");
                RegisteredAck::failed(RelayError::LockContention { resource }.client_message())
            }
            Err(DirectoryError::Malformed) => {
                metrics::record_registration("invalid");
                RegisteredAck::failed("Invalid registration data")
            }
        }
    }

    /// Handle a `send` frame. The acknowledgment is returned after the jitter delay.
    pub async fn send(&self, session: &SessionState, data: Value) -> MessageSentAck {
        let ack = self.process_send(session.id, data);
        self.jitter().wait().await;
        ack
    }

    fn process_send(&self, conn: ConnectionId, data: Value) -> MessageSentAck {
        if let Err(e) = self.limiter.allow(conn, &EventKind::Send) {
            return MessageSentAck::failed(e.client_message());
        }

        let data = sanitize(data);
        let ceiling = self.max_payload_bytes.load(Ordering::Relaxed);
        let message = match validate_message(&data, ceiling) {
            Ok(message) => message,
            Err(e) => {
                let err = RelayError::from(e);
                tracing::warn!(connection_id = %conn, error = %err, "Rejected message");
                return MessageSentAck::failed(err.client_message());
            }
        };

        if let Err(e) = check_integrity(&message.typed, Utc::now()) {
            let err = RelayError::from(e);
            tracing::warn!(
                connection_id = %conn,
                kind = message.typed.kind().as_str(),
                error = %err,
                "Inconsistent message payload"
            );
            return MessageSentAck::failed(err.client_message());
        }

        let report = self.route(&message.targets, &message.payload);
        tracing::debug!(
            connection_id = %conn,
            kind = message.typed.kind().as_str(),
            targets = report.targets_tried,
            delivered = report.delivered,
            unknown = report.unknown,
            busy = report.busy,
            "Message routed"
        );
        metrics::record_message_routed(report.delivered);

        MessageSentAck {
            success: report.delivered > 0,
            targets: Some(message.targets),
            delivered: Some(report.delivered),
            timestamp: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            error: None,
        }
    }

    /// Deliver `payload` to every live handle of each target.
    pub fn route(&self, targets: &[String], payload: &Value) -> RouteReport {
        let mut report = RouteReport::default();

        for target in targets {
            report.targets_tried += 1;

            if !self.directory.contains(target) {
                tracing::debug!(target = %target, "Skipping unknown target");
                report.unknown += 1;
                continue;
            }

            let key = ResourceKey::client(target);
            let Some(_lease) = self.locks.try_acquire(&key, self.lock_config.route_timeout()) else {
                tracing::warn!(target = %target, "Delivery skipped: target is locked");
                report.busy += 1;
                continue;
            };

            for handle in self.directory.handles(target) {
                match handle.emit(ServerEvent::Message(payload.clone())) {
                    Ok(()) => report.delivered += 1,
                    Err(e) => tracing::debug!(
                        target = %target,
                        connection_id = %handle.id(),
                        error = %e,
                        "Emit failed"
                    ),
                }
            }
        }

        report
    }

    /// Answer a frame whose event name is not part of the protocol.
    pub fn unknown_event(&self, session: &SessionState, event: &EventKind) -> ServerEvent {
        let message = match self.limiter.allow(session.id, event) {
            Ok(()) => format!("Unknown event '{}'", event),
            Err(e) => e.client_message(),
        };
        ServerEvent::Error { message }
    }

    /// Answer a frame that is not a `{"event", "data"}` envelope.
    pub fn malformed_frame(&self, session: &SessionState) -> ServerEvent {
        let event = EventKind::Other("invalid_frame".to_string());
        let message = match self.limiter.allow(session.id, &event) {
            Ok(()) => "Malformed frame".to_string(),
            Err(e) => e.client_message(),
        };
        ServerEvent::Error { message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IpTrackingConfig, RateLimitConfig};
    use crate::security::ip_tracker::IpConnectionTracker;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        locks: Arc<LockManager>,
        directory: Arc<ClientDirectory>,
        router: MessageRouter,
    }

    fn fixture() -> Fixture {
        fixture_with(RoutingConfig {
            jitter_min_ms: 1,
            jitter_max_ms: 2,
        })
    }

    fn fixture_with(routing: RoutingConfig) -> Fixture {
        let locks = Arc::new(LockManager::new());
        let ips = Arc::new(IpConnectionTracker::new(
            locks.clone(),
            IpTrackingConfig::default(),
            LockConfig::default(),
        ));
        let directory = Arc::new(ClientDirectory::new(locks.clone(), ips, LockConfig::default()));
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default()));
        let router = MessageRouter::new(
            locks.clone(),
            directory.clone(),
            limiter,
            LockConfig::default(),
            &routing,
            1024 * 1024,
        );
        Fixture {
            locks,
            directory,
            router,
        }
    }

    fn session() -> (SessionState, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (SessionState::new(ConnectionId::new(), None, tx), rx)
    }

    #[tokio::test]
    async fn admin_receives_alert_from_panel() {
        let f = fixture();
        let (mut admin, mut admin_rx) = session();
        let (mut panel, _panel_rx) = session();

        assert!(f.router.register(&mut admin, json!({ "type": "tv", "id": "admin" })).success);
        assert!(f.router.register(&mut panel, json!({ "type": "panel", "id": "p1" })).success);

        let payload = json!({ "type": "alert", "level": "info", "message": "hello" });
        let ack = f
            .router
            .send(&panel, json!({ "target": "admin", "payload": payload.clone() }))
            .await;

        assert!(ack.success);
        assert_eq!(ack.delivered, Some(1));
        assert_eq!(ack.targets, Some(vec!["admin".to_string()]));
        assert!(ack.timestamp.is_some());
        assert_eq!(admin_rx.try_recv().unwrap(), ServerEvent::Message(payload));
    }

    #[tokio::test]
    async fn every_handle_of_a_target_receives() {
        let f = fixture();
        let (mut tab1, mut rx1) = session();
        let (mut tab2, mut rx2) = session();
        let (sender, _rx) = session();
        f.router.register(&mut tab1, json!({ "type": "tv", "id": "lobby" }));
        f.router.register(&mut tab2, json!({ "type": "tv", "id": "lobby" }));

        let ack = f
            .router
            .send(&sender, json!({ "target": ["lobby", "ghost"], "payload": { "type": "update" } }))
            .await;

        assert_eq!(ack.delivered, Some(2));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unknown_target_is_not_an_error() {
        let f = fixture();
        let (sender, _rx) = session();
        let ack = f
            .router
            .send(&sender, json!({ "target": "nobody", "payload": { "type": "update" } }))
            .await;
        assert!(!ack.success);
        assert_eq!(ack.delivered, Some(0));
        assert!(ack.error.is_none());
    }

    #[tokio::test]
    async fn twenty_one_targets_never_route() {
        let f = fixture();
        let (mut tv, mut tv_rx) = session();
        let (sender, _rx) = session();
        f.router.register(&mut tv, json!({ "type": "tv", "id": "t0" }));

        let targets: Vec<String> = (0..21).map(|i| format!("t{}", i)).collect();
        let ack = f
            .router
            .send(&sender, json!({ "target": targets, "payload": { "type": "update" } }))
            .await;

        assert!(!ack.success);
        assert!(ack.error.is_some());
        assert!(tv_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn locked_target_is_skipped() {
        let f = fixture();
        let (mut tv, mut tv_rx) = session();
        let (sender, _rx) = session();
        f.router.register(&mut tv, json!({ "type": "tv", "id": "busy" }));

        let _held = f
            .locks
            .try_acquire(&ResourceKey::client("busy"), Duration::from_secs(5))
            .unwrap();
        let report = f.router.route(&["busy".to_string()], &json!({ "type": "update" }));
        assert_eq!(report.busy, 1);
        assert_eq!(report.delivered, 0);
        assert!(tv_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sixth_registration_is_rate_limited() {
        let f = fixture();
        let (mut s, _rx) = session();
        for i in 0..5 {
            let ack = f.router.register(&mut s, json!({ "type": "tv", "id": format!("r{}", i) }));
            assert!(ack.success);
        }
        let ack = f.router.register(&mut s, json!({ "type": "tv", "id": "r5" }));
        assert!(!ack.success);
        assert_eq!(ack.message, "Too many requests. Try again later.");
        // Re-registering moved the session; only the last id is bound.
        assert_eq!(f.directory.count_connections(), 1);
        assert!(f.directory.contains("r4"));
    }

    #[tokio::test]
    async fn invalid_registration_and_integrity_failures_are_acknowledged() {
        let f = fixture();
        let (mut s, _rx) = session();
        let ack = f.router.register(&mut s, json!({ "type": "fridge", "id": "x" }));
        assert!(!ack.success);
        assert_eq!(ack.message, "Invalid registration data");

        let ack = f
            .router
            .send(
                &s,
                json!({ "target": "x", "payload": { "type": "alert", "level": "critical", "message": "fire" } }),
            )
            .await;
        assert!(!ack.success);
        assert!(ack.error.unwrap().starts_with("Invalid data"));
    }

    #[test]
    fn payload_is_sanitized_before_delivery() {
        let f = fixture();
        let (mut tv, mut tv_rx) = session();
        f.router.register(&mut tv, json!({ "type": "tv", "id": "tv" }));

        let ack = f.router.process_send(
            ConnectionId::new(),
            json!({ "target": "tv", "payload": { "type": "notification", "title": "  <b>hi</b> " } }),
        );
        assert_eq!(ack.delivered, Some(1));
        match tv_rx.try_recv().unwrap() {
            ServerEvent::Message(payload) => {
                assert_eq!(payload["title"], "&lt;b&gt;hi&lt;&#x2F;b&gt;");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn re_registration_keeps_old_binding_when_it_is_locked() {
        let f = fixture();
        let (mut s, _rx) = session();
        assert!(f.router.register(&mut s, json!({ "type": "tv", "id": "old" })).success);

        let _held = f
            .locks
            .try_acquire(&ResourceKey::client("old"), Duration::from_secs(5))
            .unwrap();
        let ack = f.router.register(&mut s, json!({ "type": "tv", "id": "new" }));

        assert!(!ack.success);
        assert_eq!(ack.message, "Resource temporarily unavailable. Try again.");
        assert_eq!(s.bound.as_deref(), Some("old"));
        assert!(f.directory.contains("old"));
        assert!(!f.directory.contains("new"));
    }

    #[tokio::test]
    async fn rejected_sends_still_wait_out_the_jitter() {
        let f = fixture_with(RoutingConfig {
            jitter_min_ms: 30,
            jitter_max_ms: 30,
        });
        let (sender, _rx) = session();

        let started = std::time::Instant::now();
        let ack = f
            .router
            .send(&sender, json!({ "target": "tv", "payload": { "type": "unknown" } }))
            .await;
        assert!(!ack.success);
        assert!(ack.error.is_some());
        assert!(started.elapsed() >= Duration::from_millis(30));

        for _ in 0..29 {
            f.router
                .process_send(sender.id, json!({ "target": "nobody", "payload": { "type": "update" } }));
        }
        let started = std::time::Instant::now();
        let ack = f
            .router
            .send(&sender, json!({ "target": "nobody", "payload": { "type": "update" } }))
            .await;
        assert_eq!(ack.error.as_deref(), Some("Too many requests. Try again later."));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
