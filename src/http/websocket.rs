//! WebSocket session handling.
//!
//! # Responsibilities
//! - Run admission control before completing the upgrade
//! - Own the socket for the lifetime of one session
//! - Dispatch inbound frames to the router, one at a time
//! - Close the session on client close, lifetime expiry or shutdown
//!
//! # Data Flow
//! ```text
//! socket ──read──→ frame → router (register / send / other) → ack ─┐
//!                                                                 ▼
//! other sessions' routes ──→ ConnectionHandle::emit ──→ outbound queue ──write──→ socket
//! ```
//!
//! # Design Decisions
//! - A single writer task drains the outbound queue; handles only hold senders
//! - Frames from one session are processed in order; sessions run in parallel
//! - Refusals happen before the upgrade, as plain HTTP statuses

use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};

use crate::net::connection::ConnectionGuard;
use crate::observability::metrics;
use crate::protocol::{InboundFrame, ServerEvent};
use crate::routing::SessionState;
use crate::security::rate_limit::EventKind;
use crate::security::AdmissionError;

use super::server::AppState;

/// Upgrade handler for `GET /ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ip = peer.ip().to_canonical();
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if let Err(e) = state.hub.admission.check(Some(ip), user_agent, &state.hub.ips) {
        return (e.status(), e.public_message()).into_response();
    }

    let max = state.hub.max_connections();
    let Some(guard) = state.hub.sessions.try_track(max) else {
        let e = AdmissionError::TotalLimit { max };
        tracing::warn!(ip = %ip, "Connection refused: {}", e);
        metrics::record_admission_rejected(e.reason());
        return (e.status(), e.public_message()).into_response();
    };

    let frame_limit = state.hub.admission.config().max_frame_bytes();
    ws.max_message_size(frame_limit)
        .max_frame_size(frame_limit)
        .on_upgrade(move |socket| run_session(socket, state, guard, Some(ip)))
}

async fn run_session(socket: WebSocket, state: AppState, guard: ConnectionGuard, source: Option<IpAddr>) {
    let conn = guard.id();
    let security = state.hub.admission.config();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(security.outbound_buffer.max(1));
    let (close_tx, mut close_rx) = oneshot::channel::<()>();

    tracing::info!(connection_id = %conn, ip = ?source, "Client connected");

    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    tracing::trace!(connection_id = %conn, event = event.name(), "Writing frame");
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!(connection_id = %conn, error = %e, "Failed to serialize event");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                _ = &mut close_rx => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let mut session = SessionState::new(conn, source, tx);
    let lifetime = tokio::time::sleep(security.session_lifetime());
    tokio::pin!(lifetime);
    let mut shutdown = state.shutdown.subscribe();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(&state, &mut session, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Binary(_))) => {
                    tracing::debug!(connection_id = %conn, "Ignoring binary frame");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(connection_id = %conn, error = %e, "WebSocket read failed");
                    break;
                }
            },
            _ = &mut lifetime => {
                tracing::info!(connection_id = %conn, "Session lifetime reached, disconnecting");
                break;
            }
            _ = shutdown.recv() => break,
        }
    }

    state.hub.disconnect(&session);
    drop(session);
    let _ = close_tx.send(());
    let _ = writer.await;
    drop(guard);
}

async fn handle_frame(state: &AppState, session: &mut SessionState, text: &str) {
    let router = &state.hub.router;

    let reply = match serde_json::from_str::<InboundFrame>(text) {
        Ok(frame) => match frame.kind() {
            EventKind::Register => ServerEvent::Registered(router.register(session, frame.data)),
            EventKind::Send => ServerEvent::MessageSent(router.send(session, frame.data).await),
            other => router.unknown_event(session, &other),
        },
        Err(e) => {
            tracing::debug!(connection_id = %session.id, error = %e, "Malformed frame");
            router.malformed_frame(session)
        }
    };

    if session.outbound.send(reply).await.is_err() {
        tracing::debug!(connection_id = %session.id, "Session closed before reply");
    }
}
