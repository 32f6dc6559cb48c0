//! Non-owning reference to a live session.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::net::connection::ConnectionId;
use crate::payload::ClientKind;
use crate::protocol::ServerEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EmitError {
    #[error("session has gone away")]
    Closed,
    #[error("session outbound buffer is full")]
    Full,
}

/// A bound session as seen by the directory.
///
/// The session task owns the socket; the handle only holds the sending half
/// of its outbound queue, so emitting to a handle whose session ended fails.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    kind: ClientKind,
    connected_at: DateTime<Utc>,
    source: Option<IpAddr>,
    outbound: mpsc::Sender<ServerEvent>,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        kind: ClientKind,
        source: Option<IpAddr>,
        outbound: mpsc::Sender<ServerEvent>,
    ) -> Self {
        Self {
            id,
            kind,
            connected_at: Utc::now(),
            source,
            outbound,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn source(&self) -> Option<IpAddr> {
        self.source
    }

    /// Queue `event` for the session without waiting.
    pub fn emit(&self, event: ServerEvent) -> Result<(), EmitError> {
        self.outbound.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => EmitError::Closed,
            mpsc::error::TrySendError::Full(_) => EmitError::Full,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn emit_reports_closed_and_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new(ConnectionId::new(), ClientKind::Tv, None, tx);

        assert!(handle.emit(ServerEvent::Message(json!(1))).is_ok());
        assert_eq!(handle.emit(ServerEvent::Message(json!(2))), Err(EmitError::Full));
        assert_eq!(rx.try_recv().unwrap(), ServerEvent::Message(json!(1)));

        drop(rx);
        assert!(handle.is_closed());
        assert_eq!(handle.emit(ServerEvent::Message(json!(3))), Err(EmitError::Closed));
    }
}
