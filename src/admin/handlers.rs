use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RateLimitConfig;
use crate::directory::ConnectionStats;
use crate::http::server::AppState;

use super::auth::AccessLevel;

#[derive(Debug, Serialize)]
pub struct SystemInfo {
    pub name: String,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct ConnectionSummary {
    pub client_count: usize,
    pub total_connections: usize,
}

#[derive(Debug, Serialize)]
pub struct LimitsView {
    pub max_connections: usize,
    pub active_sessions: u64,
    pub max_connections_per_ip: usize,
    pub session_lifetime_secs: u64,
    pub max_payload_bytes: usize,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub system: SystemInfo,
    pub connections: ConnectionSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advanced_connections: Option<ConnectionStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<LimitsView>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    pub token: Option<String>,
}

pub async fn get_status(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<StatusQuery>,
) -> Json<StatusResponse> {
    let hub = &state.hub;
    let level = state.status.level(peer.ip(), &headers, query.token.as_deref());

    let mut response = StatusResponse {
        system: SystemInfo {
            name: state.status.name.clone(),
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: hub.uptime().as_secs(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        },
        connections: ConnectionSummary {
            client_count: hub.directory.count_clients(),
            total_connections: hub.directory.count_connections(),
        },
        advanced_connections: None,
        limits: None,
    };

    if level == AccessLevel::Detailed {
        let security = hub.admission.config();
        response.advanced_connections = Some(hub.directory.connection_stats());
        response.limits = Some(LimitsView {
            max_connections: hub.max_connections(),
            active_sessions: hub.sessions.active_count(),
            max_connections_per_ip: security.max_connections_per_ip,
            session_lifetime_secs: security.session_lifetime_secs,
            max_payload_bytes: security.max_payload_bytes,
            rate_limit: (*hub.limiter.config()).clone(),
        });
    }

    Json(response)
}
