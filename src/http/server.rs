//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router (`/ws`, `/status`)
//! - Wire up middleware (tracing, request ID, timeout, per-address limit, security headers)
//! - Apply configuration pushed by the watcher
//! - Run maintenance alongside the listener
//! - Drain sessions and clear relay state on shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{middleware, routing::get, Router};
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::admin::{self, StatusAccess};
use crate::config::RelayConfig;
use crate::http::request::{RequestIdSpan, UuidRequestId};
use crate::http::websocket::ws_handler;
use crate::hub::RelayHub;
use crate::lifecycle::{Maintenance, Shutdown};
use crate::security::{headers, http_limit};

/// How long sessions get to close after shutdown before state is cleared anyway.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<RelayHub>,
    pub status: Arc<StatusAccess>,
    pub shutdown: Shutdown,
}

/// HTTP server for the relay.
pub struct HttpServer {
    router: Router,
    config: RelayConfig,
    hub: Arc<RelayHub>,
    shutdown: Shutdown,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: RelayConfig, shutdown: Shutdown) -> Self {
        let hub = Arc::new(RelayHub::new(&config));
        let status = Arc::new(StatusAccess::new(
            config.status.name.clone(),
            config.status.access_token.clone(),
        ));

        let state = AppState {
            hub: hub.clone(),
            status,
            shutdown: shutdown.clone(),
        };

        let router = Self::build_router(state);
        Self {
            router,
            config,
            hub,
            shutdown,
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(state: AppState) -> Router {
        let hub = state.hub.clone();
        let app = Router::new()
            .route("/ws", get(ws_handler))
            .merge(admin::status_router())
            .with_state(state)
            .layer(middleware::from_fn_with_state(hub, http_limit::http_rate_limit));

        headers::apply(app)
            .layer(TimeoutLayer::new(Duration::from_secs(10)))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http().make_span_with(RequestIdSpan))
            .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
    }

    pub fn hub(&self) -> Arc<RelayHub> {
        self.hub.clone()
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Run the server on a plain TCP listener until shutdown.
    pub async fn run(
        self,
        listener: TcpListener,
        config_updates: mpsc::UnboundedReceiver<RelayConfig>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        self.spawn_background(config_updates);

        let app = self
            .router
            .clone()
            .into_make_service_with_connect_info::<SocketAddr>();
        let mut stop = self.shutdown.subscribe();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop.recv().await;
            })
            .await?;

        self.finish().await;
        Ok(())
    }

    /// Run the server with TLS until shutdown.
    pub async fn run_tls(
        self,
        addr: SocketAddr,
        tls: RustlsConfig,
        config_updates: mpsc::UnboundedReceiver<RelayConfig>,
    ) -> Result<(), std::io::Error> {
        tracing::info!(address = %addr, "HTTPS server starting");

        self.spawn_background(config_updates);

        let handle = axum_server::Handle::new();
        let mut stop = self.shutdown.subscribe();
        let stopper = handle.clone();
        tokio::spawn(async move {
            let _ = stop.recv().await;
            stopper.graceful_shutdown(Some(DRAIN_TIMEOUT));
        });

        let app = self
            .router
            .clone()
            .into_make_service_with_connect_info::<SocketAddr>();
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(app)
            .await?;

        self.finish().await;
        Ok(())
    }

    fn spawn_background(&self, mut config_updates: mpsc::UnboundedReceiver<RelayConfig>) {
        let hub = self.hub.clone();
        tokio::spawn(async move {
            while let Some(config) = config_updates.recv().await {
                hub.apply_reload(&config);
            }
        });

        let maintenance = Maintenance::new(self.hub.clone(), self.config.maintenance.clone());
        tokio::spawn(maintenance.run(self.shutdown.subscribe()));
    }

    async fn finish(&self) {
        if tokio::time::timeout(DRAIN_TIMEOUT, self.hub.sessions.wait_for_drain())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.hub.sessions.active_count(),
                "Sessions still open after drain timeout"
            );
        }
        self.hub.shutdown();
        tracing::info!("HTTP server stopped");
    }
}
