//! Relay hub server.
//!
//! Keeps a live directory of WebSocket clients by id and fans messages out
//! to every connection registered under the targeted ids.
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌──────────────────────────────────────────────────┐
//!                     │                    RELAY HUB                     │
//!                     │                                                  │
//!   WebSocket client  │  ┌──────────┐   ┌───────────┐   ┌─────────────┐  │
//!   ──────────────────┼─▶│ admission│──▶│  session  │──▶│   router    │  │
//!                     │  │ + limits │   │   loop    │   │  (fan-out)  │  │
//!                     │  └──────────┘   └───────────┘   └──────┬──────┘  │
//!                     │                                        │         │
//!                     │                                        ▼         │
//!   other clients     │                                 ┌─────────────┐  │
//!   ◀─────────────────┼─────────────────────────────────│  directory  │  │
//!                     │                                 │ + lock mgr  │  │
//!                     │                                 └─────────────┘  │
//!                     │  ┌────────────────────────────────────────────┐  │
//!                     │  │ config reload · maintenance · observability │  │
//!                     │  └────────────────────────────────────────────┘  │
//!                     └──────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use relay_hub::config::loader::load_config;
use relay_hub::config::watcher::ConfigWatcher;
use relay_hub::config::RelayConfig;
use relay_hub::lifecycle::signals::spawn_signal_listener;
use relay_hub::net::tls::load_tls_config;
use relay_hub::observability::{logging, metrics};
use relay_hub::{HttpServer, Shutdown};

#[derive(Parser)]
#[command(name = "relay-hub")]
#[command(about = "WebSocket client directory and message relay", long_about = None)]
struct Args {
    /// Path to the TOML configuration file. Defaults apply when absent.
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => RelayConfig::default(),
    };

    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "relay-hub starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        max_connections_per_ip = config.security.max_connections_per_ip,
        tls = config.listener.tls.is_some(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    // The watcher must stay alive for updates to flow.
    let (updates, _watcher) = match &args.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            match watcher.run() {
                Ok(watcher) => (updates, Some(watcher)),
                Err(e) => {
                    tracing::warn!(error = %e, "Config hot reload disabled");
                    (updates, None)
                }
            }
        }
        None => (mpsc::unbounded_channel().1, None),
    };

    let shutdown = Shutdown::new();
    spawn_signal_listener(shutdown.clone());

    let tls = config.listener.tls.clone();
    let bind_address = config.listener.bind_address.clone();
    let server = HttpServer::new(config, shutdown);

    match tls {
        Some(tls) => {
            let addr: SocketAddr = bind_address.parse()?;
            let rustls = load_tls_config(&tls).await?;
            server.run_tls(addr, rustls, updates).await?;
        }
        None => {
            let listener = TcpListener::bind(&bind_address).await?;
            server.run(listener, updates).await?;
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
