//! Healer Relay Server
//!
//! Authenticated WebSocket fan-out for the Healer protocol, with health and
//! metrics over HTTP.

use healer_relay::{RelayConfig, RelayError, RelayServer};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = match "healer_relay=info".parse::<Directive>() {
        Ok(directive) => EnvFilter::from_default_env().add_directive(directive),
        Err(_) => EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run().await {
        error!("Relay failed: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), RelayError> {
    // Refuse to start without the shared secret
    let config = RelayConfig::from_env()?;
    info!("Starting Healer Relay Server v{}", env!("CARGO_PKG_VERSION"));

    let server = RelayServer::new(config);
    let (ws_listener, http_listener) = server.bind().await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let drivers = server.spawn_drivers(shutdown_rx.clone());

    let http = {
        let server = server.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve_http(http_listener, shutdown).await {
                error!("HTTP server failed: {}", e);
            }
        })
    };

    let ws = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(ws_listener, shutdown_rx).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);

    for task in drivers.into_iter().chain([http, ws]) {
        let _ = task.await;
    }
    Ok(())
}
