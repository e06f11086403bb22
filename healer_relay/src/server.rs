//! Relay server: listeners plus the two periodic drivers.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use healer_env::{HealerContext, TokioContext};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::RelayConfig;
use crate::handler::handle_connection;
use crate::http::{create_router, HttpState};
use crate::hub::RelayHub;
use crate::rate_limit::RateLimiter;

/// State shared by every connection task and driver.
pub struct RelayShared {
    pub config: RelayConfig,
    pub hub: Arc<RelayHub>,
    pub limiter: RateLimiter,
    pub context: Arc<TokioContext>,
}

/// A configured relay, ready to serve.
#[derive(Clone)]
pub struct RelayServer {
    shared: Arc<RelayShared>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let limiter = RateLimiter::new(config.rate_limit_per_sec);
        RelayServer {
            shared: Arc::new(RelayShared {
                config,
                hub: Arc::new(RelayHub::new()),
                limiter,
                context: TokioContext::shared(),
            }),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.shared.config
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.shared.hub
    }

    /// Health/metrics router.
    pub fn router(&self) -> axum::Router {
        create_router(HttpState {
            hub: Arc::clone(&self.shared.hub),
        })
    }

    /// Accepts WebSocket connections until `shutdown` flips to true.
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = listener.local_addr() {
            info!("WebSocket listening on {}", addr);
        }
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let shared = Arc::clone(&self.shared);
                        tokio::spawn(async move {
                            handle_connection(stream, addr, shared).await;
                        });
                    }
                    Err(e) => error!("Accept failed: {}", e),
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("WebSocket listener stopped");
    }

    /// Serves the health/metrics endpoints until `shutdown` flips to true.
    pub async fn serve_http(&self, listener: TcpListener, shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("HTTP server listening on {}", addr);
        }
        axum::serve(listener, self.router())
            .with_graceful_shutdown(wait_for(shutdown))
            .await
    }

    /// Starts the retry and cleanup drivers. Both stop when `shutdown` flips.
    pub fn spawn_drivers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let config = &self.shared.config;

        let retry = {
            let shared = Arc::clone(&self.shared);
            let timeout = config.ack_timeout_ms;
            periodic(config.retry_interval(), shutdown.clone(), move || {
                shared.hub.retry_tick(timeout, shared.context.now_ms());
            })
        };

        let cleanup = {
            let shared = Arc::clone(&self.shared);
            let ttl = config.delivered_ttl_ms;
            let bucket_idle = Duration::from_millis(config.bucket_idle_ms);
            periodic(config.cleanup_interval(), shutdown, move || {
                shared.hub.cleanup_tick(ttl, shared.context.now_ms());
                let pruned = shared.limiter.prune_idle(bucket_idle);
                if pruned > 0 {
                    debug!(pruned, "idle rate-limit buckets dropped");
                }
            })
        };

        vec![retry, cleanup]
    }

    /// Binds both listeners from the configuration.
    pub async fn bind(&self) -> std::io::Result<(TcpListener, TcpListener)> {
        let ws = TcpListener::bind(self.shared.config.listen_addr).await?;
        let http = TcpListener::bind(self.shared.config.http_addr).await?;
        Ok((ws, http))
    }

    /// Binds an ephemeral WebSocket port, serves it and starts the drivers.
    /// Returns the bound address and the shutdown switch.
    pub async fn start_ephemeral(&self) -> std::io::Result<(SocketAddr, watch::Sender<bool>)> {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        self.spawn_drivers(shutdown_rx.clone());
        let server = self.clone();
        tokio::spawn(async move { server.serve(listener, shutdown_rx).await });
        Ok((addr, shutdown_tx))
    }
}

fn periodic<F>(period: Duration, mut shutdown: watch::Receiver<bool>, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => tick(),
                _ = shutdown.changed() => break,
            }
        }
    })
}

fn wait_for(mut shutdown: watch::Receiver<bool>) -> impl Future<Output = ()> {
    async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
    }
}
