//! Proxy listener
//!
//! Accepts client connections and runs each one in its own task, with at most
//! `max_connections` handlers alive at once. A pool permit is taken before
//! `accept`, so a saturated pool pauses acceptance and further clients wait in
//! the kernel backlog instead of being rejected.

use crate::proxy::handler::{handle_connection, HandlerContext};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::Instrument;
use uuid::Uuid;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Connection counters shared with the status API
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    active: AtomicU64,
    total: AtomicU64,
}

impl ConnectionCounters {
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Decrements the active count however the handler task ends
struct ActiveGuard(Arc<ConnectionCounters>);

impl ActiveGuard {
    fn new(counters: Arc<ConnectionCounters>) -> Self {
        counters.active.fetch_add(1, Ordering::Relaxed);
        counters.total.fetch_add(1, Ordering::Relaxed);
        Self(counters)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct ProxyServer {
    listener: TcpListener,
    ctx: HandlerContext,
    pool: Arc<Semaphore>,
    counters: Arc<ConnectionCounters>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the listening socket
    pub async fn bind(
        addr: &str,
        max_connections: usize,
        ctx: HandlerContext,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self {
            listener,
            ctx,
            pool: Arc::new(Semaphore::new(max_connections)),
            counters: Arc::new(ConnectionCounters::default()),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn counters(&self) -> Arc<ConnectionCounters> {
        self.counters.clone()
    }

    /// Accept connections until the shutdown signal
    pub async fn run(self) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        tracing::info!(
            "Proxy server listening on {}",
            self.local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unknown>".to_string())
        );

        loop {
            let permit = tokio::select! {
                permit = self.pool.clone().acquire_owned() => permit?,
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let accept_result = tokio::select! {
                accepted = self.listener.accept() => accepted,
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            };

            match accept_result {
                Ok((socket, peer_addr)) => {
                    tracing::debug!("Connection from {}", peer_addr);
                    let ctx = self.ctx.clone();
                    let guard = ActiveGuard::new(self.counters.clone());
                    let span = tracing::info_span!("conn", id = %Uuid::new_v4(), peer = %peer_addr);

                    tokio::spawn(
                        async move {
                            let _permit = permit;
                            let _guard = guard;
                            if let Err(e) = handle_connection(socket, &ctx).await {
                                log_connection_error(&e);
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    drop(permit);
                    pause_after_accept_error(&e).await;
                }
            }
        }

        tracing::info!("Proxy server stopped");
        Ok(())
    }
}

/// Back off before the next `accept` so a persistent error (out of file
/// descriptors, say) does not spin the loop
async fn pause_after_accept_error(e: &std::io::Error) {
    tracing::error!("Accept error: {}", e);
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

fn log_connection_error(e: &anyhow::Error) {
    // Peers vanishing mid-exchange is routine for a proxy
    let err_str = format!("{e:#}").to_lowercase();
    if err_str.contains("eof")
        || err_str.contains("broken pipe")
        || err_str.contains("connection reset")
        || err_str.contains("connection refused")
        || err_str.contains("timed out")
    {
        tracing::debug!("Connection closed: {:#}", e);
    } else {
        tracing::warn!("Error handling connection: {:#}", e);
    }
}
