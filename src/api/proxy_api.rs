//! Proxy API
//!
//! Entry points for embedding the proxy: logging setup, startup, status and
//! shutdown.

use crate::blocklist::BlocklistCache;
use crate::config::ProxyConfig;
use crate::dispatch::{DispatcherStats, HttpLogSink, LogDispatcher, OutcomeSink};
use crate::proxy::{ConnectionCounters, HandlerContext, ProxyServer};
use anyhow::Context;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Get the version of the proxy library
pub fn get_version() -> String {
    crate::VERSION.to_string()
}

/// Initialize tracing/logging.
///
/// Logs go to a daily rolling file under `log_dir` when given, otherwise to
/// stderr. Calling this more than once is harmless.
pub fn init_logging(log_dir: Option<&Path>) -> anyhow::Result<()> {
    let level = resolve_log_level();

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let file_appender = tracing_appender::rolling::daily(dir, "studyguard_proxy");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            // Logging lasts until process exit
            std::mem::forget(guard);

            let _ = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(non_blocking)
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }

    tracing::info!("StudyGuard proxy v{} initialized", get_version());
    Ok(())
}

fn resolve_log_level() -> tracing::level_filters::LevelFilter {
    use tracing::level_filters::LevelFilter;

    match std::env::var("RUST_LOG") {
        Ok(val) => match val.to_lowercase().as_str() {
            "trace" => LevelFilter::TRACE,
            "debug" => LevelFilter::DEBUG,
            "info" => LevelFilter::INFO,
            "warn" | "warning" => LevelFilter::WARN,
            "error" => LevelFilter::ERROR,
            _ => LevelFilter::INFO,
        },
        Err(_) => LevelFilter::INFO,
    }
}

/// Proxy status information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyStatus {
    /// Whether the listener is still accepting
    pub is_running: bool,
    pub bind_address: String,
    /// Port actually bound
    pub port: u16,
    /// Connections currently being handled
    pub active_connections: u64,
    /// Connections accepted since start
    pub total_connections: u64,
    /// Entries in the current blocklist snapshot
    pub blocked_domains: usize,
    pub logs_pending: usize,
    pub logs_delivered: u64,
    pub logs_dropped: u64,
}

/// A running proxy and its background tasks
pub struct ProxyHandle {
    local_addr: SocketAddr,
    blocklist: Arc<BlocklistCache>,
    dispatcher: Arc<LogDispatcher>,
    counters: Arc<ConnectionCounters>,
    shutdown_tx: watch::Sender<bool>,
    server_task: JoinHandle<anyhow::Result<()>>,
    background: Vec<JoinHandle<()>>,
}

impl ProxyHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn blocklist(&self) -> Arc<BlocklistCache> {
        self.blocklist.clone()
    }

    pub fn dispatcher_stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    pub fn status(&self) -> ProxyStatus {
        let stats = self.dispatcher.stats();
        ProxyStatus {
            is_running: !self.server_task.is_finished(),
            bind_address: self.local_addr.ip().to_string(),
            port: self.local_addr.port(),
            active_connections: self.counters.active(),
            total_connections: self.counters.total(),
            blocked_domains: self.blocklist.get().len(),
            logs_pending: stats.pending,
            logs_delivered: stats.delivered,
            logs_dropped: stats.dropped,
        }
    }

    /// Stop accepting, stop the refresh loop and the log consumer.
    ///
    /// Connections already being relayed run to completion on their own.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        tracing::info!("Proxy shutting down...");
        let _ = self.shutdown_tx.send(true);

        let result = self
            .server_task
            .await
            .context("proxy server task panicked")?;
        for task in self.background {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }
        result
    }
}

/// Start the proxy, reporting outcomes to the backend's `/logs` endpoint
pub async fn start_proxy(config: ProxyConfig) -> anyhow::Result<ProxyHandle> {
    let sink = HttpLogSink::new(config.logs_url(), config.backend_timeout)
        .context("building log client")?;
    start_proxy_with_sink(config, Arc::new(sink)).await
}

/// Start the proxy with a custom outcome sink.
///
/// The initial blocklist is fetched, then the refresh loop and the log
/// consumer are started, all before the first connection is accepted.
pub async fn start_proxy_with_sink(
    config: ProxyConfig,
    sink: Arc<dyn OutcomeSink>,
) -> anyhow::Result<ProxyHandle> {
    let blocklist = Arc::new(
        BlocklistCache::new(
            config.blocked_sites_url(),
            config.match_policy,
            config.backend_timeout,
        )
        .context("building blocklist client")?,
    );
    let dispatcher = Arc::new(LogDispatcher::new(config.dispatcher.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ctx = HandlerContext {
        blocklist: blocklist.clone(),
        dispatcher: dispatcher.clone(),
        timeout: config.connection_timeout,
    };
    let server = ProxyServer::bind(
        &config.listen_addr(),
        config.max_connections,
        ctx,
        shutdown_rx.clone(),
    )
    .await
    .with_context(|| format!("binding proxy listener on {}", config.listen_addr()))?;
    let local_addr = server.local_addr()?;
    let counters = server.counters();

    tracing::info!(
        "Starting proxy on {} (backend {}, match policy {}, pool {})",
        local_addr,
        config.backend_url,
        config.match_policy,
        config.max_connections
    );

    blocklist.refresh_and_report().await;
    let refresh_task = blocklist.spawn_refresh_loop(config.refresh_interval, shutdown_rx.clone());
    let consumer_task = dispatcher.spawn_consumer(sink, shutdown_rx);
    let server_task = tokio::spawn(server.run());

    Ok(ProxyHandle {
        local_addr,
        blocklist,
        dispatcher,
        counters,
        shutdown_tx,
        server_task,
        background: vec![refresh_task, consumer_task],
    })
}
