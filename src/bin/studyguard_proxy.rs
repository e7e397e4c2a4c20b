//! StudyGuard proxy server binary.
//!
//! All settings come from the environment; see `--help`.
//!
//! Usage:
//! ```text
//! STUDYGUARD_PORT=8080 STUDYGUARD_BACKEND_URL=http://127.0.0.1:8000 cargo run --bin studyguard_proxy
//! ```

use studyguard_proxy::api::{init_logging, start_proxy};
use studyguard_proxy::config::{self, ProxyConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if help_requested() {
        print_help();
        return Ok(());
    }

    let config = ProxyConfig::from_env()?;
    init_logging(config.log_dir.as_deref())?;

    let handle = start_proxy(config).await?;
    tracing::info!("Dynamic proxy running on {}", handle.local_addr());

    tokio::signal::ctrl_c().await?;
    handle.shutdown().await
}

fn help_requested() -> bool {
    let mut help = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => help = true,
            _ => eprintln!("Unknown argument: {arg} (configuration is read from the environment)"),
        }
    }
    help
}

fn print_help() {
    let defaults = ProxyConfig::default();
    eprintln!("StudyGuard Proxy v{}", studyguard_proxy::VERSION);
    eprintln!();
    eprintln!("Usage: studyguard_proxy");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  {:<36} listen host (default: {})", config::ENV_HOST, defaults.bind_address);
    eprintln!("  {:<36} listen port (default: {})", config::ENV_PORT, defaults.port);
    eprintln!("  {:<36} backend base URL (default: {})", config::ENV_BACKEND_URL, defaults.backend_url);
    eprintln!(
        "  {:<36} blocklist refresh seconds (default: {})",
        config::ENV_REFRESH_INTERVAL_SECS,
        defaults.refresh_interval.as_secs()
    );
    eprintln!(
        "  {:<36} concurrent connections (default: {})",
        config::ENV_MAX_CONNECTIONS,
        defaults.max_connections
    );
    eprintln!(
        "  {:<36} per-connection timeout seconds (default: {})",
        config::ENV_CONNECTION_TIMEOUT_SECS,
        defaults.connection_timeout.as_secs()
    );
    eprintln!(
        "  {:<36} substring | suffix (default: {})",
        config::ENV_MATCH_POLICY,
        defaults.match_policy
    );
    eprintln!(
        "  {:<36} backend request timeout seconds (default: {})",
        config::ENV_BACKEND_TIMEOUT_SECS,
        defaults.backend_timeout.as_secs()
    );
    eprintln!(
        "  {:<36} log queue capacity (default: {})",
        config::ENV_LOG_QUEUE_CAPACITY,
        defaults.dispatcher.capacity
    );
    eprintln!(
        "  {:<36} drop-oldest | drop-newest (default: {})",
        config::ENV_LOG_OVERFLOW,
        defaults.dispatcher.overflow
    );
    eprintln!(
        "  {:<36} log retry backoff ms (default: {})",
        config::ENV_LOG_RETRY_BACKOFF_MS,
        defaults.dispatcher.retry_backoff.as_millis()
    );
    eprintln!("  {:<36} directory for rolling log files (default: stderr)", config::ENV_LOG_DIR);
    eprintln!("  {:<36} trace | debug | info | warn | error (default: info)", "RUST_LOG");
}
