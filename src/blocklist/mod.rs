//! Blocklist cache
//!
//! Holds the latest snapshot of blocked domains behind an atomically swapped
//! pointer. Connection handlers read it without locking; a single background
//! task replaces it on every successful refresh from the management backend.

mod matcher;

pub use matcher::{BlockedDomainSet, MatchPolicy};

use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Failure fetching the blocklist from the backend
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("blocklist request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("blocklist endpoint returned HTTP {0}")]
    Status(u16),

    #[error("blocklist body is not a JSON array of strings: {0}")]
    Decode(#[from] serde_json::Error),
}

pub struct BlocklistCache {
    snapshot: ArcSwap<BlockedDomainSet>,
    policy: MatchPolicy,
    client: reqwest::Client,
    source_url: String,
    generation: AtomicU64,
}

impl BlocklistCache {
    /// Create a cache with an empty snapshot that fetches from `source_url`
    pub fn new(
        source_url: impl Into<String>,
        policy: MatchPolicy,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        // The proxy must never route its own backend traffic through itself
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()?;

        Ok(Self {
            snapshot: ArcSwap::from_pointee(BlockedDomainSet::empty()),
            policy,
            client,
            source_url: source_url.into(),
            generation: AtomicU64::new(0),
        })
    }

    /// Latest published snapshot
    pub fn get(&self) -> Arc<BlockedDomainSet> {
        self.snapshot.load_full()
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// Number of snapshots published so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether `host` is blocked under the current snapshot
    pub fn is_blocked(&self, host: &str) -> bool {
        self.snapshot.load().matches(host, self.policy)
    }

    /// Replace the current snapshot
    pub fn publish(&self, set: BlockedDomainSet) {
        self.snapshot.store(Arc::new(set));
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Fetch the full list from the backend and publish it.
    ///
    /// On failure the previous snapshot stays in place.
    pub async fn refresh(&self) -> Result<usize, FetchError> {
        let response = self.client.get(&self.source_url).send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        let entries: Vec<String> = serde_json::from_slice(&body)?;
        let set = BlockedDomainSet::from_entries(entries);
        let count = set.len();
        self.publish(set);
        Ok(count)
    }

    /// Refresh every `interval` until `shutdown_rx` flips to true.
    ///
    /// The first refresh happens one interval after the call; callers fetch the
    /// initial snapshot themselves.
    pub fn spawn_refresh_loop(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.refresh_and_report().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Blocklist refresh loop stopped");
        })
    }

    /// Refresh and log the result instead of returning it
    pub async fn refresh_and_report(&self) {
        match self.refresh().await {
            Ok(count) => {
                tracing::info!("Fetched {} blocked sites from {}", count, self.source_url);
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to fetch blocked sites, keeping previous snapshot of {}: {}",
                    self.get().len(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `responses` in order, one per accepted connection
    async fn spawn_backend(responses: Vec<(u16, &'static str)>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = vec![0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        addr
    }

    fn cache_for(addr: SocketAddr) -> BlocklistCache {
        BlocklistCache::new(
            format!("http://{}/blocked-sites", addr),
            MatchPolicy::Substring,
            Duration::from_secs(2),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn refresh_publishes_fetched_list() {
        let addr = spawn_backend(vec![(200, r#"["bet365.com","tiktok.com"]"#)]).await;
        let cache = cache_for(addr);
        assert!(!cache.is_blocked("bet365.com"));

        let count = cache.refresh().await.unwrap();

        assert_eq!(count, 2);
        assert_eq!(cache.generation(), 1);
        assert!(cache.is_blocked("bet365.com"));
        assert!(cache.is_blocked("mybet365.com"));
        assert!(!cache.is_blocked("example.com"));
    }

    #[tokio::test]
    async fn non_200_keeps_previous_snapshot() {
        let addr = spawn_backend(vec![(500, r#"{"detail":"boom"}"#)]).await;
        let cache = cache_for(addr);
        cache.publish(BlockedDomainSet::from_entries(["bet365.com"]));

        let err = cache.refresh().await.unwrap_err();

        assert!(matches!(err, FetchError::Status(500)));
        assert!(cache.is_blocked("bet365.com"));
        assert_eq!(cache.generation(), 1);
    }

    #[tokio::test]
    async fn malformed_body_keeps_previous_snapshot() {
        let addr = spawn_backend(vec![(200, r#"{"sites":[]}"#)]).await;
        let cache = cache_for(addr);
        cache.publish(BlockedDomainSet::from_entries(["bet365.com"]));

        let err = cache.refresh().await.unwrap_err();

        assert!(matches!(err, FetchError::Decode(_)));
        assert!(cache.is_blocked("bet365.com"));
    }

    #[tokio::test]
    async fn unreachable_backend_keeps_previous_snapshot() {
        // Bind then drop to get a port nothing listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let cache = cache_for(addr);
        cache.publish(BlockedDomainSet::from_entries(["bet365.com"]));

        assert!(matches!(
            cache.refresh().await,
            Err(FetchError::Transport(_))
        ));
        assert!(cache.is_blocked("bet365.com"));
        assert!(!cache.is_blocked("example.com"));
    }

    #[tokio::test]
    async fn refresh_loop_picks_up_new_list() {
        let addr = spawn_backend(vec![(200, r#"["reddit.com"]"#)]).await;
        let cache = Arc::new(cache_for(addr));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = cache.spawn_refresh_loop(Duration::from_millis(50), shutdown_rx);
        for _ in 0..100 {
            if cache.is_blocked("reddit.com") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cache.is_blocked("reddit.com"));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn readers_never_observe_mixed_snapshots() {
        let cache = Arc::new(
            BlocklistCache::new(
                "http://127.0.0.1:9/blocked-sites",
                MatchPolicy::Substring,
                Duration::from_secs(1),
            )
            .unwrap(),
        );
        cache.publish(BlockedDomainSet::from_entries(
            (0..32).map(|i| format!("gen0-site{i}.com")),
        ));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        let snapshot = cache.get();
                        let prefixes: std::collections::HashSet<_> = snapshot
                            .iter()
                            .map(|d| d.split('-').next().unwrap_or_default().to_string())
                            .collect();
                        assert_eq!(prefixes.len(), 1);
                        assert_eq!(snapshot.len(), 32);
                    }
                })
            })
            .collect();

        for generation in 1..200 {
            cache.publish(BlockedDomainSet::from_entries(
                (0..32).map(|i| format!("gen{generation}-site{i}.com")),
            ));
        }

        for reader in readers {
            reader.join().unwrap();
        }
    }
}
