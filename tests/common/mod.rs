#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use studyguard_proxy::config::ProxyConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// In-process stand-in for the management backend
#[derive(Clone)]
pub struct MockBackend {
    pub addr: SocketAddr,
    blocked_sites: Arc<Mutex<Vec<String>>>,
    blocked_status: Arc<AtomicU16>,
    log_statuses: Arc<Mutex<VecDeque<u16>>>,
    log_attempts: Arc<AtomicUsize>,
    accepted_logs: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl MockBackend {
    pub async fn start(blocked: &[&str]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = Self {
            addr: listener.local_addr().unwrap(),
            blocked_sites: Arc::new(Mutex::new(blocked.iter().map(|s| s.to_string()).collect())),
            blocked_status: Arc::new(AtomicU16::new(200)),
            log_statuses: Arc::new(Mutex::new(VecDeque::new())),
            log_attempts: Arc::new(AtomicUsize::new(0)),
            accepted_logs: Arc::new(Mutex::new(Vec::new())),
        };

        let server = backend.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let server = server.clone();
                tokio::spawn(async move {
                    let _ = server.serve(socket).await;
                });
            }
        });
        backend
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_blocked_sites(&self, sites: &[&str]) {
        *self.blocked_sites.lock().unwrap() = sites.iter().map(|s| s.to_string()).collect();
    }

    /// Status returned by `GET /blocked-sites` from now on
    pub fn set_blocked_status(&self, status: u16) {
        self.blocked_status.store(status, Ordering::SeqCst);
    }

    /// Statuses for the next `POST /logs` calls, 200 once exhausted
    pub fn queue_log_statuses(&self, statuses: &[u16]) {
        self.log_statuses.lock().unwrap().extend(statuses.iter().copied());
    }

    pub fn log_attempts(&self) -> usize {
        self.log_attempts.load(Ordering::SeqCst)
    }

    pub fn accepted_logs(&self) -> Vec<serde_json::Value> {
        self.accepted_logs.lock().unwrap().clone()
    }

    /// Wait until an accepted log matches `domain` and `status`
    pub async fn wait_for_log(&self, domain: &str, status: &str) -> serde_json::Value {
        for _ in 0..300 {
            if let Some(entry) = self
                .accepted_logs()
                .into_iter()
                .find(|e| e["domain"] == domain && e["status"] == status)
            {
                return entry;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "no {status} log for {domain}; accepted: {:?}",
            self.accepted_logs()
        );
    }

    async fn serve(&self, mut socket: TcpStream) -> std::io::Result<()> {
        let (head, body) = read_request(&mut socket).await?;
        let request_line = head.lines().next().unwrap_or_default().to_string();

        let (status, response_body) = if request_line.starts_with("GET /blocked-sites") {
            let status = self.blocked_status.load(Ordering::SeqCst);
            let sites = self.blocked_sites.lock().unwrap().clone();
            (status, serde_json::to_string(&sites).unwrap())
        } else if request_line.starts_with("POST /logs") {
            self.log_attempts.fetch_add(1, Ordering::SeqCst);
            let status = self.log_statuses.lock().unwrap().pop_front().unwrap_or(200);
            if status == 200 {
                if let Ok(entry) = serde_json::from_slice(&body) {
                    self.accepted_logs.lock().unwrap().push(entry);
                }
            }
            (status, r#"{"message":"Log received"}"#.to_string())
        } else {
            (404, r#"{"detail":"Not Found"}"#.to_string())
        };

        let response = format!(
            "HTTP/1.1 {} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            response_body.len(),
            response_body
        );
        socket.write_all(response.as_bytes()).await?;
        socket.shutdown().await
    }
}

async fn read_request(socket: &mut TcpStream) -> std::io::Result<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut temp = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut temp).await?;
        if n == 0 {
            return Ok((String::from_utf8_lossy(&buf).to_string(), Vec::new()));
        }
        buf.extend_from_slice(&temp[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut temp).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&temp[..n]);
    }
    Ok((head, body))
}

/// Proxy settings pointing at `backend` with test-friendly timings
pub fn test_config(backend: &MockBackend) -> ProxyConfig {
    let mut config = ProxyConfig {
        port: 0,
        backend_url: backend.url(),
        refresh_interval: Duration::from_millis(100),
        connection_timeout: Duration::from_secs(5),
        backend_timeout: Duration::from_secs(2),
        ..ProxyConfig::default()
    };
    config.dispatcher.retry_backoff = Duration::from_millis(20);
    config.dispatcher.dequeue_timeout = Duration::from_millis(50);
    config
}

/// Origin server answering every connection with `response`; counts accepts
pub async fn spawn_origin(response: &'static [u8]) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let _ = read_request(&mut socket).await;
                let _ = socket.write_all(response).await;
            });
        }
    });
    (addr, accepted)
}
