//! Per-connection handling
//!
//! One accepted client connection goes through: read the request head,
//! classify it, check the blocklist, record the decision, then either reject,
//! tunnel (CONNECT) or relay a single HTTP exchange. Every failure simply
//! closes the connection; the client never sees a 5xx from the proxy.

use crate::blocklist::BlocklistCache;
use crate::dispatch::LogDispatcher;
use crate::models::ConnectionOutcome;
use crate::proxy::relay::{relay_http, tunnel, write_with_timeout};
use crate::proxy::request::{
    bytes_after_head, parse_request, read_request_head, rewrite_request_head, ProxyRequest,
    REQUEST_BUFFER_BYTES,
};
use anyhow::{anyhow, Context};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;

pub const CONNECT_ESTABLISHED_RESPONSE: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
pub const CONNECT_BLOCKED_RESPONSE: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\nBlocked by proxy";
pub const HTTP_BLOCKED_RESPONSE: &[u8] =
    b"HTTP/1.1 403 Forbidden\r\nContent-Type: text/html\r\n\r\n<h1>Blocked by proxy</h1>";

/// Shared state every connection handler needs
#[derive(Clone)]
pub struct HandlerContext {
    pub blocklist: Arc<BlocklistCache>,
    pub dispatcher: Arc<LogDispatcher>,
    /// Applied to the request read, the upstream connect, and every relay read/write
    pub timeout: Duration,
}

/// Handle one client connection from first byte to close
pub async fn handle_connection<S>(mut client: S, ctx: &HandlerContext) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let head = read_request_head(&mut client, REQUEST_BUFFER_BYTES, ctx.timeout)
        .await
        .context("reading request head")?;

    // Garbage or incomplete requests are dropped without an outcome
    let request = match parse_request(&head) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!("Dropping unparseable request: {}", e);
            return Ok(());
        }
    };

    if ctx.blocklist.is_blocked(&request.host) {
        ctx.dispatcher
            .enqueue(ConnectionOutcome::blocked(request.host.as_str()));
        reject(&mut client, &request, ctx.timeout).await;
        return Ok(());
    }

    ctx.dispatcher
        .enqueue(ConnectionOutcome::allowed(request.host.as_str()));

    // A failed connect just closes the client; the ALLOWED outcome stands
    let mut upstream = connect_upstream(&request, ctx.timeout).await?;

    if request.is_connect() {
        tracing::info!("[ALLOWED HTTPS] {}", request.authority());
        write_with_timeout(&mut client, CONNECT_ESTABLISHED_RESPONSE, ctx.timeout)
            .await
            .context("confirming tunnel to client")?;

        // Tunnel bytes that arrived together with the CONNECT head
        let early = bytes_after_head(&head);
        if !early.is_empty() {
            write_with_timeout(&mut upstream, early, ctx.timeout)
                .await
                .context("forwarding early tunnel data")?;
        }
        tunnel(client, upstream, ctx.timeout).await?;
    } else {
        tracing::info!(
            "[ALLOWED HTTP] {} {}{}",
            request.method,
            request.authority(),
            request.path
        );
        let forwarded = rewrite_request_head(&head, &request);
        let bytes = relay_http(client, upstream, &forwarded, ctx.timeout)
            .await
            .with_context(|| format!("relaying response from {}", request.authority()))?;
        tracing::debug!("Relayed {} response bytes from {}", bytes, request.authority());
    }

    Ok(())
}

/// Write the 403 for a blocked target and close
async fn reject<S>(client: &mut S, request: &ProxyRequest, timeout: Duration)
where
    S: AsyncWrite + Unpin,
{
    let response = if request.is_connect() {
        tracing::info!("[BLOCKED HTTPS] {}", request.host);
        CONNECT_BLOCKED_RESPONSE
    } else {
        tracing::info!("[BLOCKED HTTP] {}", request.host);
        HTTP_BLOCKED_RESPONSE
    };

    // The client may already be gone; nothing else to do either way
    if let Err(e) = write_with_timeout(client, response, timeout).await {
        tracing::debug!("Failed to send block response: {}", e);
    }
    let _ = client.shutdown().await;
}

async fn connect_upstream(request: &ProxyRequest, timeout: Duration) -> anyhow::Result<TcpStream> {
    let stream = time::timeout(
        timeout,
        TcpStream::connect((request.host.as_str(), request.port)),
    )
    .await
    .map_err(|_| anyhow!("timed out connecting to upstream {}", request.authority()))?
    .with_context(|| format!("connecting to upstream {}", request.authority()))?;

    let _ = stream.set_nodelay(true);
    Ok(stream)
}
