//! Inbound proxy request parsing
//!
//! Only the request line (and, for origin-form targets, the `Host` header) is
//! interpreted. Everything else is forwarded as the client sent it.

use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{self, Instant};

/// Bytes read from the client before a decision is made
pub const REQUEST_BUFFER_BYTES: usize = 8 * 1024;

const MAX_HEADER_COUNT: usize = 128;
const HTTPS_DEFAULT_PORT: u16 = 443;
const HTTP_DEFAULT_PORT: u16 = 80;

/// Hop-by-hop headers replaced by `Connection: close` when forwarding
const CONNECTION_HEADERS: [&str; 3] = ["connection", "proxy-connection", "keep-alive"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("client sent no data")]
    Empty,

    #[error("malformed request line {0:?}")]
    MalformedRequestLine(String),

    #[error("invalid port in target {0:?}")]
    InvalidPort(String),

    #[error("request has no target host")]
    MissingHost,
}

/// Target of one proxied connection, taken from the first request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub method: String,
    /// Request target exactly as sent
    pub target: String,
    /// Lowercased host, without IPv6 brackets
    pub host: String,
    pub port: u16,
    /// Origin-form path for plain HTTP; empty for CONNECT
    pub path: String,
    pub version: String,
}

impl ProxyRequest {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Read until the end of the header block, EOF, `limit` bytes, or `timeout`.
///
/// A timeout is not an error: whatever arrived so far is returned and left to
/// the parser.
pub async fn read_request_head<S>(
    stream: &mut S,
    limit: usize,
    timeout: Duration,
) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + timeout;
    let mut buffer = Vec::with_capacity(2048);
    let mut temp = [0u8; 4096];

    while buffer.len() < limit {
        let want = (limit - buffer.len()).min(temp.len());
        let bytes_read = match time::timeout_at(deadline, stream.read(&mut temp[..want])).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::debug!("Timed out waiting for request head ({} bytes so far)", buffer.len());
                break;
            }
        };
        if bytes_read == 0 {
            break;
        }
        buffer.extend_from_slice(&temp[..bytes_read]);

        if head_end(&buffer).is_some() {
            break;
        }
    }

    Ok(buffer)
}

/// Offset just past the blank line ending the header block.
///
/// Bare-LF line endings are accepted as well as CRLF.
pub fn head_end(buf: &[u8]) -> Option<usize> {
    let crlf = find_subslice(buf, b"\r\n\r\n").map(|pos| pos + 4);
    let lf = find_subslice(buf, b"\n\n").map(|pos| pos + 2);
    match (crlf, lf) {
        (Some(crlf), Some(lf)) => Some(crlf.min(lf)),
        (crlf, lf) => crlf.or(lf),
    }
}

/// Bytes the client sent after the header block in the same buffer
pub fn bytes_after_head(buf: &[u8]) -> &[u8] {
    head_end(buf).map(|end| &buf[end..]).unwrap_or(&[])
}

/// Parse the buffered request head into a [`ProxyRequest`]
pub fn parse_request(buf: &[u8]) -> Result<ProxyRequest, RequestError> {
    if buf.is_empty() {
        return Err(RequestError::Empty);
    }

    let line_end = buf.iter().position(|&b| b == b'\n').unwrap_or(buf.len());
    let first_line = String::from_utf8_lossy(&buf[..line_end]);
    let mut parts = first_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Err(RequestError::MalformedRequestLine(
            first_line.trim().to_string(),
        ));
    };
    let version = parts.next().unwrap_or("HTTP/1.0").to_string();

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_host_and_port(target, HTTPS_DEFAULT_PORT)?;
        return Ok(ProxyRequest {
            method: method.to_string(),
            target: target.to_string(),
            host,
            port,
            path: String::new(),
            version,
        });
    }

    let without_scheme = target
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(target);

    let (host, port, path) = if without_scheme.starts_with('/') {
        let host_header = host_header(&buf[(line_end + 1).min(buf.len())..])
            .ok_or(RequestError::MissingHost)?;
        let (host, port) = split_host_and_port(&host_header, HTTP_DEFAULT_PORT)?;
        (host, port, without_scheme.to_string())
    } else {
        let split_at = without_scheme
            .find(['/', '?'])
            .unwrap_or(without_scheme.len());
        let (authority, rest) = without_scheme.split_at(split_at);
        let path = if rest.is_empty() {
            "/".to_string()
        } else if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{rest}")
        };
        // Drop any userinfo ahead of the host
        let authority = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);
        let (host, port) = split_host_and_port(authority, HTTP_DEFAULT_PORT)?;
        (host, port, path)
    };

    Ok(ProxyRequest {
        method: method.to_string(),
        target: target.to_string(),
        host,
        port,
        path,
        version,
    })
}

/// Rewrite a plain HTTP request head for the origin server.
///
/// The request line gets the origin-form path and connection headers are
/// replaced with `Connection: close`. Bytes after the head pass through.
pub fn rewrite_request_head(buf: &[u8], request: &ProxyRequest) -> Vec<u8> {
    let line_end = buf
        .iter()
        .position(|&b| b == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(buf.len());

    let mut out = Vec::with_capacity(buf.len() + 32);
    out.extend_from_slice(
        format!("{} {} {}\r\n", request.method, request.path, request.version).as_bytes(),
    );

    let Some(end) = head_end(buf) else {
        // Head was cut off by the buffer limit; forward it untouched
        out.extend_from_slice(&buf[line_end..]);
        return out;
    };

    for line in buf[line_end.min(end)..end].split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() || is_connection_header(line) {
            continue;
        }
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.extend_from_slice(&buf[end..]);
    out
}

fn is_connection_header(line: &[u8]) -> bool {
    let Some(colon) = line.iter().position(|&b| b == b':') else {
        return false;
    };
    let name = String::from_utf8_lossy(&line[..colon]);
    let name = name.trim();
    CONNECTION_HEADERS
        .iter()
        .any(|header| name.eq_ignore_ascii_case(header))
}

fn host_header(header_bytes: &[u8]) -> Option<String> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let status = httparse::parse_headers(header_bytes, &mut header_storage).ok()?;
    let httparse::Status::Complete((_, headers)) = status else {
        return None;
    };
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .map(|h| String::from_utf8_lossy(h.value).trim().to_string())
        .filter(|value| !value.is_empty())
}

fn split_host_and_port(input: &str, default_port: u16) -> Result<(String, u16), RequestError> {
    let input = input.trim();

    let (host, port) = if let Some(bracketed) = input.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| RequestError::MalformedRequestLine(input.to_string()))?;
        match after.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if after.is_empty() => (host, None),
            None => return Err(RequestError::InvalidPort(input.to_string())),
        }
    } else {
        match input.split_once(':') {
            // More than one colon without brackets: a bare IPv6 literal
            Some((_, rest)) if rest.contains(':') => (input, None),
            Some((host, port)) => (host, Some(port)),
            None => (input, None),
        }
    };

    if host.is_empty() {
        return Err(RequestError::MissingHost);
    }

    let port = match port {
        None => default_port,
        Some(raw) => match raw.parse::<u16>() {
            Ok(port) if port != 0 => port,
            _ => return Err(RequestError::InvalidPort(input.to_string())),
        },
    };

    Ok((host.to_ascii_lowercase(), port))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
