//! Byte relays between client and upstream sockets

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time;

const RELAY_BUFFER_BYTES: usize = 16 * 1024;

/// Copy `reader` into `writer` until EOF.
///
/// Fails with `TimedOut` when a single read or write stalls longer than `idle`.
pub async fn copy_with_idle_timeout<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle: Duration,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; RELAY_BUFFER_BYTES];
    let mut total = 0u64;

    loop {
        let bytes_read = time::timeout(idle, reader.read(&mut buf))
            .await
            .map_err(|_| timed_out("read"))??;
        if bytes_read == 0 {
            return Ok(total);
        }

        time::timeout(idle, writer.write_all(&buf[..bytes_read]))
            .await
            .map_err(|_| timed_out("write"))??;
        total += bytes_read as u64;
    }
}

/// Write `bytes` unless the peer stalls longer than `idle`
pub async fn write_with_timeout<W>(writer: &mut W, bytes: &[u8], idle: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    time::timeout(idle, async {
        writer.write_all(bytes).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| timed_out("write"))?
}

fn timed_out(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("relay {op} timed out"))
}

/// Tunnel data between client and upstream until either direction ends.
///
/// Both streams are dropped, and so closed, when this returns.
pub async fn tunnel<C, U>(client: C, upstream: U, idle: Duration) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_reader, mut client_writer) = tokio::io::split(client);
    let (mut upstream_reader, mut upstream_writer) = tokio::io::split(upstream);

    let client_to_upstream =
        copy_with_idle_timeout(&mut client_reader, &mut upstream_writer, idle);
    let upstream_to_client =
        copy_with_idle_timeout(&mut upstream_reader, &mut client_writer, idle);

    tokio::select! {
        result = client_to_upstream => {
            match result {
                Ok(bytes) => tracing::debug!("Client closed tunnel after {} bytes", bytes),
                Err(e) => tracing::debug!("Client to upstream error: {}", e),
            }
        }
        result = upstream_to_client => {
            match result {
                Ok(bytes) => tracing::debug!("Upstream closed tunnel after {} bytes", bytes),
                Err(e) => tracing::debug!("Upstream to client error: {}", e),
            }
        }
    }

    Ok(())
}

/// Send a buffered request upstream and relay the response back.
///
/// Anything else the client sends is streamed upstream meanwhile; the exchange
/// ends when the upstream response ends.
pub async fn relay_http<C, U>(
    client: C,
    upstream: U,
    request_head: &[u8],
    idle: Duration,
) -> io::Result<u64>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_reader, mut client_writer) = tokio::io::split(client);
    let (mut upstream_reader, mut upstream_writer) = tokio::io::split(upstream);

    write_with_timeout(&mut upstream_writer, request_head, idle).await?;

    let upload = copy_with_idle_timeout(&mut client_reader, &mut upstream_writer, idle);
    let response = copy_with_idle_timeout(&mut upstream_reader, &mut client_writer, idle);
    tokio::pin!(upload);
    tokio::pin!(response);

    let mut upload_done = false;
    loop {
        tokio::select! {
            result = &mut response => {
                return result;
            }
            result = &mut upload, if !upload_done => {
                // The response alone decides when the exchange is over
                upload_done = true;
                if let Err(e) = result {
                    tracing::debug!("Stopped streaming request body: {}", e);
                }
            }
        }
    }
}
