//! Controller transport: one short-lived TCP connection per exchange, device-initiated.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use orch_core::{encode_envelope, Envelope};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Could not reach the controller.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("connect to {0} timed out")]
    ConnectTimeout(SocketAddr),
    #[error("connect to {0} failed: {1}")]
    Connect(SocketAddr, #[source] io::Error),
}

/// Connect to `target` within `connect_timeout`, hand the stream to `exchange`, then close it.
///
/// `Ok` means the connection was made; what happened inside the exchange is the
/// caller's result `T`.
pub async fn exchange<T, F, Fut>(
    target: SocketAddr,
    connect_timeout: Duration,
    exchange: F,
) -> Result<T, ExchangeError>
where
    F: FnOnce(TcpStream) -> Fut,
    Fut: Future<Output = T>,
{
    let stream = match timeout(connect_timeout, TcpStream::connect(target)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return Err(ExchangeError::Connect(target, e)),
        Err(_) => return Err(ExchangeError::ConnectTimeout(target)),
    };
    let _ = stream.set_nodelay(true);
    Ok(exchange(stream).await)
}

/// Write one envelope, bounded by `write_timeout`, and flush.
pub async fn write_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
    write_timeout: Duration,
) -> io::Result<()> {
    let bytes = encode_envelope(envelope).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_bounded(writer, &bytes, write_timeout).await?;
    flush_bounded(writer, write_timeout).await
}

/// `write_all` that fails with `TimedOut` if the peer stops draining.
pub async fn write_bounded<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
    idle: Duration,
) -> io::Result<()> {
    match timeout(idle, writer.write_all(bytes)).await {
        Ok(r) => r,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write stalled")),
    }
}

pub async fn flush_bounded<W: AsyncWrite + Unpin>(writer: &mut W, idle: Duration) -> io::Result<()> {
    match timeout(idle, writer.flush()).await {
        Ok(r) => r,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "flush stalled")),
    }
}
