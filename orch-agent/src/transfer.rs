//! Streaming file transfer over the controller connection.
//!
//! Outbound: checksum the file, then write header, base64 chunks and trailer with a per-chunk
//! idle bound. Inbound: copy raw bytes into a staging file until the peer goes quiet.

use std::io;
use std::time::Duration;

use orch_core::transfer::{encode_chunk, Checksum, TransferHeader, CHUNK_SIZE, TRAILER};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::transport::{flush_bounded, write_bounded};

/// Largest inbound payload accepted for a Push.
pub const MAX_INBOUND_LEN: u64 = 4 * 1024 * 1024;

/// CRC-32 and length of the whole file. Leaves the cursor at the start.
pub async fn checksum_file<F>(file: &mut F) -> io::Result<(u32, u64)>
where
    F: AsyncRead + AsyncSeek + Unpin,
{
    file.seek(io::SeekFrom::Start(0)).await?;
    let mut digest = Checksum::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    let len = digest.len();
    file.seek(io::SeekFrom::Start(0)).await?;
    Ok((digest.finalize(), len))
}

/// Fill `buf` unless EOF comes first, so every chunk but the last is a full multiple of 3.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Stream exactly `header.size` bytes of `source` as a transfer envelope.
///
/// Bytes appended to the source after it was checksummed are not sent. A source that
/// shrinks underneath fails with `UnexpectedEof`.
pub async fn send_file<R, W>(
    writer: &mut W,
    source: R,
    header: &TransferHeader,
    write_idle: Duration,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_bounded(writer, header.render().as_bytes(), write_idle).await?;
    let mut source = source.take(header.size);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = read_full(&mut source, &mut buf).await?;
        if n == 0 {
            break;
        }
        write_bounded(writer, encode_chunk(&buf[..n]).as_bytes(), write_idle).await?;
        sent += n as u64;
    }
    if sent != header.size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("file shrank: sent {} of {} bytes", sent, header.size),
        ));
    }
    write_bounded(writer, TRAILER.as_bytes(), write_idle).await?;
    flush_bounded(writer, write_idle).await
}

/// How an inbound copy ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveEnd {
    /// Peer closed the connection.
    Closed,
    /// No bytes for the idle window.
    Idle,
}

/// Copy from `reader` into `sink` until EOF or `idle` passes with no new bytes.
/// Returns bytes written and how the copy ended.
pub async fn receive_until_idle<R, W>(
    reader: &mut R,
    sink: &mut W,
    idle: Duration,
    max_len: u64,
) -> io::Result<(u64, ReceiveEnd)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 1024];
    let mut total = 0u64;
    let end = loop {
        let n = match timeout(idle, reader.read(&mut buf)).await {
            Err(_) => break ReceiveEnd::Idle,
            Ok(Ok(0)) => break ReceiveEnd::Closed,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
        };
        total += n as u64;
        if total > max_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("inbound payload exceeds {} bytes", max_len),
            ));
        }
        sink.write_all(&buf[..n]).await?;
    };
    sink.flush().await?;
    Ok((total, end))
}
