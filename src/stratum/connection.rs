//! Upstream endpoint connector.
//!
//! Owns the line transport to an upstream pool. The read side lives in a
//! [`Connection`] held by the receive loop; the write side is parked in a
//! shared [`WriteHandle`] so the send loop, the session handshake, and
//! `client.get_version` replies can all transmit on whatever socket is
//! current. Dropping the write half on error is the disconnect signal: the
//! receive loop's next read hits EOF or stalls and reconnects.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket};
use tokio::sync::Mutex;
use tokio::time;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use super::error::{StratumError, StratumResult};
use crate::tracing::prelude::*;

/// Longest line accepted from an upstream before the message is dropped.
const MAX_LINE_LEN: usize = 1 << 20;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Outcome of a timed line read.
#[derive(Debug)]
pub enum LineRead {
    /// A complete line, without the trailing newline
    Line(String),

    /// No line arrived within the timeout
    Idle,
}

/// Shared slot for the write half of the current upstream socket.
///
/// Empty whenever no connection is established. Writes through an empty slot
/// fail with [`StratumError::Disconnected`]; a failed write empties the slot.
#[derive(Clone)]
pub struct WriteHandle {
    slot: Arc<Mutex<Option<BoxedWriter>>>,
}

impl WriteHandle {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    async fn install(&self, writer: BoxedWriter) {
        *self.slot.lock().await = Some(writer);
    }

    /// Send one newline-terminated message.
    pub async fn write_line(&self, line: &str) -> StratumResult<()> {
        let mut guard = self.slot.lock().await;
        let writer = guard.as_mut().ok_or(StratumError::Disconnected)?;
        debug!(msg = %line, "sending json msg");
        let res = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = res {
            *guard = None;
            return Err(StratumError::Io(e));
        }
        Ok(())
    }

    /// Drop the current write half, shutting the stream down if possible.
    pub async fn close(&self) {
        if let Some(mut writer) = self.slot.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

impl Default for WriteHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// The read side of an upstream connection.
///
/// Line framing lives in the [`FramedRead`] buffer, so a timed-out read never
/// loses partially received data.
pub struct Connection {
    frames: FramedRead<BoxedReader, LinesCodec>,
}

impl Connection {
    /// Connect to `host:port`, enable keep-alive, and install the write half
    /// into `writer`.
    pub async fn connect(url: &str, writer: &WriteHandle) -> StratumResult<Connection> {
        let mut last_err = None;
        for addr in lookup_host(url).await? {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_keepalive(true)?;
            match socket.connect(addr).await {
                Ok(stream) => {
                    let (read, write) = stream.into_split();
                    writer.install(Box::new(write)).await;
                    return Ok(Self::from_reader(Box::new(read)));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => StratumError::Io(e),
            None => StratumError::InvalidMessage(format!("no addresses for {url}")),
        })
    }

    /// Wrap an already established stream, for tests and local transports.
    pub async fn from_stream(
        stream: impl AsyncRead + AsyncWrite + Send + Unpin + 'static,
        writer: &WriteHandle,
    ) -> Connection {
        let (read, write) = tokio::io::split(stream);
        writer.install(Box::new(write)).await;
        Self::from_reader(Box::new(read))
    }

    fn from_reader(reader: BoxedReader) -> Connection {
        Connection {
            frames: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LEN)),
        }
    }

    /// Read one line, waiting at most `timeout`.
    ///
    /// Distinguishes a complete line, an idle window, and a broken
    /// connection, mirroring the caller's stall policy.
    pub async fn read_line(&mut self, timeout: Duration) -> StratumResult<LineRead> {
        match time::timeout(timeout, self.frames.next()).await {
            Err(_) => Ok(LineRead::Idle),
            Ok(None) => Err(StratumError::Disconnected),
            Ok(Some(Ok(line))) => Ok(LineRead::Line(line)),
            Ok(Some(Err(LinesCodecError::Io(e)))) => Err(StratumError::Io(e)),
            Ok(Some(Err(e))) => Err(StratumError::InvalidMessage(e.to_string())),
        }
    }
}
