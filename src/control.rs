//! Local control socket.
//!
//! The generator serves one request per accepted connection on a Unix-domain
//! socket: the client writes a single newline-free message and half-closes,
//! the generator replies with one message and closes. Both mode loops share
//! these primitives; the verbs differ.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::time;

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Largest request accepted on the control socket.
const MAX_REQUEST_LEN: u64 = 1 << 20;

/// How long a connected client gets to finish sending its request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Listening end of the control socket.
///
/// Binding removes any stale socket file left by a previous run; the file is
/// removed again on drop.
pub struct ControlListener {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlListener {
    pub fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub async fn accept(&self) -> Result<ControlConn> {
        let (stream, _) = self.listener.accept().await?;
        Ok(ControlConn { stream })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// One accepted control client.
pub struct ControlConn {
    stream: UnixStream,
}

impl ControlConn {
    /// Read the client's single message.
    ///
    /// Clients signal the end of their request by shutting down their write
    /// side; a client that dawdles past the timeout gets whatever it managed
    /// to send treated as the whole request.
    pub async fn request(&mut self) -> Result<String> {
        let mut buf = Vec::new();
        let mut limited = (&mut self.stream).take(MAX_REQUEST_LEN);
        let read = limited.read_to_end(&mut buf);
        if time::timeout(REQUEST_TIMEOUT, read).await.is_err() {
            debug!("control client did not close; using partial request");
        }
        if buf.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "empty control request",
            )));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Send the single reply and close.
    pub async fn reply(&mut self, msg: &str) -> Result<()> {
        self.stream.write_all(msg.as_bytes()).await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Send one message to a peer process socket and close, client side.
pub async fn send_request(path: &Path, msg: &str) -> Result<UnixStream> {
    let mut stream = UnixStream::connect(path).await?;
    stream.write_all(msg.as_bytes()).await?;
    // Half-close so the server sees the end of the request.
    stream.shutdown().await?;
    Ok(stream)
}

/// Case-insensitive verb match on a control request.
pub fn verb(request: &str, name: &str) -> bool {
    request
        .get(..name.len())
        .map(|prefix| prefix.eq_ignore_ascii_case(name))
        .unwrap_or(false)
}
