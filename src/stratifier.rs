//! Outbound notifications to peer processes.
//!
//! The generator's only peer is the stratifier, which owns connected-miner
//! state; on fatal exit the supervisor gets a `shutdown` message the same
//! way. Notifications are single message strings over the peer's Unix
//! socket, best-effort fire-and-forget: a missing or wedged peer costs a log
//! line, never a stall.

use std::path::{Path, PathBuf};

use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use crate::tracing::prelude::*;

/// Deliver one message to a process socket, best-effort.
///
/// Returns whether the message was handed to the peer.
pub async fn send_proc(path: &Path, msg: &str) -> bool {
    let mut stream = match UnixStream::connect(path).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to connect to process socket");
            return false;
        }
    };
    if let Err(e) = stream.write_all(msg.as_bytes()).await {
        warn!(path = %path.display(), error = %e, "failed to send process message");
        return false;
    }
    let _ = stream.shutdown().await;
    true
}

/// Handle on the stratifier's socket.
#[derive(Debug, Clone)]
pub struct Stratifier {
    path: PathBuf,
}

impl Stratifier {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Fire one notification string (`subscribe`, `notify`, `diff`,
    /// `update`, ...).
    pub async fn send(&self, msg: &str) {
        debug!(%msg, "notifying stratifier");
        send_proc(&self.path, msg).await;
    }

    /// Surface an upstream share verdict so pool-side accounting matches
    /// what the upstream pool actually credited.
    pub async fn share_result(&self, client_id: i64, msg_id: i64, accepted: bool) {
        let payload = json!({
            "client_id": client_id,
            "msg_id": msg_id,
            "result": accepted,
        });
        self.send(&format!("shareresult:{payload}")).await;
    }
}
