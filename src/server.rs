//! Server mode: serve block templates from a local bitcoind.
//!
//! At startup every configured node is probed (one test template fetch plus
//! payout-address validation); nodes that fail are marked dead. With no
//! survivor the process exits fatally, otherwise the first alive node backs
//! the control loop for the life of the process.

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::control::{verb, ControlConn, ControlListener};
use crate::error::{Error, Result};
use crate::node::{NodeClient, NodeRpc};
use crate::stratifier::Stratifier;
use crate::tracing::prelude::*;

/// Probe the configured nodes and serve the control loop from the first one
/// that works.
pub async fn run(
    config: &Config,
    control: &ControlListener,
    stratifier: &Stratifier,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut alive = None;
    for node_config in &config.node {
        let node = match NodeClient::new(node_config) {
            Ok(node) => node,
            Err(e) => {
                warn!(url = %node_config.url, error = %e, "failed to set up node client");
                continue;
            }
        };
        if let Err(e) = node.block_template().await {
            warn!(url = %node.url(), error = %e, "failed to get test block template");
            continue;
        }
        match node.validate_address(&config.btcaddress).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(url = %node.url(), address = %config.btcaddress, "invalid btcaddress");
                continue;
            }
            Err(e) => {
                warn!(url = %node.url(), error = %e, "failed to validate btcaddress");
                continue;
            }
        }
        alive = Some(node);
        break;
    }
    let Some(node) = alive else {
        error!("no usable bitcoind endpoints");
        return Err(Error::Node("no usable bitcoind endpoints".to_string()));
    };
    info!(url = %node.url(), "serving block templates");

    serve(&node, control, stratifier, shutdown).await
}

/// The request loop, one verb per accepted control connection.
pub(crate) async fn serve<N: NodeRpc>(
    node: &N,
    control: &ControlListener,
    stratifier: &Stratifier,
    shutdown: &CancellationToken,
) -> Result<()> {
    loop {
        let mut conn = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = control.accept() => accepted?,
        };
        let request = match conn.request().await {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "failed to read control request");
                continue;
            }
        };
        debug!(%request, "generator received request");

        if verb(&request, "shutdown") {
            return Ok(());
        } else if verb(&request, "getbase") {
            match node.block_template().await {
                Ok(template) => reply(&mut conn, &template.to_string()).await,
                Err(e) => {
                    warn!(error = %e, "failed to get block template");
                    reply(&mut conn, "Failed").await;
                }
            }
        } else if verb(&request, "getbest") {
            match node.best_block_hash().await {
                Ok(hash) => reply(&mut conn, &hash).await,
                Err(e) => {
                    warn!(error = %e, "no best block hash support");
                    reply(&mut conn, "Failed").await;
                }
            }
        } else if verb(&request, "getlast") {
            match last_block_hash(node).await {
                Ok(hash) => reply(&mut conn, &hash).await,
                Err(e) => {
                    warn!(error = %e, "failed to get last block hash");
                    reply(&mut conn, "Failed").await;
                }
            }
        } else if let Some(hex) = strip_verb(&request, "submitblock:") {
            info!("submitting block data");
            match node.submit_block(hex).await {
                Ok(true) => stratifier.send("update").await,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "failed to submit block"),
            }
        } else if verb(&request, "ping") {
            debug!("generator received ping request");
            reply(&mut conn, "pong").await;
        } else {
            warn!(%request, "unrecognised control request");
        }
    }
}

async fn last_block_hash<N: NodeRpc>(node: &N) -> Result<String> {
    let height = node.block_count().await?;
    debug!(height, "current block height");
    node.block_hash(height).await
}

async fn reply(conn: &mut ControlConn, msg: &str) {
    if let Err(e) = conn.reply(msg).await {
        warn!(error = %e, "failed to reply on control socket");
    }
}

fn strip_verb<'a>(request: &'a str, name: &str) -> Option<&'a str> {
    if verb(request, name) {
        Some(&request[name.len()..])
    } else {
        None
    }
}
