//! Proxy mode: mine on behalf of the local pool against an upstream pool.
//!
//! Every configured upstream is probed at startup with the full handshake
//! (connect, subscribe, authorize); the first that completes becomes the
//! session for the life of the process. Three workers then run under the
//! task tracker: the receive loop, the send loop, and this module's control
//! loop, with an event forwarder relaying session events to the stratifier.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Config;
use crate::control::{verb, ControlListener};
use crate::error::{Error, Result};
use crate::stratifier::Stratifier;
use crate::stratum::{PoolConfig, Upstream, UpstreamEvent};
use crate::tracing::prelude::*;

/// Probe the configured pools, then serve until shutdown.
pub async fn run(
    config: &Config,
    control: &ControlListener,
    stratifier: &Stratifier,
    shutdown: &CancellationToken,
) -> Result<()> {
    let (events_tx, events_rx) = mpsc::channel(64);

    let mut active = None;
    for pool in &config.pool {
        let (upstream, submit_rx) = Upstream::new(
            PoolConfig {
                url: pool.url.clone(),
                auth: pool.auth.clone(),
                pass: pool.pass.clone(),
            },
            events_tx.clone(),
        );
        let conn = match upstream.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(url = %pool.url, error = %e, "failed to connect to upstream pool");
                continue;
            }
        };
        let conn = match upstream.subscribe(conn).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(url = %pool.url, error = %e, "failed initial subscribe");
                continue;
            }
        };
        let mut conn = conn;
        if let Err(e) = upstream.authorize(&mut conn).await {
            warn!(url = %pool.url, error = %e, "failed initial authorise");
            continue;
        }
        info!(url = %pool.url, "proxying upstream pool");
        active = Some((upstream, conn, submit_rx));
        break;
    }
    drop(events_tx);
    let Some((upstream, conn, submit_rx)) = active else {
        error!("no active upstream pools");
        return Err(Error::Stratum(crate::stratum::StratumError::SubscribeFailed(
            "no active upstream pools".to_string(),
        )));
    };

    let tracker = TaskTracker::new();
    tracker.spawn(forward_events(
        events_rx,
        stratifier.clone(),
        shutdown.clone(),
    ));
    {
        let upstream = upstream.clone();
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = upstream.recv_loop(conn) => {}
            }
        });
    }
    {
        let upstream = upstream.clone();
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = upstream.send_loop(submit_rx) => {}
            }
        });
    }
    tracker.close();

    // The stratifier has no session yet; prompt it to fetch the initial
    // subscription and whatever work arrived during the handshake.
    stratifier.send("subscribe").await;
    stratifier.send("notify").await;
    upstream.clear_notified();

    let result = control_loop(&upstream, control, shutdown).await;
    shutdown.cancel();
    tracker.wait().await;
    result
}

/// The request loop, one verb per accepted control connection. Anything that
/// is not a verb is treated as a share submission.
async fn control_loop(
    upstream: &Arc<Upstream>,
    control: &ControlListener,
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
        debug!(%request, "proxy received request");

        if verb(&request, "shutdown") {
            return Ok(());
        } else if verb(&request, "getsubscribe") {
            let (enonce1, nonce2_len) = upstream.subscribe_info();
            let msg = json!({"enonce1": enonce1, "nonce2len": nonce2_len});
            reply(&mut conn, &msg.to_string()).await;
        } else if verb(&request, "getnotify") {
            match upstream.current_notify() {
                Some(notify) => reply(&mut conn, &notify.to_string()).await,
                None => {
                    warn!("getnotify with no current notification");
                    reply(&mut conn, "Failed").await;
                }
            }
        } else if verb(&request, "getdiff") {
            let msg = json!({"diff": upstream.difficulty()});
            reply(&mut conn, &msg.to_string()).await;
        } else if verb(&request, "ping") {
            debug!("proxy received ping request");
            reply(&mut conn, "pong").await;
        } else {
            // Anything remaining should be a share submission.
            match serde_json::from_str::<Value>(&request) {
                Ok(submission) => {
                    if !upstream.enqueue_share(submission).await {
                        warn!("dropped share submission");
                    }
                }
                Err(_) => warn!(%request, "received unrecognised message"),
            }
        }
    }
}

async fn reply(conn: &mut crate::control::ControlConn, msg: &str) {
    if let Err(e) = conn.reply(msg).await {
        warn!(error = %e, "failed to reply on control socket");
    }
}

/// Relay session events to the stratifier.
async fn forward_events(
    mut events: mpsc::Receiver<UpstreamEvent>,
    stratifier: Stratifier,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        match event {
            UpstreamEvent::Subscribed => stratifier.send("subscribe").await,
            UpstreamEvent::Notify => stratifier.send("notify").await,
            UpstreamEvent::Diff => stratifier.send("diff").await,
            UpstreamEvent::ShareResult {
                client_id,
                msg_id,
                accepted,
            } => stratifier.share_result(client_id, msg_id, accepted).await,
        }
    }
}
