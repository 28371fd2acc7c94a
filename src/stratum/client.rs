//! Upstream session management and the proxy worker loops.
//!
//! One [`Upstream`] holds the mutable session state for a single proxied
//! pool, shared by three workers: the receive loop (reads pushed methods and
//! share results, ages the caches, reconnects on stall), the send loop
//! (drains queued share submissions and re-keys them for the pool), and the
//! control server (which feeds the send queue and reads the caches). Workers
//! never hold a lock across I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time;

use super::connection::{Connection, LineRead, WriteHandle};
use super::error::{StratumError, StratumResult};
use super::jobs::NotifyCache;
use super::messages::{self, Notification, UpstreamEvent};
use super::shares::{ShareInFlight, ShareTracker};
use super::{
    CLIENT_TAG, MAX_ENONCE1_BYTES, MAX_NONCE2_LEN, MIN_NONCE2_LEN, READ_RETRIES, READ_TIMEOUT,
    RECONNECT_DELAY, SUBMIT_QUEUE_BOUND,
};
use crate::tracing::prelude::*;

/// Upstream pool connection parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool address, `host:port`
    pub url: String,

    /// Worker username
    pub auth: String,

    /// Worker password
    pub pass: String,
}

/// Mutable per-session protocol state.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Session id for subscription resume, when the pool offers one
    pub session_id: Option<String>,

    /// Pool rejected session id resume on subscribe
    pub no_sessionid: bool,

    /// Pool rejected any parameters on subscribe
    pub no_params: bool,

    /// Extranonce1 as sent by the pool
    pub enonce1: String,

    /// Decoded extranonce1, at most 15 bytes
    pub enonce1_bin: Vec<u8>,

    /// Negotiated nonce2 length, 4..=8
    pub nonce2_len: usize,

    /// Current share difficulty
    pub diff: f64,

    next_id: u64,
}

impl SessionState {
    fn next_request_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// How an inbound line was classified by the method dispatcher.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// A push method, handled
    Method,

    /// The pool asked us to reconnect
    Reconnect,

    /// Not a method; likely a response to one of our requests
    NotMethod,
}

/// Shared state for one proxied upstream pool.
pub struct Upstream {
    config: PoolConfig,
    client_tag: String,
    state: Mutex<SessionState>,
    jobs: Mutex<NotifyCache>,
    shares: Mutex<ShareTracker>,
    writer: WriteHandle,
    notified: AtomicBool,
    diffed: AtomicBool,
    submit_tx: mpsc::Sender<Value>,
    events: mpsc::Sender<UpstreamEvent>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// Deployed pools are loose about method-name casing and suffixes, so match
// by case-insensitive prefix.
fn method_is(method: &str, name: &str) -> bool {
    method
        .get(..name.len())
        .map(|prefix| prefix.eq_ignore_ascii_case(name))
        .unwrap_or(false)
}

impl Upstream {
    /// Create the session state and its submission queue.
    ///
    /// The returned receiver is handed to [`Upstream::send_loop`]; the
    /// control server enqueues through [`Upstream::enqueue_share`].
    pub fn new(
        config: PoolConfig,
        events: mpsc::Sender<UpstreamEvent>,
    ) -> (Arc<Self>, mpsc::Receiver<Value>) {
        let (submit_tx, submit_rx) = mpsc::channel(SUBMIT_QUEUE_BOUND);
        let upstream = Arc::new(Self {
            config,
            client_tag: CLIENT_TAG.to_string(),
            state: Mutex::new(SessionState::default()),
            jobs: Mutex::new(NotifyCache::new()),
            shares: Mutex::new(ShareTracker::new()),
            writer: WriteHandle::new(),
            notified: AtomicBool::new(false),
            diffed: AtomicBool::new(false),
            submit_tx,
            events,
        });
        (upstream, submit_rx)
    }

    /// Open a fresh connection to the configured pool.
    pub async fn connect(&self) -> StratumResult<Connection> {
        Connection::connect(&self.config.url, &self.writer).await
    }

    /// Extranonce1 hex and nonce2 length from the live subscription.
    pub fn subscribe_info(&self) -> (String, usize) {
        let state = self.state.lock().unwrap();
        (state.enonce1.clone(), state.nonce2_len)
    }

    /// Current share difficulty.
    pub fn difficulty(&self) -> f64 {
        self.state.lock().unwrap().diff
    }

    /// The current notification re-keyed with its local job id.
    pub fn current_notify(&self) -> Option<Value> {
        self.jobs.lock().unwrap().current().map(|n| n.to_local_json())
    }

    /// Drop a notify flag accumulated during the handshake; the startup
    /// `notify` signal already covers that work.
    pub fn clear_notified(&self) {
        self.notified.store(false, Ordering::SeqCst);
    }

    /// Subscribe, falling back through the parameter variants.
    ///
    /// Tiers, in order: resume with the stored session id, plain client tag,
    /// no parameters at all. A rejected tier closes the socket, downgrades
    /// the capability flags, and retries on a fresh connection; running out
    /// of tiers is an error.
    pub async fn subscribe(&self, mut conn: Connection) -> StratumResult<Connection> {
        loop {
            match self.subscribe_once(&mut conn).await {
                Ok(()) => {
                    let state = self.state.lock().unwrap();
                    info!(
                        enonce1 = %state.enonce1,
                        nonce2_len = state.nonce2_len,
                        "subscribed to upstream"
                    );
                    return Ok(conn);
                }
                Err(e) => {
                    self.writer.close().await;
                    {
                        let mut state = self.state.lock().unwrap();
                        if state.no_params {
                            warn!(error = %e, "failed all subscription options");
                            return Err(StratumError::SubscribeFailed(e.to_string()));
                        }
                        if state.session_id.take().is_some() {
                            info!("session resume rejected, retrying without session id");
                            state.no_sessionid = true;
                        } else {
                            info!("subscribe with parameters rejected, retrying without");
                            state.no_params = true;
                        }
                    }
                    conn = self.connect().await?;
                }
            }
        }
    }

    async fn subscribe_once(&self, conn: &mut Connection) -> StratumResult<()> {
        let (id, params) = {
            let mut state = self.state.lock().unwrap();
            let id = state.next_request_id();
            let params = if let Some(session_id) = &state.session_id {
                json!([self.client_tag, session_id])
            } else if !state.no_params {
                json!([self.client_tag])
            } else {
                json!([])
            };
            (id, params)
        };
        let req = messages::request(id, "mining.subscribe", params);
        self.writer.write_line(&req.to_string()).await?;

        match conn.read_line(READ_TIMEOUT).await? {
            LineRead::Idle => Err(StratumError::Timeout),
            LineRead::Line(line) => self.apply_subscribe(&line),
        }
    }

    /// Validate a subscribe response and adopt its session parameters.
    fn apply_subscribe(&self, line: &str) -> StratumResult<()> {
        let val: Value = serde_json::from_str(line)
            .map_err(|e| StratumError::InvalidMessage(format!("subscribe response: {e}")))?;
        let result = messages::result_of(&val)
            .ok_or_else(|| StratumError::SubscribeFailed("no result in response".to_string()))?;
        let arr = result
            .as_array()
            .ok_or_else(|| StratumError::SubscribeFailed("result is not an array".to_string()))?;
        if arr.len() < 3 {
            return Err(StratumError::SubscribeFailed(
                "result array too small".to_string(),
            ));
        }
        let notify = messages::find_notify(result)
            .ok_or_else(|| StratumError::SubscribeFailed("no notify descriptor".to_string()))?;

        let enonce1 = arr[1]
            .as_str()
            .ok_or_else(|| StratumError::SubscribeFailed("extranonce1 not a string".to_string()))?;
        if enonce1.is_empty() {
            return Err(StratumError::SubscribeFailed(
                "empty extranonce1".to_string(),
            ));
        }
        let enonce1_bin = hex::decode(enonce1)
            .map_err(|e| StratumError::SubscribeFailed(format!("extranonce1 not hex: {e}")))?;
        if enonce1_bin.len() > MAX_ENONCE1_BYTES {
            return Err(StratumError::SubscribeFailed(format!(
                "extranonce1 too long at {} bytes",
                enonce1_bin.len()
            )));
        }

        let nonce2_len = arr[2].as_u64().ok_or_else(|| {
            StratumError::SubscribeFailed("nonce2 length not an integer".to_string())
        })? as usize;
        if nonce2_len == 0 || nonce2_len > MAX_NONCE2_LEN {
            return Err(StratumError::SubscribeFailed(format!(
                "invalid nonce2 length {nonce2_len}"
            )));
        }
        if nonce2_len < MIN_NONCE2_LEN {
            return Err(StratumError::Unproxyable(format!(
                "nonce2 length {nonce2_len} too small to re-split"
            )));
        }

        let mut state = self.state.lock().unwrap();
        if !state.no_params && !state.no_sessionid {
            let session_id = notify
                .as_array()
                .filter(|a| a.len() > 1)
                .and_then(|a| a[1].as_str());
            if let Some(session_id) = session_id {
                state.session_id = Some(session_id.to_string());
            }
        }
        state.enonce1 = enonce1.to_string();
        state.enonce1_bin = enonce1_bin;
        state.nonce2_len = nonce2_len;
        Ok(())
    }

    /// Authorize with the pool.
    ///
    /// Pools may push notify or difficulty before answering; each buffered
    /// line runs through the method dispatcher, and the first line that is
    /// not a push method is taken as the authorize response.
    pub async fn authorize(&self, conn: &mut Connection) -> StratumResult<()> {
        let id = self.state.lock().unwrap().next_request_id();
        let req = messages::request(
            id,
            "mining.authorize",
            json!([self.config.auth, self.config.pass]),
        );
        self.writer.write_line(&req.to_string()).await?;

        loop {
            let line = match conn.read_line(READ_TIMEOUT).await? {
                LineRead::Idle => return Err(StratumError::Timeout),
                LineRead::Line(line) => line,
            };
            match self.dispatch_method(&line).await {
                Dispatch::Method => continue,
                Dispatch::Reconnect => return Err(StratumError::Disconnected),
                Dispatch::NotMethod => {
                    let val: Value = serde_json::from_str(&line)
                        .map_err(|e| StratumError::InvalidMessage(e.to_string()))?;
                    return match messages::result_of(&val) {
                        Some(Value::Bool(true)) => {
                            info!("authorized with upstream");
                            Ok(())
                        }
                        _ => Err(StratumError::AuthorizeFailed(
                            "upstream rejected credentials".to_string(),
                        )),
                    };
                }
            }
        }
    }

    /// Classify one inbound line and handle it if it is a push method.
    pub async fn dispatch_method(&self, line: &str) -> Dispatch {
        let Ok(val) = serde_json::from_str::<Value>(line) else {
            warn!(msg = %line, "JSON decode failed");
            return Dispatch::NotMethod;
        };
        let Some(method) = val.get("method").and_then(Value::as_str) else {
            return Dispatch::NotMethod;
        };
        if val.get("error").map(|e| !e.is_null()).unwrap_or(false) {
            info!(error = %val["error"], "JSON-RPC method carried an error");
            return Dispatch::NotMethod;
        }
        let null = Value::Null;
        let params = val.get("params").unwrap_or(&null);

        if method_is(method, "mining.notify") {
            match Notification::from_params(params) {
                Ok(notification) => {
                    debug!(job_id = %notification.job_id, "new notify");
                    self.jobs.lock().unwrap().insert(notification, unix_now());
                    self.notified.store(true, Ordering::SeqCst);
                    Dispatch::Method
                }
                Err(e) => {
                    warn!(error = %e, "failed to decode notify");
                    Dispatch::NotMethod
                }
            }
        } else if method_is(method, "mining.set_difficulty") {
            self.apply_difficulty(params);
            Dispatch::Method
        } else if method_is(method, "client.reconnect") {
            Dispatch::Reconnect
        } else if method_is(method, "client.get_version") {
            let reply = json!({
                "id": val.get("id").cloned().unwrap_or(Value::Null),
                "result": self.client_tag,
                "error": Value::Null,
            });
            if let Err(e) = self.writer.write_line(&reply.to_string()).await {
                warn!(error = %e, "failed to answer get_version");
            }
            Dispatch::Method
        } else if method_is(method, "client.show_message") {
            if let Some(msg) = params.get(0).and_then(Value::as_str) {
                info!(message = %msg, "pool message");
            }
            Dispatch::Method
        } else {
            warn!(%method, "unsupported method from upstream");
            Dispatch::Method
        }
    }

    fn apply_difficulty(&self, params: &Value) {
        let diff = params.get(0).and_then(Value::as_f64).unwrap_or(0.0);
        let mut state = self.state.lock().unwrap();
        if diff == 0.0 || diff == state.diff {
            return;
        }
        state.diff = diff;
        drop(state);
        self.diffed.store(true, Ordering::SeqCst);
    }

    /// Correlate a share response with its in-flight record.
    fn handle_share_result(&self, line: &str) -> Option<(ShareInFlight, bool)> {
        let val: Value = serde_json::from_str(line).ok()?;
        let id = val.get("id")?.as_u64()?;
        match self.shares.lock().unwrap().resolve(id) {
            Some(share) => {
                let accepted = val.get("result").and_then(Value::as_bool).unwrap_or(false);
                debug!(
                    client_id = share.client_id,
                    msg_id = share.msg_id,
                    accepted,
                    "share result from upstream"
                );
                Some((share, accepted))
            }
            None => {
                info!(msg = %line, "no matching share for result");
                None
            }
        }
    }

    /// Accept a share submission from the control socket.
    ///
    /// Records the originating client and message ids, then queues the
    /// remainder for the send loop under a fresh local share id.
    pub async fn enqueue_share(&self, mut submission: Value) -> bool {
        let Some(obj) = submission.as_object_mut() else {
            return false;
        };
        let client_id = obj.get("client_id").and_then(Value::as_i64);
        let msg_id = obj.get("msg_id").and_then(Value::as_i64);
        let (Some(client_id), Some(msg_id)) = (client_id, msg_id) else {
            warn!("share submission missing client_id or msg_id");
            return false;
        };
        obj.remove("client_id");
        obj.remove("msg_id");
        let id = self
            .shares
            .lock()
            .unwrap()
            .track(client_id, msg_id, unix_now());
        obj.insert("id".to_string(), json!(id));
        self.submit_tx.send(submission).await.is_ok()
    }

    /// Receive worker: age the caches, read pushed methods, correlate share
    /// results, and reconnect on stall.
    pub async fn recv_loop(self: Arc<Self>, mut conn: Connection) {
        loop {
            let now = unix_now();
            self.jobs.lock().unwrap().reap(now);
            self.shares.lock().unwrap().reap(now);

            let Some(line) = self.read_with_stall(&mut conn).await else {
                warn!("upstream stopped responding, attempting reconnect");
                conn = match self.reconnect().await {
                    Some(conn) => conn,
                    None => return,
                };
                continue;
            };

            match self.dispatch_method(&line).await {
                Dispatch::Method => {
                    if self.notified.swap(false, Ordering::SeqCst)
                        && self.events.send(UpstreamEvent::Notify).await.is_err()
                    {
                        return;
                    }
                    if self.diffed.swap(false, Ordering::SeqCst)
                        && self.events.send(UpstreamEvent::Diff).await.is_err()
                    {
                        return;
                    }
                }
                Dispatch::Reconnect => {
                    info!("upstream requested reconnect");
                    conn = match self.reconnect().await {
                        Some(conn) => conn,
                        None => return,
                    };
                }
                Dispatch::NotMethod => {
                    if let Some((share, accepted)) = self.handle_share_result(&line) {
                        let event = UpstreamEvent::ShareResult {
                            client_id: share.client_id,
                            msg_id: share.msg_id,
                            accepted,
                        };
                        if self.events.send(event).await.is_err() {
                            return;
                        }
                    } else {
                        warn!(msg = %line, "unhandled stratum message");
                    }
                }
            }
        }
    }

    /// Read one line, tolerating idle windows up to the stall budget.
    async fn read_with_stall(&self, conn: &mut Connection) -> Option<String> {
        for _ in 0..READ_RETRIES {
            match conn.read_line(READ_TIMEOUT).await {
                Ok(LineRead::Line(line)) => return Some(line),
                Ok(LineRead::Idle) => continue,
                Err(e) => {
                    warn!(error = %e, "failed to read from upstream");
                    return None;
                }
            }
        }
        None
    }

    /// Re-establish the session after a break.
    ///
    /// All cached work is invalid, so the notification cache is flushed
    /// first; in-flight shares are left to age out. Retries forever with a
    /// fixed delay, and announces the new subscription when it succeeds.
    /// Returns `None` only when the event channel is gone, i.e. shutdown.
    async fn reconnect(&self) -> Option<Connection> {
        self.jobs.lock().unwrap().flush();
        let mut first = true;
        loop {
            if self.events.is_closed() {
                return None;
            }
            if !first {
                time::sleep(RECONNECT_DELAY).await;
            }
            first = false;
            self.writer.close().await;

            let conn = match self.connect().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(url = %self.config.url, error = %e, "failed to reconnect");
                    continue;
                }
            };
            let mut conn = match self.subscribe(conn).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "failed to resubscribe");
                    continue;
                }
            };
            if let Err(e) = self.authorize(&mut conn).await {
                warn!(error = %e, "failed to reauthorize");
                continue;
            }
            if self.events.send(UpstreamEvent::Subscribed).await.is_err() {
                return None;
            }
            return Some(conn);
        }
    }

    /// Send worker: drain queued submissions, re-key them, and transmit.
    ///
    /// The queued object still carries our local job id; the pool wants its
    /// own. A submission whose job has aged out of the cache is dropped, not
    /// sent with a stale id. A failed write drops the connection so the
    /// receive worker reconnects.
    pub async fn send_loop(self: Arc<Self>, mut submissions: mpsc::Receiver<Value>) {
        while let Some(msg) = submissions.recv().await {
            let upstream_job = msg
                .get("jobid")
                .and_then(Value::as_u64)
                .and_then(|id| self.jobs.lock().unwrap().upstream_job_id(id));
            let Some(job_id) = upstream_job else {
                warn!("no matching job for queued share, dropping");
                continue;
            };
            let req = json!({
                "params": [
                    self.config.auth,
                    job_id,
                    msg.get("nonce2").cloned().unwrap_or(Value::Null),
                    msg.get("ntime").cloned().unwrap_or(Value::Null),
                    msg.get("nonce").cloned().unwrap_or(Value::Null),
                ],
                "id": msg.get("id").cloned().unwrap_or(Value::Null),
                "method": "mining.submit",
            });
            if let Err(e) = self.writer.write_line(&req.to_string()).await {
                warn!(error = %e, "failed to send share upstream, dropping connection");
                self.writer.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use tokio::net::TcpListener;
    use tokio_stream::StreamExt;
    use tokio_util::codec::{Framed, LinesCodec};

    fn test_config() -> PoolConfig {
        PoolConfig {
            url: "127.0.0.1:0".to_string(),
            auth: "user".to_string(),
            pass: "x".to_string(),
        }
    }

    fn test_upstream() -> (
        Arc<Upstream>,
        mpsc::Receiver<Value>,
        mpsc::Receiver<UpstreamEvent>,
    ) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (upstream, submit_rx) = Upstream::new(test_config(), events_tx);
        (upstream, submit_rx, events_rx)
    }

    fn notify_line(job_id: &str) -> String {
        json!({
            "id": Value::Null,
            "method": "mining.notify",
            "params": [
                job_id,
                "4d16b6f85af6e2198f44ae2a6de67f78487ae5611b77c6c0440b921e00000000",
                "0100000001",
                "072f736c7573682f",
                [],
                "20000000",
                "1c2ac4af",
                "504e86b9",
                true
            ]
        })
        .to_string()
    }

    fn subscribe_response(enonce1: &str, nonce2_len: u64) -> String {
        json!({
            "id": 0,
            "result": [
                [["mining.set_difficulty", "d1"], ["mining.notify", "session-two"]],
                enonce1,
                nonce2_len
            ],
            "error": Value::Null
        })
        .to_string()
    }

    #[test]
    fn apply_subscribe_adopts_session_parameters() {
        let (upstream, _submit_rx, _events_rx) = test_upstream();
        upstream
            .apply_subscribe(&subscribe_response("a1b2c3d4", 8))
            .unwrap();
        let state = upstream.state.lock().unwrap();
        assert_eq!(state.enonce1, "a1b2c3d4");
        assert_eq!(state.enonce1_bin, vec![0xa1, 0xb2, 0xc3, 0xd4]);
        assert_eq!(state.nonce2_len, 8);
        assert_eq!(state.session_id.as_deref(), Some("session-two"));
    }

    #[test]
    fn apply_subscribe_skips_session_id_when_downgraded() {
        let (upstream, _submit_rx, _events_rx) = test_upstream();
        upstream.state.lock().unwrap().no_sessionid = true;
        upstream
            .apply_subscribe(&subscribe_response("a1b2c3d4", 4))
            .unwrap();
        assert!(upstream.state.lock().unwrap().session_id.is_none());
    }

    #[test]
    fn nonce2_length_bounds() {
        let (upstream, _submit_rx, _events_rx) = test_upstream();
        assert!(matches!(
            upstream.apply_subscribe(&subscribe_response("a1b2", 3)),
            Err(StratumError::Unproxyable(_))
        ));
        assert!(upstream.apply_subscribe(&subscribe_response("a1b2", 4)).is_ok());
        assert!(upstream.apply_subscribe(&subscribe_response("a1b2", 8)).is_ok());
        assert!(matches!(
            upstream.apply_subscribe(&subscribe_response("a1b2", 9)),
            Err(StratumError::SubscribeFailed(_))
        ));
    }

    #[test]
    fn enonce1_length_bounds() {
        let (upstream, _submit_rx, _events_rx) = test_upstream();
        // 30 hex chars = 15 bytes, the longest we can prefix.
        let longest = "aa".repeat(15);
        assert!(upstream
            .apply_subscribe(&subscribe_response(&longest, 4))
            .is_ok());
        let too_long = "aa".repeat(16);
        assert!(matches!(
            upstream.apply_subscribe(&subscribe_response(&too_long, 4)),
            Err(StratumError::SubscribeFailed(_))
        ));
    }

    #[tokio::test]
    async fn subscribe_falls_back_to_bare_params() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let pool = tokio::spawn(async move {
            let mut param_counts = Vec::new();
            for round in 0..3 {
                let (stream, _) = listener.accept().await.unwrap();
                let mut framed = Framed::new(stream, LinesCodec::new());
                let line = framed.next().await.unwrap().unwrap();
                let req: Value = serde_json::from_str(&line).unwrap();
                assert_eq!(req["method"], "mining.subscribe");
                param_counts.push(req["params"].as_array().unwrap().len());
                let reply = if round < 2 {
                    json!({
                        "id": req["id"],
                        "result": Value::Null,
                        "error": [25, "not supported", Value::Null]
                    })
                } else {
                    json!({
                        "id": req["id"],
                        "result": [["mining.notify", "fresh-session"], "c0ffee01", 4],
                        "error": Value::Null
                    })
                };
                framed.send(reply.to_string()).await.unwrap();
            }
            param_counts
        });

        let (events_tx, _events_rx) = mpsc::channel(16);
        let (upstream, _submit_rx) = Upstream::new(
            PoolConfig {
                url: addr.to_string(),
                auth: "user".to_string(),
                pass: "x".to_string(),
            },
            events_tx,
        );
        upstream.state.lock().unwrap().session_id = Some("stale-session".to_string());

        let conn = upstream.connect().await.unwrap();
        let _conn = upstream.subscribe(conn).await.unwrap();

        let state = upstream.state.lock().unwrap();
        assert!(state.no_sessionid);
        assert!(state.no_params);
        assert!(state.session_id.is_none());
        assert_eq!(state.enonce1, "c0ffee01");
        assert_eq!(state.nonce2_len, 4);
        drop(state);

        assert_eq!(pool.await.unwrap(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn authorize_consumes_buffered_pushes() {
        let (local, remote) = tokio::io::duplex(8192);
        let (upstream, _submit_rx, _events_rx) = test_upstream();
        let mut conn = Connection::from_stream(local, &upstream.writer).await;
        let mut pool = Framed::new(remote, LinesCodec::new());

        pool.send(notify_line("job-a")).await.unwrap();
        pool.send(
            json!({"id": Value::Null, "method": "mining.set_difficulty", "params": [8.0]})
                .to_string(),
        )
        .await
        .unwrap();
        pool.send(json!({"id": 0, "result": true, "error": Value::Null}).to_string())
            .await
            .unwrap();

        upstream.authorize(&mut conn).await.unwrap();

        let line = pool.next().await.unwrap().unwrap();
        let req: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(req["method"], "mining.authorize");
        assert_eq!(req["params"], json!(["user", "x"]));

        assert_eq!(upstream.jobs.lock().unwrap().len(), 1);
        assert_eq!(upstream.difficulty(), 8.0);
        assert!(upstream.notified.load(Ordering::SeqCst));
        assert!(upstream.diffed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn authorize_rejection_is_an_error() {
        let (local, remote) = tokio::io::duplex(8192);
        let (upstream, _submit_rx, _events_rx) = test_upstream();
        let mut conn = Connection::from_stream(local, &upstream.writer).await;
        let mut pool = Framed::new(remote, LinesCodec::new());

        pool.send(json!({"id": 0, "result": false, "error": Value::Null}).to_string())
            .await
            .unwrap();

        assert!(matches!(
            upstream.authorize(&mut conn).await,
            Err(StratumError::AuthorizeFailed(_))
        ));
    }

    #[tokio::test]
    async fn repeated_difficulty_flags_once() {
        let (upstream, _submit_rx, _events_rx) = test_upstream();
        let diff_line = |d: f64| {
            json!({"id": Value::Null, "method": "mining.set_difficulty", "params": [d]})
                .to_string()
        };

        assert_eq!(upstream.dispatch_method(&diff_line(42.0)).await, Dispatch::Method);
        assert!(upstream.diffed.swap(false, Ordering::SeqCst));

        // Same value again: no new signal.
        assert_eq!(upstream.dispatch_method(&diff_line(42.0)).await, Dispatch::Method);
        assert!(!upstream.diffed.swap(false, Ordering::SeqCst));

        // Zero is ignored outright.
        assert_eq!(upstream.dispatch_method(&diff_line(0.0)).await, Dispatch::Method);
        assert!(!upstream.diffed.swap(false, Ordering::SeqCst));

        assert_eq!(upstream.dispatch_method(&diff_line(64.0)).await, Dispatch::Method);
        assert!(upstream.diffed.swap(false, Ordering::SeqCst));
        assert_eq!(upstream.difficulty(), 64.0);
    }

    #[tokio::test]
    async fn client_reconnect_requests_reconnect() {
        let (upstream, _submit_rx, _events_rx) = test_upstream();
        let line = json!({"id": Value::Null, "method": "client.reconnect", "params": []})
            .to_string();
        assert_eq!(upstream.dispatch_method(&line).await, Dispatch::Reconnect);
    }

    #[tokio::test]
    async fn get_version_is_answered() {
        let (local, remote) = tokio::io::duplex(8192);
        let (upstream, _submit_rx, _events_rx) = test_upstream();
        let _conn = Connection::from_stream(local, &upstream.writer).await;
        let mut pool = Framed::new(remote, LinesCodec::new());

        let line = json!({"id": 9, "method": "client.get_version", "params": []}).to_string();
        assert_eq!(upstream.dispatch_method(&line).await, Dispatch::Method);

        let reply: Value =
            serde_json::from_str(&pool.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["id"], 9);
        assert_eq!(reply["result"], CLIENT_TAG);
        assert_eq!(reply["error"], Value::Null);
    }

    #[tokio::test]
    async fn share_round_trip_rekeys_and_correlates() {
        let (local, remote) = tokio::io::duplex(8192);
        let (upstream, submit_rx, _events_rx) = test_upstream();
        let _conn = Connection::from_stream(local, &upstream.writer).await;
        let mut pool = Framed::new(remote, LinesCodec::new());

        // Four jobs so local job id 3 exists.
        for i in 0..4 {
            let dispatch = upstream.dispatch_method(&notify_line(&format!("up{i}"))).await;
            assert_eq!(dispatch, Dispatch::Method);
        }

        let submission = json!({
            "client_id": 7,
            "msg_id": 42,
            "jobid": 3,
            "nonce2": "00000001",
            "ntime": "504e86b9",
            "nonce": "e2445fbb"
        });
        assert!(upstream.enqueue_share(submission).await);
        assert_eq!(upstream.shares.lock().unwrap().len(), 1);

        tokio::spawn(upstream.clone().send_loop(submit_rx));

        let line = pool.next().await.unwrap().unwrap();
        let req: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(req["method"], "mining.submit");
        assert_eq!(req["id"], 0);
        assert_eq!(
            req["params"],
            json!(["user", "up3", "00000001", "504e86b9", "e2445fbb"])
        );
        assert!(req.get("client_id").is_none());
        assert!(req.get("msg_id").is_none());

        let response = json!({"id": 0, "result": true, "error": Value::Null}).to_string();
        let (share, accepted) = upstream.handle_share_result(&response).unwrap();
        assert_eq!(share.client_id, 7);
        assert_eq!(share.msg_id, 42);
        assert!(accepted);
        assert!(upstream.shares.lock().unwrap().is_empty());

        // A duplicate response no longer matches anything.
        assert!(upstream.handle_share_result(&response).is_none());
    }

    #[tokio::test]
    async fn share_with_unknown_job_is_dropped() {
        let (local, remote) = tokio::io::duplex(8192);
        let (upstream, submit_rx, _events_rx) = test_upstream();
        let _conn = Connection::from_stream(local, &upstream.writer).await;
        let mut pool = Framed::new(remote, LinesCodec::new());

        let dispatch = upstream.dispatch_method(&notify_line("only-job")).await;
        assert_eq!(dispatch, Dispatch::Method);

        // First submission names a job that was never cached; second is good.
        let stale = json!({"client_id": 1, "msg_id": 1, "jobid": 99,
                           "nonce2": "00", "ntime": "504e86b9", "nonce": "00"});
        let good = json!({"client_id": 2, "msg_id": 2, "jobid": 0,
                          "nonce2": "00", "ntime": "504e86b9", "nonce": "00"});
        assert!(upstream.enqueue_share(stale).await);
        assert!(upstream.enqueue_share(good).await);

        tokio::spawn(upstream.clone().send_loop(submit_rx));

        // Only the resolvable share reaches the wire, in FIFO position.
        let line = pool.next().await.unwrap().unwrap();
        let req: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(req["params"][1], "only-job");
        assert_eq!(req["id"], 1);
    }

    #[tokio::test]
    async fn share_submission_requires_client_identity() {
        let (upstream, _submit_rx, _events_rx) = test_upstream();
        let missing = json!({"jobid": 0, "nonce2": "00", "ntime": "504e86b9", "nonce": "00"});
        assert!(!upstream.enqueue_share(missing).await);
        assert!(upstream.shares.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stall_gives_up_after_retry_budget() {
        let (local, _remote) = tokio::io::duplex(64);
        let (upstream, _submit_rx, _events_rx) = test_upstream();
        let mut conn = Connection::from_stream(local, &upstream.writer).await;

        let started = time::Instant::now();
        assert!(upstream.read_with_stall(&mut conn).await.is_none());
        assert!(started.elapsed() >= READ_TIMEOUT * READ_RETRIES);
    }

    #[tokio::test]
    async fn reconnect_flushes_jobs_and_signals_subscribe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let pool = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LinesCodec::new());

            let line = framed.next().await.unwrap().unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(req["method"], "mining.subscribe");
            let reply = json!({
                "id": req["id"],
                "result": [["mining.notify", "s1"], "beef0001", 8],
                "error": Value::Null
            });
            framed.send(reply.to_string()).await.unwrap();

            let line = framed.next().await.unwrap().unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(req["method"], "mining.authorize");
            framed
                .send(json!({"id": req["id"], "result": true, "error": Value::Null}).to_string())
                .await
                .unwrap();
        });

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (upstream, _submit_rx) = Upstream::new(
            PoolConfig {
                url: addr.to_string(),
                auth: "user".to_string(),
                pass: "x".to_string(),
            },
            events_tx,
        );

        // Pretend an old session left work behind.
        let dispatch = upstream.dispatch_method(&notify_line("old-job")).await;
        assert_eq!(dispatch, Dispatch::Method);
        assert_eq!(upstream.jobs.lock().unwrap().len(), 1);

        let conn = upstream.reconnect().await;
        assert!(conn.is_some());
        assert!(upstream.jobs.lock().unwrap().is_empty());
        assert_eq!(events_rx.recv().await, Some(UpstreamEvent::Subscribed));

        let (enonce1, nonce2_len) = upstream.subscribe_info();
        assert_eq!(enonce1, "beef0001");
        assert_eq!(nonce2_len, 8);
        pool.await.unwrap();
    }
}
