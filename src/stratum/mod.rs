//! Stratum v1 client for proxied upstream pools.
//!
//! In proxy mode the generator is a miner as far as the upstream pool is
//! concerned: it subscribes, authorizes, and then holds a long-lived
//! push-driven session. The protocol is JSON-RPC over newline-delimited TCP.
//!
//! # Architecture
//!
//! Everything mutable about one upstream lives in an [`Upstream`], shared by
//! three workers:
//!
//! - the **receive loop** reads pushed methods (`mining.notify`,
//!   `mining.set_difficulty`, `client.*`) and share results, ages the caches,
//!   and reconnects when the pool goes quiet;
//! - the **send loop** drains the share-submission queue, swapping each
//!   share's local job id for the pool's job id on the way out;
//! - the **control server** answers the stratifier's requests from the caches
//!   and feeds the submission queue.
//!
//! Jobs and in-flight shares are indexed by locally assigned monotonic ids,
//! so the stratifier and its miners never observe upstream identifiers.

mod client;
mod connection;
mod error;
mod jobs;
mod messages;
mod shares;

use std::time::Duration;

pub use client::{Dispatch, PoolConfig, SessionState, Upstream};
pub use connection::{Connection, LineRead, WriteHandle};
pub use error::{StratumError, StratumResult};
pub use jobs::NotifyCache;
pub use messages::{find_notify, request, result_of, Notification, UpstreamEvent};
pub use shares::{ShareInFlight, ShareTracker};

/// How we identify ourselves in `mining.subscribe` and `client.get_version`.
pub const CLIENT_TAG: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Per-read timeout on the upstream socket.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive idle reads tolerated before the session is declared stalled;
/// with [`READ_TIMEOUT`] this allows roughly two minutes of silence.
pub const READ_RETRIES: u32 = 24;

/// Delay between reconnection attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Notifications older than this are reaped, newest three excepted.
pub const NOTIFY_EXPIRY_SECS: u64 = 600;

/// Notifications always retained regardless of age, so work survives a quiet
/// spell between blocks.
pub const NOTIFY_KEEP: usize = 3;

/// In-flight shares older than this will never correlate; reaped.
pub const SHARE_EXPIRY_SECS: u64 = 120;

/// Largest extranonce1 we can prefix, in bytes.
pub const MAX_ENONCE1_BYTES: usize = 15;

/// Negotiated nonce2 length bounds; below the minimum there is no room left
/// to re-split the search space across our own miners.
pub const MIN_NONCE2_LEN: usize = 4;
pub const MAX_NONCE2_LEN: usize = 8;

/// Merkle branch entries kept from a notify; deeper branches are truncated.
pub const MAX_MERKLE_BRANCHES: usize = 16;

/// Recursion cap for the notify locator.
pub const MAX_NOTIFY_DEPTH: usize = 32;

/// Bound on the share-submission queue, comfortably above the number of
/// shares that can reasonably be in flight at pool difficulty.
pub const SUBMIT_QUEUE_BOUND: usize = 256;
