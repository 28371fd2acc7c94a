//! Wire-level message handling for the upstream stratum session.
//!
//! Stratum is JSON-RPC over newline-delimited TCP. This module builds
//! outbound requests, extracts results from responses, locates the
//! `mining.notify` descriptor that pools bury at varying array depths in
//! their subscribe responses, and decodes job notifications.

use serde_json::{json, Value};

use super::error::{StratumError, StratumResult};
use super::{MAX_MERKLE_BRANCHES, MAX_NOTIFY_DEPTH};
use crate::tracing::prelude::*;

/// Build a JSON-RPC request object.
pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({ "id": id, "method": method, "params": params })
}

/// Extract the `result` sub-value of a decoded response.
///
/// Returns `None` when the result is absent or null, logging whatever the
/// `error` member carries.
pub fn result_of(val: &Value) -> Option<&Value> {
    let result = val.get("result").filter(|r| !r.is_null());
    if result.is_none() {
        match val.get("error") {
            Some(err) => warn!(error = %err, "JSON-RPC decode failed"),
            None => warn!("JSON-RPC decode failed: (unknown reason)"),
        }
    }
    result
}

/// Search a JSON value for the `mining.notify` descriptor.
///
/// Pools bury the notify tuple at various array depths in their subscribe
/// responses, so search recursively for an array whose first element names
/// the method. Depth is capped to keep a hostile response from recursing
/// unboundedly.
pub fn find_notify(val: &Value) -> Option<&Value> {
    find_notify_at(val, 0)
}

fn find_notify_at(val: &Value, depth: usize) -> Option<&Value> {
    if depth > MAX_NOTIFY_DEPTH {
        return None;
    }
    let arr = val.as_array()?;
    let named = arr
        .first()
        .and_then(Value::as_str)
        .and_then(|s| s.get(.."mining.notify".len()))
        .map(|prefix| prefix.eq_ignore_ascii_case("mining.notify"))
        .unwrap_or(false);
    if named {
        return Some(val);
    }
    arr.iter().find_map(|v| find_notify_at(v, depth + 1))
}

/// A decoded `mining.notify` job.
///
/// All hex fields are kept as the opaque strings the pool sent; the
/// stratifier reassembles work from them without this process ever parsing
/// block structure. `id` is the locally assigned job id, set when the
/// notification enters the cache.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Locally assigned id, monotonic per upstream
    pub id: u64,

    /// The upstream pool's opaque job identifier
    pub job_id: String,

    /// Previous block hash, 64 hex chars
    pub prevhash: String,

    /// Coinbase prefix
    pub coinbase1: String,

    /// Coinbase suffix
    pub coinbase2: String,

    /// Merkle branch, 0..=16 entries of 64 hex chars
    pub merkles: Vec<String>,

    /// Block version bits, 8 hex chars
    pub bbversion: String,

    /// Encoded difficulty target, 8 hex chars
    pub nbits: String,

    /// Block timestamp, 8 hex chars
    pub ntime: String,

    /// Whether the pool wants outstanding work discarded
    pub clean: bool,

    /// Receive timestamp, unix seconds; set on cache insert
    pub received: u64,
}

fn string_field(params: &[Value], index: usize, name: &str) -> StratumResult<String> {
    params
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StratumError::InvalidMessage(format!("notify missing {name}")))
}

fn fixed_field(params: &[Value], index: usize, name: &str, len: usize) -> StratumResult<String> {
    let s = string_field(params, index, name)?;
    if s.len() != len {
        return Err(StratumError::InvalidMessage(format!(
            "notify {name} is {} chars, expected {len}",
            s.len()
        )));
    }
    Ok(s)
}

impl Notification {
    /// Decode the positional params of a `mining.notify`.
    ///
    /// Layout: `[jobid, prevhash, coinbase1, coinbase2, merkle-array,
    /// bbversion, nbits, ntime, clean]`. The seven string fields are
    /// mandatory; a merkle branch beyond 16 entries is truncated.
    pub fn from_params(params: &Value) -> StratumResult<Notification> {
        let arr = params
            .as_array()
            .ok_or_else(|| StratumError::InvalidMessage("notify params not an array".to_string()))?;
        let branches = arr
            .get(4)
            .and_then(Value::as_array)
            .ok_or_else(|| StratumError::InvalidMessage("notify merkle field not an array".to_string()))?;

        let mut merkles = Vec::with_capacity(branches.len().min(MAX_MERKLE_BRANCHES));
        for (i, branch) in branches.iter().enumerate() {
            if i >= MAX_MERKLE_BRANCHES {
                warn!(
                    merkles = branches.len(),
                    "notify merkle branch too deep, truncating"
                );
                break;
            }
            let s = branch
                .as_str()
                .ok_or_else(|| StratumError::InvalidMessage("merkle entry not a string".to_string()))?;
            if s.len() != 64 {
                return Err(StratumError::InvalidMessage(format!(
                    "merkle entry is {} chars, expected 64",
                    s.len()
                )));
            }
            merkles.push(s.to_string());
        }

        Ok(Notification {
            id: 0,
            job_id: string_field(arr, 0, "jobid")?,
            prevhash: fixed_field(arr, 1, "prevhash", 64)?,
            coinbase1: string_field(arr, 2, "coinbase1")?,
            coinbase2: string_field(arr, 3, "coinbase2")?,
            merkles,
            bbversion: fixed_field(arr, 5, "bbversion", 8)?,
            nbits: fixed_field(arr, 6, "nbits", 8)?,
            ntime: fixed_field(arr, 7, "ntime", 8)?,
            clean: arr.get(8).and_then(Value::as_bool).unwrap_or(false),
            received: 0,
        })
    }

    /// Serialize for the stratifier, with our own job id in place of the
    /// upstream one for easy lookup on submit.
    pub fn to_local_json(&self) -> Value {
        json!({
            "jobid": self.id,
            "prevhash": self.prevhash,
            "coinbase1": self.coinbase1,
            "coinbase2": self.coinbase2,
            "merklehash": self.merkles,
            "bbversion": self.bbversion,
            "nbit": self.nbits,
            "ntime": self.ntime,
            "clean": self.clean,
        })
    }
}

/// Events pushed from the upstream session to the mode loop, which relays
/// them to the stratifier.
#[derive(Debug, PartialEq)]
pub enum UpstreamEvent {
    /// Subscription (re-)established; extranonce parameters may have changed
    Subscribed,

    /// A new job entered the notification cache
    Notify,

    /// The pool changed our share difficulty
    Diff,

    /// The pool answered one of our share submissions
    ShareResult {
        client_id: i64,
        msg_id: i64,
        accepted: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notify_params() -> Value {
        json!([
            "ab12",
            "4d16b6f85af6e2198f44ae2a6de67f78487ae5611b77c6c0440b921e00000000",
            "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff20020862062f503253482f04b8864e5008",
            "072f736c7573682f000000000100f2052a010000001976a914d23fcdf86f7e756a64a7a9688ef9903327048ed988ac00000000",
            ["6b3d8bd6ae1590a99cd2d31ccad64e0f66bc3d38a83a96c9b4b2d2fe50f43f78"],
            "00000002",
            "1c2ac4af",
            "504e86b9",
            false
        ])
    }

    #[test]
    fn decodes_notify_params() {
        let n = Notification::from_params(&notify_params()).unwrap();
        assert_eq!(n.job_id, "ab12");
        assert_eq!(n.prevhash.len(), 64);
        assert_eq!(n.merkles.len(), 1);
        assert_eq!(n.bbversion, "00000002");
        assert_eq!(n.nbits, "1c2ac4af");
        assert_eq!(n.ntime, "504e86b9");
        assert!(!n.clean);
    }

    #[test]
    fn notify_roundtrip_preserves_hex_fields() {
        let params = notify_params();
        let n = Notification::from_params(&params).unwrap();
        let local = n.to_local_json();
        assert_eq!(local["prevhash"], params[1]);
        assert_eq!(local["coinbase1"], params[2]);
        assert_eq!(local["coinbase2"], params[3]);
        assert_eq!(local["merklehash"], params[4]);
        assert_eq!(local["bbversion"], params[5]);
        assert_eq!(local["nbit"], params[6]);
        assert_eq!(local["ntime"], params[7]);
    }

    #[test]
    fn notify_requires_all_string_fields() {
        for index in [0, 1, 2, 3, 5, 6, 7] {
            let mut params = notify_params();
            params[index] = Value::Null;
            assert!(
                Notification::from_params(&params).is_err(),
                "field {index} should be mandatory"
            );
        }
    }

    #[test]
    fn notify_rejects_short_prevhash() {
        let mut params = notify_params();
        params[1] = json!("deadbeef");
        assert!(Notification::from_params(&params).is_err());
    }

    #[test]
    fn notify_truncates_merkle_overflow() {
        let mut params = notify_params();
        let branch = params[4][0].clone();
        params[4] = Value::Array(vec![branch; 20]);
        let n = Notification::from_params(&params).unwrap();
        assert_eq!(n.merkles.len(), MAX_MERKLE_BRANCHES);
    }

    #[test]
    fn finds_notify_at_top_level() {
        let val = json!(["mining.notify", "session-id"]);
        assert!(find_notify(&val).is_some());
    }

    #[test]
    fn finds_notify_nested_one_deeper() {
        let val = json!([
            [["mining.set_difficulty", "a"], ["mining.notify", "b"]],
            "08000002",
            4
        ]);
        let found = find_notify(&val).unwrap();
        assert_eq!(found[0], "mining.notify");
        assert_eq!(found[1], "b");
    }

    #[test]
    fn find_notify_absent() {
        let val = json!([["mining.set_difficulty", "a"], "08000002", 4]);
        assert!(find_notify(&val).is_none());
    }

    #[test]
    fn find_notify_depth_capped() {
        let mut val = json!(["mining.notify", "deep"]);
        for _ in 0..(MAX_NOTIFY_DEPTH + 2) {
            val = json!([val]);
        }
        assert!(find_notify(&val).is_none());
    }

    #[test]
    fn request_shape() {
        let req = request(7, "mining.subscribe", json!(["tag"]));
        assert_eq!(req["id"], 7);
        assert_eq!(req["method"], "mining.subscribe");
        assert_eq!(req["params"], json!(["tag"]));
    }

    #[test]
    fn result_of_null_on_error() {
        let val = json!({"id": 1, "result": null, "error": [20, "other", null]});
        assert!(result_of(&val).is_none());

        let val = json!({"id": 1, "result": true, "error": null});
        assert_eq!(result_of(&val), Some(&json!(true)));
    }
}
