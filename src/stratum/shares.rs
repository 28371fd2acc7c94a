//! Tracker for shares submitted upstream and awaiting a verdict.
//!
//! A share arrives from the stratifier carrying the submitting client's id
//! and that client's stratum message id. Both are recorded here under a fresh
//! local id, which rides along as the JSON-RPC request id of the
//! `mining.submit`, so the pool's asynchronous response can be matched back
//! to the originating miner.

use std::collections::BTreeMap;

use super::SHARE_EXPIRY_SECS;

/// Correlation record for one outstanding upstream submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareInFlight {
    /// The stratifier client that produced the share
    pub client_id: i64,

    /// The stratum message id as seen by that client
    pub msg_id: i64,

    /// Submit timestamp, unix seconds
    pub submitted: u64,
}

/// Outstanding submissions keyed by local share id.
#[derive(Default)]
pub struct ShareTracker {
    entries: BTreeMap<u64, ShareInFlight>,
    next_id: u64,
}

impl ShareTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a submission and return its local id.
    pub fn track(&mut self, client_id: i64, msg_id: i64, now: u64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            ShareInFlight {
                client_id,
                msg_id,
                submitted: now,
            },
        );
        id
    }

    /// Match an upstream response to its submission, removing the record.
    ///
    /// `None` means the entry was already reaped or never existed; the caller
    /// logs and drops the late response.
    pub fn resolve(&mut self, id: u64) -> Option<ShareInFlight> {
        self.entries.remove(&id)
    }

    /// Drop entries that have waited too long; no correlation will succeed
    /// afterwards.
    pub fn reap(&mut self, now: u64) {
        self.entries
            .retain(|_, share| now.saturating_sub(share.submitted) <= SHARE_EXPIRY_SECS);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_and_resolve() {
        let mut tracker = ShareTracker::new();
        let a = tracker.track(7, 42, 1000);
        let b = tracker.track(7, 43, 1001);
        assert_eq!(a, 0);
        assert_eq!(b, 1);

        let share = tracker.resolve(a).unwrap();
        assert_eq!(share.client_id, 7);
        assert_eq!(share.msg_id, 42);
        // A second response for the same id is a miss.
        assert_eq!(tracker.resolve(a), None);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn reap_is_unconditional_after_expiry() {
        let mut tracker = ShareTracker::new();
        let a = tracker.track(1, 1, 1000);
        let b = tracker.track(2, 2, 1050);

        // Exactly at the boundary nothing is dropped.
        tracker.reap(1000 + SHARE_EXPIRY_SECS);
        assert_eq!(tracker.len(), 2);

        tracker.reap(1000 + SHARE_EXPIRY_SECS + 1);
        assert_eq!(tracker.resolve(a), None);
        assert!(tracker.resolve(b).is_some());
    }

    #[test]
    fn reap_even_when_nearly_empty() {
        let mut tracker = ShareTracker::new();
        tracker.track(1, 1, 0);
        tracker.reap(SHARE_EXPIRY_SECS + 1);
        assert!(tracker.is_empty());
    }
}
