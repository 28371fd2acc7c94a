//! Cache of upstream job notifications.
//!
//! Every decoded `mining.notify` is stored under a locally assigned
//! monotonic id; the stratifier and its miners only ever see that id, and the
//! send loop maps it back to the upstream job id at submit time. Insertion
//! order doubles as age order, so reaping walks from the front.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::messages::Notification;
use super::{NOTIFY_EXPIRY_SECS, NOTIFY_KEEP};

/// Insertion-ordered store of received jobs with a most-recent pointer.
#[derive(Default)]
pub struct NotifyCache {
    entries: BTreeMap<u64, Arc<Notification>>,
    current: Option<Arc<Notification>>,
    next_id: u64,
}

impl NotifyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next id, publish the notification, and make it current.
    pub fn insert(&mut self, mut notification: Notification, now: u64) -> Arc<Notification> {
        notification.id = self.next_id;
        notification.received = now;
        self.next_id += 1;
        let notification = Arc::new(notification);
        self.entries.insert(notification.id, notification.clone());
        self.current = Some(notification.clone());
        notification
    }

    /// The most recently inserted notification, if any.
    pub fn current(&self) -> Option<Arc<Notification>> {
        self.current.clone()
    }

    /// Map a local job id back to the upstream pool's job id.
    pub fn upstream_job_id(&self, id: u64) -> Option<String> {
        self.entries.get(&id).map(|n| n.job_id.clone())
    }

    /// Drop expired entries, always retaining the newest few so work remains
    /// available after a quiet period.
    pub fn reap(&mut self, now: u64) {
        while self.entries.len() > NOTIFY_KEEP {
            let stale = self
                .entries
                .first_key_value()
                .map(|(_, oldest)| now.saturating_sub(oldest.received) > NOTIFY_EXPIRY_SECS)
                .unwrap_or(false);
            if !stale {
                break;
            }
            self.entries.pop_first();
        }
    }

    /// Discard everything. All cached work is invalid after a reconnect.
    pub fn flush(&mut self) {
        self.entries.clear();
        self.current = None;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
