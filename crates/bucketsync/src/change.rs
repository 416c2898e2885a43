//! Per-key queues of outbound local changes.
//!
//! A change is the *intent* to bring one object to a target state (or remove
//! it). Operations and source version are stamped when the change is sent,
//! diffed from the ghost at that moment, so a resend after the ghost has
//! advanced is automatically rebased. At most one change per key is in
//! flight; the rest wait as pending.

use std::collections::{HashMap, VecDeque};

use bucketsync_core::OperationSet;
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeKind {
    /// Bring the object to this full target document.
    Modify(Value),
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeState {
    Pending,
    Sent,
}

#[derive(Debug, Clone)]
pub struct LocalChange {
    /// Client change id; stable across resends of the same change.
    pub ccid: String,
    pub key: String,
    pub kind: ChangeKind,
    pub state: ChangeState,
    /// Ghost version the operations were diffed from. Stamped on send.
    pub source_version: u64,
    /// Operations as last sent. Stamped on send.
    pub operations: OperationSet,
    pub sent_at: Option<Instant>,
}

impl LocalChange {
    fn new(key: &str, kind: ChangeKind) -> Self {
        Self {
            ccid: Uuid::new_v4().to_string(),
            key: key.to_string(),
            kind,
            state: ChangeState::Pending,
            source_version: 0,
            operations: OperationSet::new(),
            sent_at: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ChangeQueue {
    queues: HashMap<String, VecDeque<LocalChange>>,
}

impl ChangeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an update. Consecutive pending updates for one key collapse
    /// into a single change carrying the latest target.
    pub fn push_modify(&mut self, key: &str, target: Value) {
        let queue = self.queues.entry(key.to_string()).or_default();
        if let Some(last) = queue.back_mut() {
            if last.state == ChangeState::Pending {
                if let ChangeKind::Modify(_) = last.kind {
                    last.kind = ChangeKind::Modify(target);
                    return;
                }
            }
        }
        queue.push_back(LocalChange::new(key, ChangeKind::Modify(target)));
    }

    /// Queue a removal; pending updates for the key are superseded and
    /// cancelled. Only an already-sent change stays ahead of it.
    pub fn push_remove(&mut self, key: &str) {
        let queue = self.queues.entry(key.to_string()).or_default();
        queue.retain(|c| c.state == ChangeState::Sent);
        if queue.back().is_some_and(|c| c.kind == ChangeKind::Remove) {
            return;
        }
        queue.push_back(LocalChange::new(key, ChangeKind::Remove));
    }

    pub fn head(&self, key: &str) -> Option<&LocalChange> {
        self.queues.get(key).and_then(|q| q.front())
    }

    pub fn head_mut(&mut self, key: &str) -> Option<&mut LocalChange> {
        self.queues.get_mut(key).and_then(|q| q.front_mut())
    }

    /// Every queued change for a key, in-flight head included.
    pub fn all_mut(&mut self, key: &str) -> impl Iterator<Item = &mut LocalChange> {
        self.queues.get_mut(key).into_iter().flatten()
    }

    /// Drop one change by its ccid.
    pub fn drop_ccid(&mut self, key: &str, ccid: &str) {
        if let Some(queue) = self.queues.get_mut(key) {
            queue.retain(|c| c.ccid != ccid);
            if queue.is_empty() {
                self.queues.remove(key);
            }
        }
    }

    /// Acknowledge the in-flight change for `key` if its ccid matches,
    /// removing and returning it.
    pub fn acknowledge(&mut self, key: &str, ccid: &str) -> Option<LocalChange> {
        let queue = self.queues.get_mut(key)?;
        let head = queue.front()?;
        if head.state != ChangeState::Sent || head.ccid != ccid {
            return None;
        }
        let acked = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(key);
        }
        acked
    }

    /// Pop the in-flight change for `key` regardless of acknowledgment
    /// (server rejected it).
    pub fn reject(&mut self, key: &str) -> Option<LocalChange> {
        let queue = self.queues.get_mut(key)?;
        if queue.front()?.state != ChangeState::Sent {
            return None;
        }
        let rejected = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(key);
        }
        rejected
    }

    /// Return every sent change to pending (reconnect).
    pub fn requeue_sent(&mut self) {
        for queue in self.queues.values_mut() {
            for change in queue.iter_mut() {
                if change.state == ChangeState::Sent {
                    change.state = ChangeState::Pending;
                    change.sent_at = None;
                }
            }
        }
    }

    /// Keys whose in-flight change has waited longer than `timeout`; each is
    /// flipped back to pending for a resend.
    pub fn expire_sent(&mut self, timeout: std::time::Duration, now: Instant) -> Vec<String> {
        let mut expired = Vec::new();
        for (key, queue) in &mut self.queues {
            if let Some(head) = queue.front_mut() {
                if head.state == ChangeState::Sent
                    && head
                        .sent_at
                        .is_some_and(|sent| now.duration_since(sent) >= timeout)
                {
                    head.state = ChangeState::Pending;
                    head.sent_at = None;
                    expired.push(key.clone());
                }
            }
        }
        expired
    }

    /// Drop everything queued for a key (the server removed the object).
    pub fn drop_key(&mut self, key: &str) {
        self.queues.remove(key);
    }

    pub fn has_local_changes(&self) -> bool {
        self.queues.values().any(|q| !q.is_empty())
    }

    /// Keys whose head is pending and ready to send.
    pub fn sendable_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.front().is_some_and(|c| c.state == ChangeState::Pending))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}
