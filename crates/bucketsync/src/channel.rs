//! The per-bucket protocol state machine.
//!
//! A channel owns the conversation for one bucket: the `init`/`auth`
//! handshake, the index download, inbound change application (with
//! acknowledgment matching, version gating, and rebasing of queued local
//! edits), and the outbound send/ack/timeout cycle. It talks to the socket
//! only through an outbound frame queue and touches bucket state only
//! through [`BucketShared`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bucketsync_core::{
    apply_object_diff, object_diff, set_from_value, set_to_value, transform_object_diff,
    OperationSet,
};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::bucket::{BucketEvent, BucketShared};
use crate::change::{ChangeKind, ChangeQueue, ChangeState};
use crate::client::{ClientEvent, OutboundFrame};
use crate::error::{Result, SyncError};
use crate::ghost::{Ghost, GhostStore};
use crate::protocol::{
    change_version_request, entity_request, index_request, ChangeRequest, ChannelMessage,
    InitMessage, RemoteChange,
};
use crate::store::BucketObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Authorizing,
    Indexing,
    Ready,
    /// Credentials rejected; the channel stays halted until they refresh.
    Unauthorized,
}

/// Identity and tuning a channel needs to speak for its bucket.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub clientid: String,
    pub app_id: String,
    pub token: String,
    pub api: String,
    pub library: String,
    pub library_version: String,
    pub index_page_size: usize,
    pub send_timeout: Duration,
}

struct RevisionFetch {
    remaining: HashSet<u64>,
    collected: Vec<BucketObject>,
    reply: oneshot::Sender<Vec<BucketObject>>,
}

pub struct Channel {
    number: usize,
    opts: ChannelOptions,
    shared: Arc<BucketShared>,
    ghosts: Arc<dyn GhostStore>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    client_events: mpsc::UnboundedSender<ClientEvent>,
    state: ChannelState,
    changes: ChangeQueue,
    /// Latest change-version checkpoint seen from the server.
    cv: Option<String>,
    /// Ids seen so far during an index download.
    indexed: HashSet<String>,
    /// Change frames for not-yet-indexed ids, replayed when indexing ends.
    deferred: Vec<RemoteChange>,
    /// Outstanding full-object fetches (id -> requested version).
    fetching: HashMap<String, u64>,
    revisions: HashMap<String, RevisionFetch>,
    has_indexed: bool,
    username: Option<String>,
}

impl Channel {
    pub fn new(
        number: usize,
        opts: ChannelOptions,
        shared: Arc<BucketShared>,
        ghosts: Arc<dyn GhostStore>,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
        client_events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        Self {
            number,
            opts,
            shared,
            ghosts,
            outbound,
            client_events,
            state: ChannelState::Disconnected,
            changes: ChangeQueue::new(),
            cv: None,
            indexed: HashSet::new(),
            deferred: Vec::new(),
            fetching: HashMap::new(),
            revisions: HashMap::new(),
            has_indexed: false,
            username: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn has_local_changes(&self) -> bool {
        self.changes.has_local_changes()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    fn send_frame(&self, body: String) {
        let _ = self.outbound.send(OutboundFrame {
            channel: self.number,
            body,
        });
    }

    fn emit(&self, event: BucketEvent) {
        let _ = self.shared.events.send(event);
    }

    /// Begin (or restart) the handshake after a connection is established.
    /// In-flight changes return to pending and are re-sent once the channel
    /// is ready again.
    pub async fn start(&mut self) -> Result<()> {
        self.state = ChannelState::Authorizing;
        self.changes.requeue_sent();
        self.fetching.clear();
        let init = InitMessage {
            clientid: self.opts.clientid.clone(),
            api: self.opts.api.clone(),
            app_id: self.opts.app_id.clone(),
            token: self.opts.token.clone(),
            name: self.shared.name.clone(),
            library: self.opts.library.clone(),
            version: self.opts.library_version.clone(),
        };
        let body = serde_json::to_string(&init)
            .map_err(|e| SyncError::Protocol(format!("init encode: {e}")))?;
        self.send_frame(format!("init:{body}"));
        Ok(())
    }

    pub async fn handle_message(&mut self, message: ChannelMessage) -> Result<()> {
        match message {
            ChannelMessage::Auth(user) => self.handle_auth(user).await,
            ChannelMessage::Index(page) => self.handle_index(page).await,
            ChannelMessage::Changes(changes) => self.handle_changes(changes).await,
            ChannelMessage::ChangeError => {
                warn!(bucket = %self.shared.name, "server rejected change frame");
                self.emit(BucketEvent::Error {
                    message: "server rejected change frame".into(),
                });
                Ok(())
            }
            ChannelMessage::Entity { id, version, data } => {
                self.handle_entity(id, version, data).await
            }
            ChannelMessage::ChangeVersion(body) => {
                if body == "?" {
                    debug!(bucket = %self.shared.name, "change version unknown, reindexing");
                    self.cv = None;
                    self.begin_index();
                }
                Ok(())
            }
            ChannelMessage::Log(level) => {
                let _ = self.client_events.send(ClientEvent::LogLevel(level));
                Ok(())
            }
        }
    }

    async fn handle_auth(&mut self, user: String) -> Result<()> {
        if user == "expired" {
            warn!(bucket = %self.shared.name, "authorization expired");
            self.state = ChannelState::Unauthorized;
            let _ = self.client_events.send(ClientEvent::Unauthorized);
            self.emit(BucketEvent::Error {
                message: "authorization expired".into(),
            });
            return Ok(());
        }
        debug!(bucket = %self.shared.name, user = %user, "authorized");
        self.username = Some(user.clone());
        let _ = self.client_events.send(ClientEvent::Authorize { user });

        if self.has_indexed {
            if let Some(cv) = self.cv.clone() {
                // Resume from the known checkpoint; the server streams the
                // changes we missed, or answers `cv:?` to force a reindex.
                self.state = ChannelState::Ready;
                self.send_frame(change_version_request(&cv));
                return self.send_all_pending().await;
            }
        }
        self.begin_index();
        Ok(())
    }

    fn begin_index(&mut self) {
        self.state = ChannelState::Indexing;
        self.indexed.clear();
        self.deferred.clear();
        self.emit(BucketEvent::Indexing);
        self.send_frame(index_request(None, self.opts.index_page_size));
    }

    async fn handle_index(&mut self, page: crate::protocol::IndexPage) -> Result<()> {
        if self.state != ChannelState::Indexing {
            return Err(SyncError::Protocol(
                "index page outside of index download".into(),
            ));
        }
        if let Some(cv) = page.current.clone() {
            self.cv = Some(cv);
        }
        for entry in page.index {
            self.indexed.insert(entry.id.clone());
            match entry.d {
                Some(data) => {
                    self.ghosts
                        .put(Ghost {
                            key: entry.id.clone(),
                            version: entry.v,
                            data: data.clone(),
                        })
                        .await?;
                    self.shared.store.update(&entry.id, data.clone(), true).await?;
                    self.emit(BucketEvent::Update {
                        id: entry.id,
                        data,
                        original: None,
                        patch: None,
                        is_indexing: true,
                    });
                }
                None => {
                    // Data-less entry; pull the full object.
                    self.request_entity(&entry.id, entry.v);
                }
            }
        }
        match page.mark {
            Some(mark) if !mark.is_empty() => {
                self.send_frame(index_request(Some(&mark), self.opts.index_page_size));
                Ok(())
            }
            _ => self.finish_index().await,
        }
    }

    async fn finish_index(&mut self) -> Result<()> {
        debug!(bucket = %self.shared.name, objects = self.indexed.len(), "index complete");
        self.state = ChannelState::Ready;
        self.has_indexed = true;
        self.emit(BucketEvent::Index);
        let deferred = std::mem::take(&mut self.deferred);
        for change in deferred {
            self.apply_or_recover(change).await;
        }
        self.send_all_pending().await
    }

    async fn handle_changes(&mut self, changes: Vec<RemoteChange>) -> Result<()> {
        for change in changes {
            if let Some(code) = change.error {
                self.handle_change_error(&change, code);
                continue;
            }
            if self.state == ChannelState::Indexing && !self.indexed.contains(&change.id) {
                // Unknown id mid-index: hold the change until the download
                // has either seen the object or finished without it.
                self.deferred.push(change);
                continue;
            }
            self.apply_or_recover(change).await;
        }
        Ok(())
    }

    fn handle_change_error(&mut self, change: &RemoteChange, code: i64) {
        warn!(bucket = %self.shared.name, id = %change.id, code, "server rejected change");
        if let Some(ccid) = &change.ccid {
            let head_matches = self
                .changes
                .head(&change.id)
                .is_some_and(|head| head.state == ChangeState::Sent && &head.ccid == ccid);
            if head_matches {
                self.changes.reject(&change.id);
            }
        }
        self.emit(BucketEvent::Error {
            message: format!("change for {} rejected with code {code}", change.id),
        });
    }

    /// Apply one inbound change; on a malformed or inapplicable diff, drop
    /// it and fall back to a full object fetch.
    async fn apply_or_recover(&mut self, change: RemoteChange) {
        let id = change.id.clone();
        let ev = change.ev;
        if let Err(err) = self.apply_remote_change(change).await {
            warn!(bucket = %self.shared.name, id = %id, %err, "dropping change, resyncing key");
            self.emit(BucketEvent::Error {
                message: err.to_string(),
            });
            if let Some(ev) = ev {
                self.request_entity(&id, ev);
            }
        }
    }

    async fn apply_remote_change(&mut self, change: RemoteChange) -> Result<()> {
        let id = change.id.clone();
        if let Some(cv) = change.cv.clone() {
            self.cv = Some(cv);
        }
        let ghost = self.ghosts.get(&id).await?;
        let ghost_version = ghost.as_ref().map(|g| g.version).unwrap_or(0);
        let op = change
            .o
            .as_deref()
            .ok_or_else(|| SyncError::Protocol("change without operation kind".into()))?;

        if op == "-" {
            return self.apply_remote_remove(&id, change.ccid.as_deref(), ghost).await;
        }
        if op != "M" {
            return Err(SyncError::Protocol(format!("unknown change kind {op:?}")));
        }

        let ev = change
            .ev
            .ok_or_else(|| SyncError::Protocol("modify change without end version".into()))?;
        if ev <= ghost_version {
            trace!(bucket = %self.shared.name, id = %id, ev, ghost_version, "discarding replay");
            return Ok(());
        }

        // One of ours coming back: advance the ghost by the operations we
        // sent and move on to the next queued change for the key.
        if let Some(ccid) = &change.ccid {
            if let Some(acked) = self.changes.acknowledge(&id, ccid) {
                let base = ghost
                    .map(|g| g.data)
                    .unwrap_or_else(|| Value::Object(Map::new()));
                let data = apply_object_diff(&acked.operations, &base)?;
                debug!(bucket = %self.shared.name, id = %id, ev, "change acknowledged");
                self.ghosts
                    .put(Ghost {
                        key: id.clone(),
                        version: ev,
                        data: data.clone(),
                    })
                    .await?;
                // A remote change may have overwritten the store with the
                // server state while this change was in flight; converge the
                // store back to the acknowledged (merged) value.
                let stored = self.shared.store.get(&id).await?;
                if stored.as_ref().map(|s| &s.data) != Some(&data) {
                    self.shared.store.update(&id, data.clone(), false).await?;
                    self.emit(BucketEvent::Update {
                        id: id.clone(),
                        data,
                        original: None,
                        patch: None,
                        is_indexing: false,
                    });
                }
                return self.send_next(&id).await;
            }
        }

        let sv = change.sv.unwrap_or(0);
        if sv != ghost_version {
            debug!(
                bucket = %self.shared.name, id = %id, sv, ghost_version,
                "source version mismatch, fetching full object"
            );
            self.request_entity(&id, ev);
            return Ok(());
        }

        let ops_value = change
            .v
            .ok_or_else(|| SyncError::Protocol("modify change without operations".into()))?;
        let ops = set_from_value(&ops_value)?;
        let base = ghost
            .map(|g| g.data)
            .unwrap_or_else(|| Value::Object(Map::new()));
        let upstream_applied = apply_object_diff(&ops, &base)?;

        let stored = self.shared.store.get(&id).await?;
        let original = self
            .shared
            .resolve_original(&id, stored.as_ref().map(|s| &s.data));

        let resend = self.rebase_local_changes(&id, &base, &ops, &upstream_applied);

        self.ghosts
            .put(Ghost {
                key: id.clone(),
                version: ev,
                data: upstream_applied.clone(),
            })
            .await?;
        let is_indexing = self.state == ChannelState::Indexing;
        self.shared
            .store
            .update(&id, upstream_applied.clone(), is_indexing)
            .await?;
        self.emit(BucketEvent::Update {
            id: id.clone(),
            data: upstream_applied,
            original,
            patch: Some(ops),
            is_indexing,
        });

        if resend {
            self.send_next(&id).await?;
        }
        Ok(())
    }

    async fn apply_remote_remove(
        &mut self,
        id: &str,
        ccid: Option<&str>,
        ghost: Option<Ghost>,
    ) -> Result<()> {
        if let Some(ccid) = ccid {
            if self.changes.acknowledge(id, ccid).is_some() {
                debug!(bucket = %self.shared.name, id = %id, "removal acknowledged");
                self.ghosts.remove(id).await?;
                return self.send_next(id).await;
            }
        }
        let stored = self.shared.store.get(id).await?;
        if ghost.is_none() && stored.is_none() {
            // Replayed removal of an object we never had.
            return Ok(());
        }
        self.ghosts.remove(id).await?;
        self.shared.store.remove(id).await?;
        // The server removed the object; local edits for it lose.
        self.changes.drop_key(id);
        self.emit(BucketEvent::Remove { id: id.to_string() });
        Ok(())
    }

    /// Rebase every queued local change for `id` over an applied upstream
    /// change. Changes whose rebased diff is empty are dropped; an in-flight
    /// change returns to pending for a fresh send against the new ghost.
    /// Returns whether a send should follow.
    fn rebase_local_changes(
        &mut self,
        id: &str,
        base: &Value,
        upstream: &OperationSet,
        upstream_applied: &Value,
    ) -> bool {
        let mut dropped: Vec<String> = Vec::new();
        let mut resend = false;
        for local in self.changes.all_mut(id) {
            if let ChangeKind::Modify(target) = &mut local.kind {
                let local_ops = match (base.as_object(), target.as_object()) {
                    (Some(b), Some(t)) => object_diff(b, t),
                    _ => OperationSet::new(),
                };
                let rebased = transform_object_diff(&local_ops, upstream, base);
                if rebased.is_empty() {
                    dropped.push(local.ccid.clone());
                    continue;
                }
                match apply_object_diff(&rebased, upstream_applied) {
                    Ok(next) => *target = next,
                    Err(err) => {
                        warn!(bucket = %self.shared.name, id = %id, %err, "dropping unrebaseable local change");
                        dropped.push(local.ccid.clone());
                        continue;
                    }
                }
            }
            if local.state == ChangeState::Sent {
                local.state = ChangeState::Pending;
                local.sent_at = None;
            }
            resend = true;
        }
        for ccid in dropped {
            self.changes.drop_ccid(id, &ccid);
        }
        resend && self.changes.head(id).is_some()
    }

    fn request_entity(&mut self, id: &str, version: u64) {
        if self.fetching.get(id) == Some(&version) {
            return;
        }
        self.fetching.insert(id.to_string(), version);
        self.send_frame(entity_request(id, version));
    }

    async fn handle_entity(&mut self, id: String, version: u64, data: Option<Value>) -> Result<()> {
        let mut data = data;

        // Revision fetches share the entity command; match those first.
        let mut consumed = false;
        let mut revisions_done = false;
        if let Some(fetch) = self.revisions.get_mut(&id) {
            if fetch.remaining.remove(&version) {
                consumed = true;
                if let Some(d) = data.take() {
                    fetch.collected.push(BucketObject {
                        id: id.clone(),
                        data: d,
                        version,
                    });
                }
                revisions_done = fetch.remaining.is_empty();
            }
        }
        if consumed {
            if revisions_done {
                if let Some(mut fetch) = self.revisions.remove(&id) {
                    fetch.collected.sort_by(|a, b| b.version.cmp(&a.version));
                    let _ = fetch.reply.send(fetch.collected);
                }
            }
            return Ok(());
        }

        if self.fetching.remove(&id).is_none() {
            trace!(bucket = %self.shared.name, id = %id, "unsolicited entity response");
            return Ok(());
        }
        match data {
            None => {
                self.emit(BucketEvent::Error {
                    message: format!("object {id} unavailable at version {version}"),
                });
                Ok(())
            }
            Some(data) => {
                debug!(bucket = %self.shared.name, id = %id, version, "ghost reset from full object");
                self.ghosts
                    .put(Ghost {
                        key: id.clone(),
                        version,
                        data: data.clone(),
                    })
                    .await?;
                self.shared.store.update(&id, data.clone(), false).await?;
                self.emit(BucketEvent::Update {
                    id: id.clone(),
                    data,
                    original: None,
                    patch: None,
                    is_indexing: false,
                });
                // Queued local edits re-diff against the fresh ghost on send.
                self.send_next(&id).await
            }
        }
    }

    // ── Outbound ──────────────────────────────────────────────────────────

    /// Queue a local update and send it if the key has nothing in flight.
    pub async fn local_modify(&mut self, id: &str, target: Value) -> Result<()> {
        self.changes.push_modify(id, target);
        self.send_next(id).await
    }

    /// Queue a local removal, cancelling pending updates for the key.
    pub async fn local_remove(&mut self, id: &str) -> Result<()> {
        self.changes.push_remove(id);
        self.send_next(id).await
    }

    /// Send the head change for `key` when it is pending and the channel is
    /// ready. Operations and source version are stamped here, from the ghost
    /// as it is right now.
    async fn send_next(&mut self, key: &str) -> Result<()> {
        if self.state != ChannelState::Ready {
            return Ok(());
        }
        loop {
            let Some(head) = self.changes.head(key).cloned() else {
                return Ok(());
            };
            if head.state != ChangeState::Pending {
                return Ok(());
            }
            let ghost = self.ghosts.get(key).await?;
            let (ghost_version, ghost_data) = ghost
                .map(|g| (g.version, g.data))
                .unwrap_or((0, Value::Object(Map::new())));

            let (o, v, ops) = match &head.kind {
                ChangeKind::Modify(target) => {
                    let ops = match (ghost_data.as_object(), target.as_object()) {
                        (Some(b), Some(t)) => object_diff(b, t),
                        _ => OperationSet::new(),
                    };
                    if ops.is_empty() {
                        // Rebasing or compression made this a no-op.
                        trace!(bucket = %self.shared.name, id = %key, "dropping empty change");
                        self.changes.drop_ccid(key, &head.ccid);
                        continue;
                    }
                    ("M", Some(set_to_value(&ops)), ops)
                }
                ChangeKind::Remove => ("-", None, OperationSet::new()),
            };

            let request = ChangeRequest {
                clientid: self.opts.clientid.clone(),
                id: key.to_string(),
                o: o.to_string(),
                v,
                sv: ghost_version,
                ccid: head.ccid.clone(),
            };
            let body = serde_json::to_string(&request)
                .map_err(|e| SyncError::Protocol(format!("change encode: {e}")))?;

            if let Some(head) = self.changes.head_mut(key) {
                head.operations = ops;
                head.source_version = ghost_version;
                head.state = ChangeState::Sent;
                head.sent_at = Some(Instant::now());
            }
            debug!(bucket = %self.shared.name, id = %key, sv = ghost_version, "sending change");
            self.send_frame(format!("c:{body}"));
            return Ok(());
        }
    }

    async fn send_all_pending(&mut self) -> Result<()> {
        for key in self.changes.sendable_keys() {
            self.send_next(&key).await?;
        }
        Ok(())
    }

    /// Flip timed-out in-flight changes back to pending and re-send them.
    pub async fn check_timeouts(&mut self) -> Result<()> {
        let expired = self
            .changes
            .expire_sent(self.opts.send_timeout, Instant::now());
        for key in expired {
            debug!(bucket = %self.shared.name, id = %key, "change timed out, resending");
            self.send_next(&key).await?;
        }
        Ok(())
    }

    /// Drop index state and re-download the bucket.
    pub async fn reload(&mut self) -> Result<()> {
        if matches!(self.state, ChannelState::Ready | ChannelState::Indexing) {
            self.begin_index();
        }
        Ok(())
    }

    /// Fetch every prior revision of an object; resolves once all entity
    /// responses (or unknowns) have arrived.
    pub async fn request_revisions(
        &mut self,
        id: &str,
        reply: oneshot::Sender<Vec<BucketObject>>,
    ) -> Result<()> {
        let current = self.ghosts.version(id).await?;
        if current <= 1 {
            let _ = reply.send(Vec::new());
            return Ok(());
        }
        let remaining: HashSet<u64> = (1..current).collect();
        for version in 1..current {
            self.send_frame(entity_request(id, version));
        }
        self.revisions.insert(
            id.to_string(),
            RevisionFetch {
                remaining,
                collected: Vec::new(),
                reply,
            },
        );
        Ok(())
    }
}
