//! The application-facing bucket: a facade over the local store and one
//! sync channel.

use std::sync::{Arc, Mutex};

use bucketsync_core::OperationSet;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::client::Command;
use crate::error::{Result, SyncError};
use crate::ghost::GhostStore;
use crate::store::{BucketObject, BucketStore, StoredObject};

/// Events a bucket emits to the application.
#[derive(Debug, Clone)]
pub enum BucketEvent {
    /// The initial index download started.
    Indexing,
    /// The index download completed; the local store reflects the server.
    Index,
    /// An object changed, locally or from the network. `patch` carries the
    /// applied operations for network changes; `original` the local value
    /// before the change was applied.
    Update {
        id: String,
        data: Value,
        original: Option<Value>,
        patch: Option<OperationSet>,
        is_indexing: bool,
    },
    Remove {
        id: String,
    },
    Error {
        message: String,
    },
}

/// Application hook consulted before a network change is applied; returns
/// the local-known value, or `None` to fall back to the store copy.
pub type ChangeResolver = Box<dyn Fn(&str, Option<&Value>) -> Option<Value> + Send + Sync>;

/// State shared between the bucket handle and its channel: the local store,
/// the event channel, and the change resolver. The channel reaches bucket
/// state only through this struct, never through the facade.
pub struct BucketShared {
    pub name: String,
    pub store: Arc<dyn BucketStore>,
    pub events: mpsc::UnboundedSender<BucketEvent>,
    pub resolver: Mutex<Option<ChangeResolver>>,
}

impl BucketShared {
    /// The local-known value for an id, via the resolver when installed.
    pub fn resolve_original(&self, id: &str, stored: Option<&Value>) -> Option<Value> {
        let guard = self.resolver.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(resolver) => resolver(id, stored).or_else(|| stored.cloned()),
            None => stored.cloned(),
        }
    }
}

/// Handle for one named bucket.
pub struct Bucket {
    shared: Arc<BucketShared>,
    ghosts: Arc<dyn GhostStore>,
    channel: usize,
    commands: mpsc::UnboundedSender<Command>,
    events: Option<mpsc::UnboundedReceiver<BucketEvent>>,
}

impl Bucket {
    pub(crate) fn new(
        shared: Arc<BucketShared>,
        ghosts: Arc<dyn GhostStore>,
        channel: usize,
        commands: mpsc::UnboundedSender<Command>,
        events: mpsc::UnboundedReceiver<BucketEvent>,
    ) -> Self {
        Self {
            shared,
            ghosts,
            channel,
            commands,
            events: Some(events),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The bucket's event stream; can be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<BucketEvent>> {
        self.events.take()
    }

    /// Install the resolver consulted before each inbound network change.
    pub fn before_network_change<F>(&self, resolver: F)
    where
        F: Fn(&str, Option<&Value>) -> Option<Value> + Send + Sync + 'static,
    {
        let mut guard = self
            .shared
            .resolver
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *guard = Some(Box::new(resolver));
    }

    /// Create an object under a fresh id.
    pub async fn add(&self, data: Value) -> Result<BucketObject> {
        let id = Uuid::new_v4().to_string();
        self.write(&id, data, true).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<BucketObject>> {
        let Some(stored) = self.shared.store.get(id).await? else {
            return Ok(None);
        };
        let version = self.ghosts.version(id).await?;
        Ok(Some(BucketObject {
            id: stored.id,
            data: stored.data,
            version,
        }))
    }

    /// Write an object and queue it for sync.
    pub async fn update(&self, id: &str, data: Value) -> Result<BucketObject> {
        self.write(id, data, true).await
    }

    /// Write an object locally without syncing it.
    pub async fn update_local(&self, id: &str, data: Value) -> Result<BucketObject> {
        self.write(id, data, false).await
    }

    async fn write(&self, id: &str, data: Value, sync: bool) -> Result<BucketObject> {
        if !data.is_object() {
            return Err(SyncError::Store(
                "bucket objects must be JSON objects".into(),
            ));
        }
        self.shared.store.update(id, data.clone(), false).await?;
        let version = self.ghosts.version(id).await?;
        let _ = self.shared.events.send(BucketEvent::Update {
            id: id.to_string(),
            data: data.clone(),
            original: None,
            patch: None,
            is_indexing: false,
        });
        if sync {
            self.send(Command::Modify {
                channel: self.channel,
                id: id.to_string(),
                data: data.clone(),
            })?;
        }
        Ok(BucketObject {
            id: id.to_string(),
            data,
            version,
        })
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.shared.store.remove(id).await?;
        let _ = self.shared.events.send(BucketEvent::Remove { id: id.to_string() });
        self.send(Command::Remove {
            channel: self.channel,
            id: id.to_string(),
        })
    }

    /// Opaque query against the local store.
    pub async fn find(&self, query: &Value) -> Result<Vec<StoredObject>> {
        self.shared.store.find(query).await
    }

    /// Last server-acknowledged version for an id (0 if never acknowledged).
    pub async fn version(&self, id: &str) -> Result<u64> {
        self.ghosts.version(id).await
    }

    /// Fetch all prior server revisions of an object, newest first.
    pub async fn revisions(&self, id: &str) -> Result<Vec<BucketObject>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Revisions {
            channel: self.channel,
            id: id.to_string(),
            reply,
        })?;
        rx.await
            .map_err(|_| SyncError::Transport("client loop stopped".into()))
    }

    /// Re-submit an object's current state.
    pub async fn touch(&self, id: &str) -> Result<()> {
        if let Some(stored) = self.shared.store.get(id).await? {
            self.write(id, stored.data, true).await?;
        }
        Ok(())
    }

    /// Drop local index state and re-download the bucket.
    pub fn reload(&self) -> Result<()> {
        self.send(Command::Reload {
            channel: self.channel,
        })
    }

    /// Whether any local change is still waiting for acknowledgment.
    pub async fn has_local_changes(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::HasLocalChanges {
            channel: self.channel,
            reply,
        })?;
        rx.await
            .map_err(|_| SyncError::Transport("client loop stopped".into()))
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::Transport("client loop stopped".into()))
    }
}
