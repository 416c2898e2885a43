//! The pluggable local object store consumed by buckets.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::Result;

/// An object as the application sees it: store data plus the last
/// server-acknowledged version (0 until first acknowledgment).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketObject {
    pub id: String,
    pub data: Value,
    pub version: u64,
}

/// An object as the store holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub id: String,
    pub data: Value,
    /// Set while the object is being written as part of an index download.
    pub is_indexing: bool,
}

/// Local persistence for one bucket. Implementations are free to be backed
/// by anything addressable by id; queries are opaque to the engine.
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<StoredObject>>;
    async fn update(&self, id: &str, data: Value, is_indexing: bool) -> Result<StoredObject>;
    async fn remove(&self, id: &str) -> Result<()>;
    async fn find(&self, query: &Value) -> Result<Vec<StoredObject>>;
}

/// In-memory store, used by tests and as the default backing.
#[derive(Default)]
pub struct MemoryBucketStore {
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn get(&self, id: &str) -> Result<Option<StoredObject>> {
        Ok(self.objects.read().await.get(id).cloned())
    }

    async fn update(&self, id: &str, data: Value, is_indexing: bool) -> Result<StoredObject> {
        let object = StoredObject {
            id: id.to_string(),
            data,
            is_indexing,
        };
        self.objects
            .write()
            .await
            .insert(id.to_string(), object.clone());
        Ok(object)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.objects.write().await.remove(id);
        Ok(())
    }

    /// Matches objects whose data contains every field of `query` verbatim.
    async fn find(&self, query: &Value) -> Result<Vec<StoredObject>> {
        let objects = self.objects.read().await;
        let mut found: Vec<StoredObject> = objects
            .values()
            .filter(|obj| match (query.as_object(), obj.data.as_object()) {
                (Some(q), Some(data)) => q.iter().all(|(k, v)| data.get(k) == Some(v)),
                (None, _) => true,
                _ => false,
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }
}
