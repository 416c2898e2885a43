//! Ghosts: the last server-acknowledged state of each object.
//!
//! Every outbound diff is computed from a ghost, and every applied remote
//! change advances one: ghost@N plus the change's operations produces
//! ghost@N+1. Ghost versions never move backwards.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ghost {
    pub key: String,
    pub version: u64,
    pub data: Value,
}

#[async_trait]
pub trait GhostStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Ghost>>;
    async fn put(&self, ghost: Ghost) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
    async fn keys(&self) -> Result<Vec<String>>;

    /// The acknowledged version for a key; 0 when no ghost exists yet.
    async fn version(&self, key: &str) -> Result<u64> {
        Ok(self.get(key).await?.map(|g| g.version).unwrap_or(0))
    }
}

#[derive(Default)]
pub struct MemoryGhostStore {
    ghosts: RwLock<HashMap<String, Ghost>>,
}

impl MemoryGhostStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GhostStore for MemoryGhostStore {
    async fn get(&self, key: &str) -> Result<Option<Ghost>> {
        Ok(self.ghosts.read().await.get(key).cloned())
    }

    async fn put(&self, ghost: Ghost) -> Result<()> {
        self.ghosts.write().await.insert(ghost.key.clone(), ghost);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.ghosts.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.ghosts.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
