//! Client-side synchronization engine for JSON object buckets.
//!
//! An application stores schemaless JSON objects in named buckets; the
//! engine keeps each bucket consistent with the server across
//! disconnections and concurrent edits. Changes travel as operational
//! diffs from [`bucketsync_core`] relative to per-object *ghosts* (the last
//! state both sides agreed on); conflicts are rebased with the same
//! algebra, with the server winning ties.
//!
//! The [`Client`] owns one line-delimited duplex connection and multiplexes
//! any number of [`Bucket`]s over it, one [`channel::Channel`] each. The
//! engine is designed for a current-thread runtime: one loop drives socket
//! I/O, timers, and state.
//!
//! ```no_run
//! use std::sync::Arc;
//! use bucketsync::{Client, ClientConfig, MemoryBucketStore, TcpConnector};
//!
//! # async fn demo() -> bucketsync::Result<()> {
//! let mut client = Client::new(
//!     ClientConfig::new("my-app", "access-token"),
//!     Arc::new(TcpConnector::new("sync.example.com:1307")),
//! );
//! let mut notes = client.bucket("notes", Arc::new(MemoryBucketStore::new()));
//! let mut events = notes.take_events().unwrap();
//! tokio::task::spawn_local(client.run());
//! let note = notes.add(serde_json::json!({"content": "Hi"})).await?;
//! # let _ = (note, events.recv().await);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod bucket;
pub mod change;
pub mod channel;
pub mod client;
pub mod error;
pub mod ghost;
pub mod protocol;
pub mod store;

pub use auth::{Authorizer, Credentials, StaticTokenAuth};
pub use bucket::{Bucket, BucketEvent, BucketShared, ChangeResolver};
pub use channel::{Channel, ChannelOptions, ChannelState};
pub use client::{
    Client, ClientConfig, ClientEvent, Connect, OutboundFrame, ShutdownHandle, TcpConnector,
    Transport,
};
pub use error::{Result, SyncError};
pub use ghost::{Ghost, GhostStore, MemoryGhostStore};
pub use store::{BucketObject, BucketStore, MemoryBucketStore, StoredObject};
