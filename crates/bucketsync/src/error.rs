use bucketsync_core::DiffError;
use thiserror::Error;

/// Errors produced by the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Socket closed or a frame could not be read/written.
    #[error("transport: {0}")]
    Transport(String),
    /// A frame or payload the protocol does not allow in the current state.
    #[error("protocol: {0}")]
    Protocol(String),
    /// Authentication rejected or expired.
    #[error("auth: {0}")]
    Auth(String),
    /// A change's source version does not line up with the local ghost.
    #[error("version mismatch for {key}: ghost at {ghost}, change from {change_from}")]
    VersionMismatch {
        key: String,
        ghost: u64,
        change_from: u64,
    },
    /// The local store failed; the cause is opaque to the engine.
    #[error("store: {0}")]
    Store(String),
    #[error(transparent)]
    Diff(#[from] DiffError),
}

pub type Result<T> = std::result::Result<T, SyncError>;
