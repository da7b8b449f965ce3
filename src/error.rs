//! Error types for the watching subsystem.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from watcher operations.
///
/// Reasons are carried as strings so a single failure can be cloned and
/// shared with every subscriber of a wrapper.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    #[error("Failed to resolve watch root {path}: {reason}")]
    PathResolution { path: PathBuf, reason: String },

    #[error("Failed to start backend for {path}: {reason}")]
    BackendStart { path: PathBuf, reason: String },

    #[error("Backend error: {details}")]
    BackendRuntime { details: String },

    #[error("Watcher is already attached to a native watcher")]
    AlreadyAttached,

    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

impl From<notify::Error> for WatchError {
    fn from(e: notify::Error) -> Self {
        WatchError::BackendRuntime {
            details: e.to_string(),
        }
    }
}
