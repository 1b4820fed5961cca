//! Error types for file watching operations.

use thiserror::Error;

/// Result alias for watch operations.
pub type WatchResult<T> = Result<T, WatchError>;

/// Errors that can occur while setting up or running watchers.
///
/// Cloneable so a single start failure can be handed to every waiter of
/// `PathWatcher::when_started` while the original is logged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    #[error("failed to initialize file watcher: {reason}")]
    InitFailed { reason: String },

    #[error("failed to watch path {path}: {reason}")]
    PathWatchFailed { path: String, reason: String },

    #[error("watcher was disposed")]
    Disposed,

    #[error("invalid ignore pattern '{pattern}': {reason}")]
    InvalidIgnorePattern { pattern: String, reason: String },

    #[error("invalid file uri '{uri}'")]
    InvalidUri { uri: String },

    #[error("unsupported uri scheme '{scheme}', expected 'file'")]
    UnsupportedScheme { scheme: String },

    #[error("watcher event channel closed unexpectedly")]
    ChannelClosed,
}

impl From<notify::Error> for WatchError {
    fn from(err: notify::Error) -> Self {
        match err.paths.first() {
            Some(path) => WatchError::PathWatchFailed {
                path: path.display().to_string(),
                reason: err.to_string(),
            },
            None => WatchError::InitFailed {
                reason: err.to_string(),
            },
        }
    }
}
