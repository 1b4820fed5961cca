//! Wire types and traits for the watch service boundary.
//!
//! The service side implements [`FileSystemWatcherService`]; event receivers
//! implement [`FileSystemWatcherServiceClient`]. Both traits are object safe
//! so the service can sit behind a process boundary: an embedding application
//! substitutes its RPC proxy for the local implementation and nothing above
//! the trait notices.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::WatchResult;

/// Identifies one remote event consumer (e.g. one front-end connection).
pub type ClientId = u64;

/// Opaque per-request subscription id issued by the watcher service.
///
/// Distinct from the shared underlying OS watcher: many ids may map to one
/// watcher resource.
pub type WatcherId = u64;

/// Subscription id issued by the process-local caching layer.
pub type LocalWatcherId = u64;

/// Net classification of what happened to one URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileChangeType {
    Added,
    Updated,
    Deleted,
}

/// One coalesced change delivered to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub uri: String,
    #[serde(rename = "type")]
    pub kind: FileChangeType,
}

impl FileChange {
    pub fn new(uri: impl Into<String>, kind: FileChangeType) -> Self {
        Self {
            uri: uri.into(),
            kind,
        }
    }
}

/// Options for a watch request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchOptions {
    /// Glob patterns excluded from change notifications.
    pub ignored: Vec<String>,
}

impl WatchOptions {
    pub fn ignored(patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            ignored: patterns.into_iter().map(Into::into).collect(),
        }
    }
}

/// Pushed when watched files changed. An empty `clients` list means
/// broadcast to every registered client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidFilesChangedParams {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clients: Vec<ClientId>,
    pub changes: Vec<FileChange>,
}

/// Pushed when a watcher failed. Same routing semantics as
/// [`DidFilesChangedParams`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystemWatcherErrorParams {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clients: Vec<ClientId>,
    pub uri: String,
}

/// Receives events pushed by the watch service.
///
/// Implemented by the dispatcher (which fans out to registered clients) and
/// by the clients themselves.
pub trait FileSystemWatcherServiceClient: Send + Sync {
    fn on_did_files_changed(&self, event: DidFilesChangedParams);
    fn on_error(&self, event: FileSystemWatcherErrorParams);
}

/// The watch service: multiplexes client watch requests onto shared
/// per-path watcher resources.
#[async_trait]
pub trait FileSystemWatcherService: Send + Sync {
    /// Start (or join) watching `uri` for `client_id`. Always returns a
    /// fresh watcher id, even when the underlying resource is shared.
    async fn watch_file_changes(
        &self,
        client_id: ClientId,
        uri: &str,
        options: WatchOptions,
    ) -> WatchResult<WatcherId>;

    /// Release one subscription. Unknown ids are logged and ignored:
    /// callers may legitimately race a watcher's self-disposal.
    async fn unwatch_file_changes(&self, watcher_id: WatcherId) -> WatchResult<()>;

    /// Register or clear the single downstream event receiver.
    fn set_client(&self, client: Option<Arc<dyn FileSystemWatcherServiceClient>>);
}
