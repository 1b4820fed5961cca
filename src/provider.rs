//! Disk-side consumer surface over the watch service.
//!
//! [`FileWatchProvider`] is what path-oriented consumers use: `watch` takes
//! a filesystem path and yields a [`WatchHandle`] that releases the
//! subscription on dispose or drop, while change and error events fan out
//! through broadcast channels to any number of subscribers. It implements
//! the watcher client trait so it can be registered directly on a service
//! or dispatcher as the receiving end.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::debug_event;
use crate::uri;
use crate::watcher::{
    CachingWatcherService, DidFilesChangedParams, FileChange, FileSystemWatcherErrorParams,
    FileSystemWatcherServiceClient, LocalWatcherId, WatchOptions, WatchResult,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

enum WatchState {
    Starting,
    Active(LocalWatcherId),
    Disposed,
}

/// One active watch registration.
///
/// Disposing (or dropping) releases the subscription, even when the
/// underlying watch call has not resolved yet.
pub struct WatchHandle {
    watcher: Arc<CachingWatcherService>,
    state: Arc<Mutex<WatchState>>,
}

impl WatchHandle {
    /// Stop watching. Idempotent.
    pub fn dispose(&self) {
        let active = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, WatchState::Disposed) {
                WatchState::Active(local_id) => Some(local_id),
                WatchState::Starting | WatchState::Disposed => None,
            }
        };
        if let Some(local_id) = active {
            let watcher = Arc::clone(&self.watcher);
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = watcher.unwatch_file_changes(local_id).await;
                });
            }
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Path-based watching facade with broadcast event delivery.
pub struct FileWatchProvider {
    watcher: Arc<CachingWatcherService>,
    changes_tx: broadcast::Sender<Vec<FileChange>>,
    errors_tx: broadcast::Sender<String>,
    reported_errors: Mutex<HashSet<String>>,
}

impl FileWatchProvider {
    pub fn new(watcher: Arc<CachingWatcherService>) -> Self {
        let (changes_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (errors_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            watcher,
            changes_tx,
            errors_tx,
            reported_errors: Mutex::new(HashSet::new()),
        }
    }

    /// Begin watching `path`. The subscription is established in the
    /// background; the handle may be disposed at any point, including
    /// before it resolved, without leaking the subscription.
    pub fn watch(&self, path: &Path, options: WatchOptions) -> WatchResult<WatchHandle> {
        let target = uri::to_uri(path)?;
        let state = Arc::new(Mutex::new(WatchState::Starting));
        let watcher = Arc::clone(&self.watcher);
        let task_state = Arc::clone(&state);
        tokio::spawn(async move {
            match watcher.watch_file_changes(&target, options).await {
                Ok((local_id, _event_id)) => {
                    let already_disposed = {
                        let mut state = task_state.lock();
                        match *state {
                            WatchState::Disposed => true,
                            _ => {
                                *state = WatchState::Active(local_id);
                                false
                            }
                        }
                    };
                    if already_disposed {
                        // Lost the race against dispose; release right away.
                        let _ = watcher.unwatch_file_changes(local_id).await;
                    }
                }
                Err(err) => {
                    // The service pushes the user-facing error event; the
                    // local failure only needs a trace.
                    debug_event!("provider", "watch failed", "{target}: {err}");
                    *task_state.lock() = WatchState::Disposed;
                }
            }
        });
        Ok(WatchHandle {
            watcher: Arc::clone(&self.watcher),
            state,
        })
    }

    /// Change batches from every watched path.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<Vec<FileChange>> {
        self.changes_tx.subscribe()
    }

    /// URIs whose watcher failed.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.errors_tx.subscribe()
    }
}

impl FileSystemWatcherServiceClient for FileWatchProvider {
    fn on_did_files_changed(&self, event: DidFilesChangedParams) {
        let _ = self.changes_tx.send(event.changes);
    }

    fn on_error(&self, event: FileSystemWatcherErrorParams) {
        // Identical failures tend to arrive in bulk (one per watched root
        // once the inotify limit is hit); report the first loudly, repeats
        // quietly. The event itself always goes out to subscribers.
        let first_report = self.reported_errors.lock().insert(event.uri.clone());
        if first_report {
            tracing::error!(target: "provider", "file watching failed for {}", event.uri);
        } else {
            debug_event!("provider", "watch error repeated", "{}", event.uri);
        }
        let _ = self.errors_tx.send(event.uri);
    }
}
