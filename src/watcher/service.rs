//! Multiplexing of client watch requests onto shared watcher resources.
//!
//! Many clients watch overlapping paths. [`FileWatcherService`] deduplicates
//! them: requests with the same normalized `(uri, ignored)` key share one
//! [`PathWatcher`] through reference counting, while every request still
//! gets its own subscription id. Disposed watchers evict themselves from
//! the registry; a later request for the same key starts a fresh one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::{debug_event, log_event};

use super::backend::WatchBackend;
use super::error::WatchResult;
use super::handle::PathWatcher;
use super::protocol::{
    ClientId, DidFilesChangedParams, FileSystemWatcherErrorParams, FileSystemWatcherService,
    FileSystemWatcherServiceClient, WatchOptions, WatcherId,
};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Tuning for the service and the watchers it creates.
#[derive(Debug, Clone)]
pub struct WatchServiceOptions {
    /// How long an unreferenced watcher lingers before disposal.
    pub grace_period: Duration,
    /// Window within which event bursts fold into one notification.
    pub debounce: Duration,
    /// Interval for probing a watch target that does not exist yet.
    pub poll_interval: Duration,
    /// Log watcher lifecycle at info level instead of debug.
    pub verbose: bool,
}

impl Default for WatchServiceOptions {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            debounce: DEFAULT_DEBOUNCE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            verbose: false,
        }
    }
}

/// Identity of a shareable watcher resource.
///
/// Two requests share a watcher only when they watch the same URI with the
/// same effective ignore set, so the ignore list is normalized (sorted,
/// deduplicated) before it becomes part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct WatcherKey {
    pub(crate) uri: String,
    ignored: Vec<String>,
}

impl WatcherKey {
    pub(crate) fn new(uri: &str, ignored: &[String]) -> Self {
        let mut ignored = ignored.to_vec();
        ignored.sort();
        ignored.dedup();
        Self {
            uri: uri.to_string(),
            ignored,
        }
    }
}

struct Subscription {
    client_id: ClientId,
    watcher: Arc<PathWatcher>,
}

struct ServiceState {
    watcher_sequence: WatcherId,
    watchers: HashMap<WatcherKey, Arc<PathWatcher>>,
    subscriptions: HashMap<WatcherId, Subscription>,
}

/// Forwards watcher events to whichever client is currently registered.
///
/// Watchers capture this slot at spawn time, so swapping the downstream
/// client retargets every live watcher at once.
#[derive(Default)]
struct ForwardingClient {
    inner: RwLock<Option<Arc<dyn FileSystemWatcherServiceClient>>>,
}

impl FileSystemWatcherServiceClient for ForwardingClient {
    fn on_did_files_changed(&self, event: DidFilesChangedParams) {
        let client = self.inner.read().clone();
        match client {
            Some(client) => client.on_did_files_changed(event),
            None => {
                debug_event!(
                    "service",
                    "changes dropped",
                    "no client registered ({} changes)",
                    event.changes.len()
                );
            }
        }
    }

    fn on_error(&self, event: FileSystemWatcherErrorParams) {
        let client = self.inner.read().clone();
        match client {
            Some(client) => client.on_error(event),
            None => {
                debug_event!("service", "error dropped", "no client registered ({})", event.uri);
            }
        }
    }
}

/// The single-process watch service.
pub struct FileWatcherService {
    backend: Arc<dyn WatchBackend>,
    options: WatchServiceOptions,
    client_slot: Arc<ForwardingClient>,
    state: Arc<Mutex<ServiceState>>,
}

impl FileWatcherService {
    pub fn new(backend: Arc<dyn WatchBackend>, options: WatchServiceOptions) -> Self {
        Self {
            backend,
            options,
            client_slot: Arc::new(ForwardingClient::default()),
            state: Arc::new(Mutex::new(ServiceState {
                watcher_sequence: 1,
                watchers: HashMap::new(),
                subscriptions: HashMap::new(),
            })),
        }
    }

    /// Service over the platform's native watching primitive.
    pub fn with_native_backend(options: WatchServiceOptions) -> Self {
        Self::new(Arc::new(super::backend::NotifyBackend::new()), options)
    }

    /// Watcher resources that are alive right now (started or starting).
    pub fn live_watcher_count(&self) -> usize {
        self.state
            .lock()
            .watchers
            .values()
            .filter(|watcher| !watcher.is_disposed())
            .count()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Disposes every watcher. Used on shutdown; in-flight subscriptions
    /// are dropped.
    pub fn dispose_all(&self) {
        let watchers: Vec<Arc<PathWatcher>> = {
            let mut state = self.state.lock();
            state.subscriptions.clear();
            state.watchers.values().cloned().collect()
        };
        for watcher in watchers {
            watcher.dispose();
        }
    }

    /// Removes the registry entry once its watcher is gone, unless the key
    /// was already taken over by a replacement.
    fn evict_on_dispose(&self, key: WatcherKey, watcher: Arc<PathWatcher>) {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            watcher.when_disposed().await;
            let mut state = state.lock();
            let evict = state
                .watchers
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, &watcher));
            if evict {
                state.watchers.remove(&key);
                debug_event!("service", "watcher evicted", "{}", key.uri);
            }
        });
    }

    fn trace(&self, event: &str, detail: String) {
        if self.options.verbose {
            log_event!("service", event, "{detail}");
        } else {
            debug_event!("service", event, "{detail}");
        }
    }
}

#[async_trait]
impl FileSystemWatcherService for FileWatcherService {
    async fn watch_file_changes(
        &self,
        client_id: ClientId,
        uri: &str,
        options: WatchOptions,
    ) -> WatchResult<WatcherId> {
        let fs_path = crate::uri::to_fs_path(uri)?;
        let key = WatcherKey::new(uri, &options.ignored);

        let mut state = self.state.lock();
        let reused = match state.watchers.get(&key) {
            Some(existing) if !existing.is_disposed() => {
                let existing = Arc::clone(existing);
                existing.add_ref(client_id);
                if existing.is_disposed() {
                    // Lost the race against the grace timer; fall through
                    // and replace the resource.
                    existing.remove_ref(client_id);
                    None
                } else {
                    self.trace("watcher reused", format!("{uri} for client {client_id}"));
                    Some(existing)
                }
            }
            _ => None,
        };
        let watcher = match reused {
            Some(watcher) => watcher,
            None => {
                let fresh = PathWatcher::spawn(
                    key.uri.clone(),
                    fs_path,
                    &key.ignored,
                    client_id,
                    Arc::clone(&self.backend),
                    Arc::clone(&self.client_slot) as Arc<dyn FileSystemWatcherServiceClient>,
                    &self.options,
                )?;
                state.watchers.insert(key.clone(), Arc::clone(&fresh));
                self.evict_on_dispose(key, Arc::clone(&fresh));
                self.trace(
                    "watcher created",
                    format!("{uri} for client {client_id}"),
                );
                fresh
            }
        };

        let watcher_id = state.watcher_sequence;
        state.watcher_sequence += 1;
        state
            .subscriptions
            .insert(watcher_id, Subscription { client_id, watcher });
        Ok(watcher_id)
    }

    async fn unwatch_file_changes(&self, watcher_id: WatcherId) -> WatchResult<()> {
        let subscription = self.state.lock().subscriptions.remove(&watcher_id);
        match subscription {
            Some(subscription) => {
                subscription.watcher.remove_ref(subscription.client_id);
            }
            None => {
                // Clients may race a watcher's self-disposal; not an error.
                tracing::warn!(
                    target: "service",
                    "unwatch for unknown watcher id {watcher_id}"
                );
            }
        }
        Ok(())
    }

    fn set_client(&self, client: Option<Arc<dyn FileSystemWatcherServiceClient>>) {
        *self.client_slot.inner.write() = client;
    }
}
