//! Process-local de-duplication in front of a watch service.
//!
//! Many local callers (editor tabs, language features, tree views) tend to
//! request the identical `(uri, ignored)` pair. [`CachingWatcherService`]
//! collapses those onto one downstream subscription per key and hands each
//! caller its own local id. The downstream subscription is released only
//! after the last local reference is gone and a linger period has elapsed,
//! a second, outer grace tier that absorbs reconnect storms without
//! churning the real watchers underneath.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::debug_event;

use super::error::WatchResult;
use super::grace::GraceTimer;
use super::protocol::{ClientId, FileSystemWatcherService, LocalWatcherId, WatchOptions, WatcherId};
use super::service::WatcherKey;

pub const DEFAULT_REUSE_LINGER: Duration = Duration::from_secs(60);

struct EntryLifecycle {
    refs: u64,
    grace: GraceTimer,
}

/// One cached downstream subscription, shared by all local ids for its key.
struct CacheEntry {
    key: WatcherKey,
    remote: OnceCell<WatcherId>,
    lifecycle: Mutex<EntryLifecycle>,
}

impl CacheEntry {
    fn new(key: WatcherKey) -> Self {
        Self {
            key,
            remote: OnceCell::new(),
            lifecycle: Mutex::new(EntryLifecycle {
                refs: 0,
                grace: GraceTimer::new(),
            }),
        }
    }
}

struct CacheState {
    local_sequence: LocalWatcherId,
    entries: HashMap<WatcherKey, Arc<CacheEntry>>,
    locals: HashMap<LocalWatcherId, Arc<CacheEntry>>,
}

/// De-duplicating wrapper around a [`FileSystemWatcherService`].
///
/// Bound to one client identity; every downstream call it issues carries
/// that id. Concurrent first requests for a key collapse onto a single
/// in-flight downstream call, and a failed call is not cached, so the next
/// request simply retries.
pub struct CachingWatcherService {
    client_id: ClientId,
    downstream: Arc<dyn FileSystemWatcherService>,
    linger: Duration,
    state: Mutex<CacheState>,
}

impl CachingWatcherService {
    pub fn new(
        client_id: ClientId,
        downstream: Arc<dyn FileSystemWatcherService>,
        linger: Duration,
    ) -> Self {
        Self {
            client_id,
            downstream,
            linger,
            state: Mutex::new(CacheState {
                local_sequence: 1,
                entries: HashMap::new(),
                locals: HashMap::new(),
            }),
        }
    }

    /// Watch `uri`, reusing an existing downstream subscription for the
    /// same key when one is live. Returns the caller's fresh local id and
    /// the downstream watcher id events will reference.
    pub async fn watch_file_changes(
        self: &Arc<Self>,
        uri: &str,
        options: WatchOptions,
    ) -> WatchResult<(LocalWatcherId, WatcherId)> {
        let key = WatcherKey::new(uri, &options.ignored);
        let (local_id, entry) = {
            let mut state = self.state.lock();
            let entry = match state.entries.get(&key) {
                Some(entry) => Arc::clone(entry),
                None => {
                    let entry = Arc::new(CacheEntry::new(key.clone()));
                    state.entries.insert(key, Arc::clone(&entry));
                    entry
                }
            };
            let local_id = state.local_sequence;
            state.local_sequence += 1;
            state.locals.insert(local_id, Arc::clone(&entry));
            let mut lifecycle = entry.lifecycle.lock();
            if lifecycle.refs == 0 {
                lifecycle.grace.disarm();
            }
            lifecycle.refs += 1;
            drop(lifecycle);
            (local_id, entry)
        };

        let result = entry
            .remote
            .get_or_try_init(|| {
                self.downstream
                    .watch_file_changes(self.client_id, &entry.key.uri, options)
            })
            .await;
        match result {
            Ok(remote) => Ok((local_id, *remote)),
            Err(err) => {
                // Do not cache the failure: drop this reference so the next
                // request retries from scratch.
                self.release(local_id);
                Err(err)
            }
        }
    }

    /// Release one local reference. The downstream unwatch propagates only
    /// after the last reference for the key is gone and the linger period
    /// has passed.
    pub async fn unwatch_file_changes(self: &Arc<Self>, local_id: LocalWatcherId) -> WatchResult<()> {
        if !self.release(local_id) {
            tracing::warn!(
                target: "cache",
                "unwatch for unknown local watcher id {local_id}"
            );
        }
        Ok(())
    }

    /// Cached downstream subscriptions currently held.
    pub fn entry_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Local references currently outstanding.
    pub fn local_count(&self) -> usize {
        self.state.lock().locals.len()
    }

    fn release(self: &Arc<Self>, local_id: LocalWatcherId) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.locals.remove(&local_id) else {
            return false;
        };
        let mut lifecycle = entry.lifecycle.lock();
        lifecycle.refs = lifecycle.refs.saturating_sub(1);
        if lifecycle.refs > 0 {
            return true;
        }
        if entry.remote.get().is_none() {
            // Nothing downstream to release: the call failed or never
            // resolved. Evict right away.
            drop(lifecycle);
            evict(&mut state, &entry);
        } else {
            debug_event!(
                "cache",
                "release deferred",
                "{} for {:?}",
                entry.key.uri,
                self.linger
            );
            let this = Arc::clone(self);
            let deferred = Arc::clone(&entry);
            lifecycle.grace.arm(self.linger, move |token| async move {
                this.expire(deferred, token).await;
            });
        }
        true
    }

    async fn expire(self: Arc<Self>, entry: Arc<CacheEntry>, token: u64) {
        let remote = {
            let mut state = self.state.lock();
            let lifecycle = entry.lifecycle.lock();
            if !lifecycle.grace.is_current(token) || lifecycle.refs > 0 {
                return;
            }
            drop(lifecycle);
            evict(&mut state, &entry);
            entry.remote.get().copied()
        };
        if let Some(remote) = remote {
            if let Err(err) = self.downstream.unwatch_file_changes(remote).await {
                tracing::warn!(
                    target: "cache",
                    "downstream unwatch of {} failed: {err}",
                    entry.key.uri
                );
            }
        }
    }
}

fn evict(state: &mut CacheState, entry: &Arc<CacheEntry>) {
    let current = state
        .entries
        .get(&entry.key)
        .is_some_and(|cached| Arc::ptr_eq(cached, entry));
    if current {
        state.entries.remove(&entry.key);
    }
}
