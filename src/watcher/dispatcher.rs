//! Fan-out of watcher events to registered clients.
//!
//! The watch service pushes into a single client slot; the dispatcher is
//! that client when several consumers are connected. Events carry the ids
//! of the clients they concern, and the dispatcher delivers to exactly
//! those, or to everyone when the list is empty.

use std::sync::Arc;

use dashmap::DashMap;

use crate::debug_event;

use super::protocol::{
    ClientId, DidFilesChangedParams, FileSystemWatcherErrorParams, FileSystemWatcherServiceClient,
};

/// Routes service events to per-client receivers.
///
/// Implements [`FileSystemWatcherServiceClient`] itself so it can be
/// registered on the service unchanged.
#[derive(Default)]
pub struct WatcherDispatcher {
    clients: DashMap<ClientId, Arc<dyn FileSystemWatcherServiceClient>>,
}

impl WatcherDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the receiver for `client_id`. A duplicate registration
    /// replaces the previous receiver; the stale one stops getting events.
    pub fn register_client(
        &self,
        client_id: ClientId,
        client: Arc<dyn FileSystemWatcherServiceClient>,
    ) {
        if self.clients.insert(client_id, client).is_some() {
            tracing::warn!(
                target: "dispatcher",
                "client {client_id} registered twice, replacing the previous receiver"
            );
        } else {
            debug_event!("dispatcher", "client registered", "{client_id}");
        }
    }

    pub fn unregister_client(&self, client_id: ClientId) {
        if self.clients.remove(&client_id).is_none() {
            tracing::warn!(
                target: "dispatcher",
                "unregister for unknown client {client_id}"
            );
        } else {
            debug_event!("dispatcher", "client unregistered", "{client_id}");
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Receivers addressed by `ids`, everyone for an empty list. Ids with
    /// no registered receiver are skipped.
    fn targets(&self, ids: &[ClientId]) -> Vec<Arc<dyn FileSystemWatcherServiceClient>> {
        if ids.is_empty() {
            self.clients
                .iter()
                .map(|entry| Arc::clone(entry.value()))
                .collect()
        } else {
            ids.iter()
                .filter_map(|id| self.clients.get(id).map(|entry| Arc::clone(entry.value())))
                .collect()
        }
    }
}

impl FileSystemWatcherServiceClient for WatcherDispatcher {
    fn on_did_files_changed(&self, event: DidFilesChangedParams) {
        // Snapshot receivers first so delivery happens without any map
        // locks held.
        for client in self.targets(&event.clients) {
            client.on_did_files_changed(event.clone());
        }
    }

    fn on_error(&self, event: FileSystemWatcherErrorParams) {
        for client in self.targets(&event.clients) {
            client.on_error(event.clone());
        }
    }
}
