//! Shared fixtures for watcher lifecycle tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::error::{WatchError, WatchResult};
use super::protocol::{
    ClientId, DidFilesChangedParams, FileSystemWatcherErrorParams, FileSystemWatcherService,
    FileSystemWatcherServiceClient, WatchOptions, WatcherId,
};

/// Client that records everything pushed to it.
#[derive(Default)]
pub(crate) struct RecordingClient {
    pub changes: Mutex<Vec<DidFilesChangedParams>>,
    pub errors: Mutex<Vec<FileSystemWatcherErrorParams>>,
}

impl RecordingClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl FileSystemWatcherServiceClient for RecordingClient {
    fn on_did_files_changed(&self, event: DidFilesChangedParams) {
        self.changes.lock().push(event);
    }

    fn on_error(&self, event: FileSystemWatcherErrorParams) {
        self.errors.lock().push(event);
    }
}

/// Polls `condition` until it holds, advancing the paused clock in small
/// steps. Panics if it never does.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Downstream watch service stub that records calls and hands out
/// sequential watcher ids starting at 101.
#[derive(Default)]
pub(crate) struct StubWatcherService {
    sequence: AtomicU64,
    pub watch_calls: Mutex<Vec<(ClientId, String, WatchOptions)>>,
    pub unwatch_calls: Mutex<Vec<WatcherId>>,
    pub fail_next: AtomicBool,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl StubWatcherService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next watch call blocks until the returned sender fires (or is
    /// dropped).
    pub fn hold_next_watch(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock() = Some(rx);
        tx
    }
}

#[async_trait]
impl FileSystemWatcherService for StubWatcherService {
    async fn watch_file_changes(
        &self,
        client_id: ClientId,
        uri: &str,
        options: WatchOptions,
    ) -> WatchResult<WatcherId> {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(WatchError::InitFailed {
                reason: "stub failure".to_string(),
            });
        }
        self.watch_calls
            .lock()
            .push((client_id, uri.to_string(), options));
        Ok(self.sequence.fetch_add(1, Ordering::SeqCst) + 101)
    }

    async fn unwatch_file_changes(&self, watcher_id: WatcherId) -> WatchResult<()> {
        self.unwatch_calls.lock().push(watcher_id);
        Ok(())
    }

    fn set_client(&self, _client: Option<Arc<dyn FileSystemWatcherServiceClient>>) {}
}
