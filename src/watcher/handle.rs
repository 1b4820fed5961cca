//! Reference-counted ownership of one OS watcher.
//!
//! A [`PathWatcher`] is the shared resource behind every subscription for
//! one `(path, ignored)` key. It owns the backend watcher exclusively,
//! counts references per client, survives brief unwatch/rewatch cycles
//! through a disposal grace period, and serializes raw event processing
//! through a single worker task so changes reach clients in arrival order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::{debug_event, log_event, uri};

use super::backend::{BackendMessage, BackendSink, BackendWatcher, RawFileEvent, WatchBackend};
use super::change::FileChangeCollection;
use super::error::{WatchError, WatchResult};
use super::grace::GraceTimer;
use super::protocol::{
    ClientId, DidFilesChangedParams, FileChange, FileChangeType, FileSystemWatcherErrorParams,
    FileSystemWatcherServiceClient,
};
use super::service::WatchServiceOptions;

static DEBUG_ID_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
enum StartState {
    Pending,
    Started,
    Aborted,
    Failed(WatchError),
}

struct WatcherState {
    refs: HashMap<ClientId, u64>,
    grace: GraceTimer,
    backend_watcher: Option<Box<dyn BackendWatcher>>,
}

fn total_refs(refs: &HashMap<ClientId, u64>) -> u64 {
    refs.values().sum()
}

/// The shared watcher resource for one `(path, ignored)` key.
///
/// Created with one reference held by the requesting client; disposed after
/// the last reference is gone and the grace period elapses, or immediately
/// on backend failure. Disposal is terminal. Must be created inside a tokio
/// runtime (start and event processing run as spawned tasks).
pub struct PathWatcher {
    debug_id: u64,
    uri: String,
    fs_path: PathBuf,
    ignored: Vec<glob::Pattern>,
    grace_period: Duration,
    debounce: Duration,
    poll_interval: Duration,
    verbose: bool,
    client: Arc<dyn FileSystemWatcherServiceClient>,
    state: Mutex<WatcherState>,
    disposed: CancellationToken,
    start_tx: watch::Sender<StartState>,
    start_rx: watch::Receiver<StartState>,
    torn_down_tx: watch::Sender<bool>,
    torn_down_rx: watch::Receiver<bool>,
}

impl PathWatcher {
    /// Creates the watcher and begins starting its backend asynchronously,
    /// seeded with one reference for `initial_client`.
    pub fn spawn(
        uri: String,
        fs_path: PathBuf,
        ignored: &[String],
        initial_client: ClientId,
        backend: Arc<dyn WatchBackend>,
        client: Arc<dyn FileSystemWatcherServiceClient>,
        options: &WatchServiceOptions,
    ) -> WatchResult<Arc<Self>> {
        let mut patterns = Vec::with_capacity(ignored.len());
        for pattern in ignored {
            patterns.push(glob::Pattern::new(pattern).map_err(|err| {
                WatchError::InvalidIgnorePattern {
                    pattern: pattern.clone(),
                    reason: err.to_string(),
                }
            })?);
        }

        let (start_tx, start_rx) = watch::channel(StartState::Pending);
        let (torn_down_tx, torn_down_rx) = watch::channel(false);
        let mut refs = HashMap::new();
        refs.insert(initial_client, 1);

        let watcher = Arc::new(Self {
            debug_id: DEBUG_ID_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            uri,
            fs_path,
            ignored: patterns,
            grace_period: options.grace_period,
            debounce: options.debounce,
            poll_interval: options.poll_interval,
            verbose: options.verbose,
            client,
            state: Mutex::new(WatcherState {
                refs,
                grace: GraceTimer::new(),
                backend_watcher: None,
            }),
            disposed: CancellationToken::new(),
            start_tx,
            start_rx,
            torn_down_tx,
            torn_down_rx,
        });

        let (sink, events_rx) = BackendSink::channel();
        tokio::spawn(Self::run_events(Arc::clone(&watcher), events_rx));
        tokio::spawn(Self::run_start(Arc::clone(&watcher), backend, sink));
        watcher.lifecycle("created", watcher.fs_path.display().to_string());
        Ok(watcher)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn fs_path(&self) -> &Path {
        &self.fs_path
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.is_cancelled()
    }

    pub fn is_in_use(&self) -> bool {
        total_refs(&self.state.lock().refs) > 0
    }

    /// Adds one reference for `client_id`. A transition out of zero total
    /// references cancels a pending deferred disposal.
    pub fn add_ref(self: &Arc<Self>, client_id: ClientId) {
        let mut st = self.state.lock();
        let revived = total_refs(&st.refs) == 0;
        *st.refs.entry(client_id).or_insert(0) += 1;
        if revived {
            st.grace.disarm();
            drop(st);
            self.lifecycle("revived", format!("by client {client_id}"));
        }
    }

    /// Drops one reference for `client_id`. When the total reaches zero,
    /// disposal is scheduled after the grace period.
    pub fn remove_ref(self: &Arc<Self>, client_id: ClientId) {
        let mut st = self.state.lock();
        match st.refs.get_mut(&client_id) {
            None => {
                tracing::warn!(
                    target: "watcher",
                    "watcher #{} holds no references for client {client_id}",
                    self.debug_id
                );
                return;
            }
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    st.refs.remove(&client_id);
                }
            }
        }
        if total_refs(&st.refs) == 0 && !self.disposed.is_cancelled() {
            let this = Arc::clone(self);
            st.grace.arm(self.grace_period, move |token| async move {
                this.dispose_if_unused(token);
            });
            drop(st);
            self.lifecycle("disposal scheduled", format!("in {:?}", self.grace_period));
        }
    }

    fn dispose_if_unused(self: Arc<Self>, token: u64) {
        // The liveness check and the teardown decision share one lock
        // acquisition, otherwise a revival could slip in between them.
        let mut st = self.state.lock();
        if st.grace.is_current(token) && total_refs(&st.refs) == 0 {
            self.dispose_locked(&mut st);
        }
    }

    /// Tears the watcher down. Terminal: a disposed watcher is never
    /// revived, only replaced by a fresh one.
    pub fn dispose(self: &Arc<Self>) {
        let mut st = self.state.lock();
        self.dispose_locked(&mut st);
    }

    fn dispose_locked(self: &Arc<Self>, st: &mut WatcherState) {
        if self.disposed.is_cancelled() {
            return;
        }
        self.disposed.cancel();
        st.grace.disarm();
        let backend_watcher = st.backend_watcher.take();
        self.start_tx.send_if_modified(|state| {
            if matches!(state, StartState::Pending) {
                *state = StartState::Aborted;
                true
            } else {
                false
            }
        });
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(watcher) = backend_watcher {
                if let Err(err) = watcher.stop().await {
                    tracing::warn!(
                        target: "watcher",
                        "watcher #{} backend stop failed: {err}",
                        this.debug_id
                    );
                }
            }
            let _ = this.torn_down_tx.send(true);
            this.lifecycle("disposed", this.fs_path.display().to_string());
        });
    }

    /// Resolves `true` once the backend watcher is confirmed running,
    /// `false` when the handle was disposed before or during start; fails
    /// only on a genuine backend start failure.
    pub async fn when_started(&self) -> WatchResult<bool> {
        let outcome = {
            let mut rx = self.start_rx.clone();
            match rx.wait_for(|state| !matches!(state, StartState::Pending)).await {
                Ok(state) => state.clone(),
                Err(_) => StartState::Aborted,
            }
        };
        match outcome {
            StartState::Started => Ok(true),
            StartState::Failed(err) => Err(err),
            StartState::Pending | StartState::Aborted => Ok(false),
        }
    }

    /// Resolves once the watcher is fully torn down. Never fails.
    pub async fn when_disposed(&self) {
        let mut rx = self.torn_down_rx.clone();
        let _ = rx.wait_for(|done| *done).await;
    }

    async fn run_start(this: Arc<Self>, backend: Arc<dyn WatchBackend>, sink: BackendSink) {
        match this.start(backend, sink).await {
            Ok(()) => {
                let _ = this.start_tx.send(StartState::Started);
                this.lifecycle("started", this.fs_path.display().to_string());
            }
            Err(WatchError::Disposed) => {
                this.start_tx.send_if_modified(|state| {
                    if matches!(state, StartState::Pending) {
                        *state = StartState::Aborted;
                        true
                    } else {
                        false
                    }
                });
            }
            Err(err) => {
                tracing::error!(
                    target: "watcher",
                    "watcher #{} failed to start on {}: {err}",
                    this.debug_id,
                    this.fs_path.display()
                );
                let _ = this.start_tx.send(StartState::Failed(err));
                this.dispose();
                this.fire_error();
            }
        }
    }

    async fn start(&self, backend: Arc<dyn WatchBackend>, sink: BackendSink) -> WatchResult<()> {
        // The target may not exist yet (e.g. a workspace root that will be
        // created later); poll until it does.
        while tokio::fs::metadata(&self.fs_path).await.is_err() {
            tokio::time::sleep(self.poll_interval).await;
            if self.disposed.is_cancelled() {
                return Err(WatchError::Disposed);
            }
        }
        if self.disposed.is_cancelled() {
            return Err(WatchError::Disposed);
        }

        let watcher = backend.start(&self.fs_path, sink).await?;
        let leftover = {
            let mut st = self.state.lock();
            if self.disposed.is_cancelled() {
                Some(watcher)
            } else {
                st.backend_watcher = Some(watcher);
                None
            }
        };
        if let Some(watcher) = leftover {
            // Disposed while the backend was starting: the start has
            // completed, so the resource must be stopped, not abandoned.
            if let Err(err) = watcher.stop().await {
                tracing::warn!(
                    target: "watcher",
                    "watcher #{} backend stop failed: {err}",
                    self.debug_id
                );
            }
            return Err(WatchError::Disposed);
        }
        Ok(())
    }

    async fn run_events(this: Arc<Self>, mut rx: mpsc::UnboundedReceiver<BackendMessage>) {
        loop {
            let message = tokio::select! {
                _ = this.disposed.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            match message {
                BackendMessage::Error(message) => {
                    this.on_backend_error(&message);
                    break;
                }
                BackendMessage::Events(events) => {
                    if this.disposed.is_cancelled() || !this.is_in_use() {
                        continue;
                    }
                    let mut collection = FileChangeCollection::new();
                    this.reduce_events(&mut collection, events);
                    // Fold bursts arriving within the debounce window into
                    // the same outbound batch.
                    let failure = loop {
                        match timeout(this.debounce, rx.recv()).await {
                            Ok(Some(BackendMessage::Events(more))) => {
                                this.reduce_events(&mut collection, more);
                            }
                            Ok(Some(BackendMessage::Error(message))) => break Some(message),
                            Ok(None) | Err(_) => break None,
                        }
                    };
                    let changes = collection.values();
                    if !changes.is_empty() && !this.disposed.is_cancelled() && this.is_in_use() {
                        this.client.on_did_files_changed(DidFilesChangedParams {
                            clients: this.client_ids(),
                            changes,
                        });
                    }
                    if let Some(message) = failure {
                        this.on_backend_error(&message);
                        break;
                    }
                }
            }
        }
    }

    fn reduce_events(&self, collection: &mut FileChangeCollection, events: Vec<RawFileEvent>) {
        for event in events {
            match event {
                RawFileEvent::Created { path } => {
                    self.push_change(collection, path, FileChangeType::Added);
                }
                RawFileEvent::Updated { path } => {
                    self.push_change(collection, path, FileChangeType::Updated);
                }
                RawFileEvent::Deleted { path } => {
                    self.push_change(collection, path, FileChangeType::Deleted);
                }
                RawFileEvent::Renamed { old_path, new_path } => {
                    // A rename is a deletion of the old path plus a
                    // creation of the new one.
                    self.push_change(collection, old_path, FileChangeType::Deleted);
                    self.push_change(collection, new_path, FileChangeType::Added);
                }
            }
        }
    }

    /// Translates one raw path into a change entry. Ignore filtering
    /// happens here, at the translation boundary.
    fn push_change(&self, collection: &mut FileChangeCollection, path: PathBuf, kind: FileChangeType) {
        if self.is_ignored(&path) {
            return;
        }
        match uri::to_uri(&path) {
            Ok(uri) => collection.push(FileChange::new(uri, kind)),
            Err(err) => {
                // One unmappable path must not halt the rest of the batch.
                tracing::warn!(
                    target: "watcher",
                    "watcher #{} dropping event for {}: {err}",
                    self.debug_id,
                    path.display()
                );
            }
        }
    }

    fn is_ignored(&self, path: &Path) -> bool {
        if self.ignored.is_empty() {
            return false;
        }
        let candidate = path.to_string_lossy();
        self.ignored.iter().any(|pattern| pattern.matches(&candidate))
    }

    fn on_backend_error(self: &Arc<Self>, message: &str) {
        tracing::error!(
            target: "watcher",
            "watcher #{} failed on {}: {message}",
            self.debug_id,
            self.fs_path.display()
        );
        self.dispose();
        self.fire_error();
    }

    fn fire_error(&self) {
        self.client.on_error(FileSystemWatcherErrorParams {
            clients: self.client_ids(),
            uri: self.uri.clone(),
        });
    }

    fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.state.lock().refs.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn lifecycle(&self, event: &str, detail: String) {
        if self.verbose {
            log_event!("watcher", event, "#{} {detail}", self.debug_id);
        } else {
            debug_event!("watcher", event, "#{} {detail}", self.debug_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::backend::mock::MockBackend;
    use super::super::testing::{RecordingClient, wait_until};
    use super::*;

    fn test_options() -> WatchServiceOptions {
        WatchServiceOptions {
            grace_period: Duration::from_secs(10),
            debounce: Duration::from_millis(50),
            poll_interval: Duration::from_millis(500),
            verbose: false,
        }
    }

    fn spawn_on(
        path: PathBuf,
        ignored: &[String],
        backend: &Arc<MockBackend>,
        client: &Arc<RecordingClient>,
    ) -> Arc<PathWatcher> {
        PathWatcher::spawn(
            format!("file://{}", path.display()),
            path,
            ignored,
            1,
            backend.clone(),
            client.clone(),
            &test_options(),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn starts_once_when_path_exists() {
        let backend = MockBackend::new();
        let client = RecordingClient::new();
        let watcher = spawn_on(std::env::temp_dir(), &[], &backend, &client);

        assert_eq!(watcher.when_started().await, Ok(true));
        assert_eq!(backend.started_count(), 1);
        assert!(watcher.is_in_use());
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_path_appears() {
        let dir = tempfile::TempDir::new().unwrap();
        let late = dir.path().join("created-later");

        let backend = MockBackend::new();
        let client = RecordingClient::new();
        let watcher = spawn_on(late.clone(), &[], &backend, &client);

        std::fs::create_dir(&late).unwrap();
        assert_eq!(watcher.when_started().await, Ok(true));
        assert_eq!(backend.started_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_before_path_exists_aborts_start() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("never");

        let backend = MockBackend::new();
        let client = RecordingClient::new();
        let watcher = spawn_on(missing, &[], &backend, &client);

        watcher.dispose();
        assert_eq!(watcher.when_started().await, Ok(false));
        assert_eq!(backend.started_count(), 0);
        assert_eq!(backend.stopped_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_during_start_stops_the_started_backend() {
        let backend = MockBackend::new();
        let gate = backend.hold_next_start();
        let client = RecordingClient::new();
        let watcher = spawn_on(std::env::temp_dir(), &[], &backend, &client);

        // Let the start task reach the gate, then dispose under it.
        wait_until(|| backend.entered_count() == 1).await;
        watcher.dispose();
        gate.send(()).unwrap();

        assert_eq!(watcher.when_started().await, Ok(false));
        wait_until(|| backend.stopped_count() == 1).await;
        assert_eq!(backend.started_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn revival_within_grace_period_reuses_resource() {
        let backend = MockBackend::new();
        let client = RecordingClient::new();
        let watcher = spawn_on(std::env::temp_dir(), &[], &backend, &client);
        watcher.when_started().await.unwrap();

        watcher.remove_ref(1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        watcher.add_ref(1);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(!watcher.is_disposed());
        assert_eq!(backend.started_count(), 1);
        assert_eq!(backend.stopped_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_period_expiry_disposes() {
        let backend = MockBackend::new();
        let client = RecordingClient::new();
        let watcher = spawn_on(std::env::temp_dir(), &[], &backend, &client);
        watcher.when_started().await.unwrap();

        watcher.remove_ref(1);
        tokio::time::sleep(Duration::from_secs(11)).await;
        watcher.when_disposed().await;

        assert!(watcher.is_disposed());
        assert_eq!(backend.stopped_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rename_expands_to_deleted_then_added() {
        let backend = MockBackend::new();
        let client = RecordingClient::new();
        let watcher = spawn_on(std::env::temp_dir(), &[], &backend, &client);
        watcher.when_started().await.unwrap();

        backend.last_sink().deliver(vec![RawFileEvent::Renamed {
            old_path: PathBuf::from("/tmp/old.txt"),
            new_path: PathBuf::from("/tmp/new.txt"),
        }]);

        wait_until(|| !client.changes.lock().is_empty()).await;
        let events = client.changes.lock().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].clients, vec![1]);
        assert_eq!(
            events[0].changes,
            vec![
                FileChange::new("file:///tmp/old.txt", FileChangeType::Deleted),
                FileChange::new("file:///tmp/new.txt", FileChangeType::Added),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ignored_paths_never_reach_clients() {
        let backend = MockBackend::new();
        let client = RecordingClient::new();
        let watcher = spawn_on(
            std::env::temp_dir(),
            &["*.log".to_string()],
            &backend,
            &client,
        );
        watcher.when_started().await.unwrap();
        let sink = backend.last_sink();

        sink.deliver(vec![
            RawFileEvent::Created {
                path: PathBuf::from("/tmp/noise.log"),
            },
            RawFileEvent::Created {
                path: PathBuf::from("/tmp/keep.txt"),
            },
        ]);
        wait_until(|| !client.changes.lock().is_empty()).await;
        assert_eq!(
            client.changes.lock()[0].changes,
            vec![FileChange::new("file:///tmp/keep.txt", FileChangeType::Added)]
        );

        // A batch that filters down to nothing is suppressed entirely.
        sink.deliver(vec![RawFileEvent::Updated {
            path: PathBuf::from("/tmp/other.log"),
        }]);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(client.changes.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_within_debounce_window_fold_into_one_batch() {
        let backend = MockBackend::new();
        let client = RecordingClient::new();
        let watcher = spawn_on(std::env::temp_dir(), &[], &backend, &client);
        watcher.when_started().await.unwrap();
        let sink = backend.last_sink();

        sink.deliver(vec![RawFileEvent::Created {
            path: PathBuf::from("/tmp/burst.txt"),
        }]);
        sink.deliver(vec![RawFileEvent::Updated {
            path: PathBuf::from("/tmp/burst.txt"),
        }]);

        wait_until(|| !client.changes.lock().is_empty()).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let events = client.changes.lock().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].changes,
            vec![FileChange::new("file:///tmp/burst.txt", FileChangeType::Added)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn events_are_skipped_while_unreferenced() {
        let backend = MockBackend::new();
        let client = RecordingClient::new();
        let watcher = spawn_on(std::env::temp_dir(), &[], &backend, &client);
        watcher.when_started().await.unwrap();
        let sink = backend.last_sink();

        watcher.remove_ref(1);
        sink.deliver(vec![RawFileEvent::Created {
            path: PathBuf::from("/tmp/quiet.txt"),
        }]);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(client.changes.lock().is_empty());

        watcher.add_ref(1);
        sink.deliver(vec![RawFileEvent::Created {
            path: PathBuf::from("/tmp/heard.txt"),
        }]);
        wait_until(|| !client.changes.lock().is_empty()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn backend_error_disposes_and_notifies_referencing_clients() {
        let backend = MockBackend::new();
        let client = RecordingClient::new();
        let watcher = spawn_on(std::env::temp_dir(), &[], &backend, &client);
        watcher.when_started().await.unwrap();

        backend.last_sink().fail("inotify limit reached");

        wait_until(|| !client.errors.lock().is_empty()).await;
        watcher.when_disposed().await;
        let errors = client.errors.lock().clone();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].clients, vec![1]);
        assert_eq!(errors[0].uri, watcher.uri());
        assert!(watcher.is_disposed());
        assert_eq!(backend.stopped_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_failure_disposes_and_reports_to_requester() {
        let backend = MockBackend::new();
        backend.fail_next_start();
        let client = RecordingClient::new();
        let watcher = spawn_on(std::env::temp_dir(), &[], &backend, &client);

        let result = watcher.when_started().await;
        assert!(matches!(result, Err(WatchError::InitFailed { .. })));

        wait_until(|| !client.errors.lock().is_empty()).await;
        assert_eq!(client.errors.lock()[0].clients, vec![1]);
        assert!(watcher.is_disposed());
        assert_eq!(backend.started_count(), 0);
        assert_eq!(backend.stopped_count(), 0);
    }
}
