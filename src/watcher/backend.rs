//! Adapter over the OS-level file watching primitive.
//!
//! A [`WatchBackend`] starts one recursive watcher per path and pushes raw
//! events (and asynchronous failures) into a [`BackendSink`]; the returned
//! [`BackendWatcher`] tears the OS resource down. Watch handles own exactly
//! one backend watcher each and never share it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::debug_event;

use super::error::{WatchError, WatchResult};

/// One raw event as reported by the OS primitive, with paths already joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFileEvent {
    Created { path: PathBuf },
    Updated { path: PathBuf },
    Deleted { path: PathBuf },
    Renamed { old_path: PathBuf, new_path: PathBuf },
}

/// Message pushed from a backend watcher to its owning handle.
#[derive(Debug)]
pub enum BackendMessage {
    Events(Vec<RawFileEvent>),
    Error(String),
}

/// Sending half of the event channel handed to a backend on start.
///
/// Cloneable and safe to use from a foreign callback thread; sends never
/// block. Delivery silently stops once the owning handle is gone.
#[derive(Debug, Clone)]
pub struct BackendSink {
    tx: mpsc::UnboundedSender<BackendMessage>,
}

impl BackendSink {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<BackendMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn deliver(&self, events: Vec<RawFileEvent>) {
        let _ = self.tx.send(BackendMessage::Events(events));
    }

    pub fn fail(&self, message: impl Into<String>) {
        let _ = self.tx.send(BackendMessage::Error(message.into()));
    }
}

/// Factory for OS watcher instances.
#[async_trait]
pub trait WatchBackend: Send + Sync + 'static {
    /// Begin watching `path` recursively. The path is guaranteed to exist
    /// when this is called.
    async fn start(&self, path: &Path, sink: BackendSink) -> WatchResult<Box<dyn BackendWatcher>>;
}

/// One live OS watcher instance.
#[async_trait]
pub trait BackendWatcher: Send {
    async fn stop(self: Box<Self>) -> WatchResult<()>;
}

/// Production backend over the `notify` crate's recommended watcher.
#[derive(Debug, Default)]
pub struct NotifyBackend;

impl NotifyBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl WatchBackend for NotifyBackend {
    async fn start(&self, path: &Path, sink: BackendSink) -> WatchResult<Box<dyn BackendWatcher>> {
        // The callback runs on notify's own thread; the unbounded sender
        // bridges it into the handle's async worker.
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let events = translate_event(event);
                    if !events.is_empty() {
                        sink.deliver(events);
                    }
                }
                Err(err) => sink.fail(err.to_string()),
            })?;
        watcher.watch(path, RecursiveMode::Recursive)?;
        Ok(Box::new(NotifyWatcher {
            watcher,
            path: path.to_path_buf(),
        }))
    }
}

struct NotifyWatcher {
    watcher: RecommendedWatcher,
    path: PathBuf,
}

#[async_trait]
impl BackendWatcher for NotifyWatcher {
    async fn stop(mut self: Box<Self>) -> WatchResult<()> {
        // The watch may already be gone if the watched tree was deleted;
        // dropping the watcher releases the OS resource either way.
        if let Err(err) = self.watcher.unwatch(&self.path) {
            debug_event!("backend", "unwatch", "{}: {err}", self.path.display());
        }
        Ok(())
    }
}

/// Maps a notify event onto the raw event vocabulary.
///
/// Renames with both endpoints become an explicit `Renamed`; one-sided
/// renames degrade to the endpoint we know about; rename notifications with
/// no usable direction degrade to `Updated`. Access events carry no content
/// change and are dropped.
fn translate_event(event: Event) -> Vec<RawFileEvent> {
    let Event { kind, paths, .. } = event;
    match kind {
        EventKind::Create(_) => paths
            .into_iter()
            .map(|path| RawFileEvent::Created { path })
            .collect(),
        EventKind::Remove(_) => paths
            .into_iter()
            .map(|path| RawFileEvent::Deleted { path })
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = paths.into_iter();
            match (paths.next(), paths.next()) {
                (Some(old_path), Some(new_path)) => vec![RawFileEvent::Renamed {
                    old_path,
                    new_path,
                }],
                (Some(path), None) => vec![RawFileEvent::Updated { path }],
                _ => Vec::new(),
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => paths
            .into_iter()
            .map(|path| RawFileEvent::Deleted { path })
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => paths
            .into_iter()
            .map(|path| RawFileEvent::Created { path })
            .collect(),
        EventKind::Modify(_) | EventKind::Any => paths
            .into_iter()
            .map(|path| RawFileEvent::Updated { path })
            .collect(),
        _ => Vec::new(),
    }
}
