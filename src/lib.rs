pub mod cli;
pub mod config;
pub mod logging;
pub mod provider;
pub mod uri;
pub mod watcher;

pub use config::Settings;
pub use provider::{FileWatchProvider, WatchHandle};
pub use watcher::{
    CachingWatcherService, ClientId, FileChange, FileChangeType, FileSystemWatcherService,
    FileSystemWatcherServiceClient, FileWatcherService, LocalWatcherId, NotifyBackend,
    ParentWatchdog, WatchError, WatchOptions, WatchResult, WatchServiceOptions, WatcherDispatcher,
    WatcherId,
};
