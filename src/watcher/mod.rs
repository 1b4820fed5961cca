//! Multiplexed, reference-counted file watching.
//!
//! Many clients watch overlapping paths; the OS gives us a limited number
//! of watcher slots. This module multiplexes the former onto the latter:
//!
//! ```text
//! CachingWatcherService        per-process request de-duplication
//!         |
//! FileWatcherService           (uri, ignored) -> shared PathWatcher
//!         |                    watcher ids, reference counting
//!     PathWatcher              one OS watcher, grace-period disposal,
//!         |                    debounced change reduction
//!    WatchBackend              notify-based OS primitive adapter
//!
//! WatcherDispatcher            service events -> registered clients
//! ParentWatchdog               helper-process parent liveness probe
//! ```
//!
//! Events flow upward as [`DidFilesChangedParams`] batches carrying the
//! client ids they concern; the dispatcher routes them, or broadcasts when
//! no ids are named.

pub mod backend;
mod cache;
mod change;
mod daemon;
mod dispatcher;
mod error;
mod grace;
mod handle;
mod protocol;
mod service;
#[cfg(test)]
pub(crate) mod testing;

pub use backend::{BackendSink, BackendWatcher, NotifyBackend, RawFileEvent, WatchBackend};
pub use cache::{CachingWatcherService, DEFAULT_REUSE_LINGER};
pub use change::FileChangeCollection;
pub use daemon::{DEFAULT_PARENT_CHECK_INTERVAL, ParentWatchdog};
pub use dispatcher::WatcherDispatcher;
pub use error::{WatchError, WatchResult};
pub use handle::PathWatcher;
pub use protocol::{
    ClientId, DidFilesChangedParams, FileChange, FileChangeType, FileSystemWatcherErrorParams,
    FileSystemWatcherService, FileSystemWatcherServiceClient, LocalWatcherId, WatchOptions,
    WatcherId,
};
pub use service::{
    DEFAULT_DEBOUNCE, DEFAULT_GRACE_PERIOD, DEFAULT_POLL_INTERVAL, FileWatcherService,
    WatchServiceOptions,
};
