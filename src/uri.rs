//! Mapping between filesystem paths and `file://` URI strings.
//!
//! The watch protocol addresses resources by URI; everything touching the
//! disk works on paths. Watcher sharing keys compare raw URI strings, so all
//! callers must produce URIs through [`to_uri`] to get one canonical form
//! per path.

use std::path::{Path, PathBuf};

use url::Url;

use crate::watcher::{WatchError, WatchResult};

/// Converts an absolute path into its canonical `file://` URI string.
pub fn to_uri(path: &Path) -> WatchResult<String> {
    Url::from_file_path(path)
        .map(|url| url.to_string())
        .map_err(|_| WatchError::InvalidUri {
            uri: path.display().to_string(),
        })
}

/// Converts a `file://` URI back into a filesystem path.
pub fn to_fs_path(uri: &str) -> WatchResult<PathBuf> {
    let url = Url::parse(uri).map_err(|_| WatchError::InvalidUri {
        uri: uri.to_string(),
    })?;
    if url.scheme() != "file" {
        return Err(WatchError::UnsupportedScheme {
            scheme: url.scheme().to_string(),
        });
    }
    url.to_file_path().map_err(|_| WatchError::InvalidUri {
        uri: uri.to_string(),
    })
}
