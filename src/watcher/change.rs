//! Per-URI coalescing of raw filesystem events.
//!
//! A burst of raw events frequently contains redundant history for the same
//! URI (a file created then immediately rewritten, deleted then recreated).
//! [`FileChangeCollection`] folds each incoming change into the minimal net
//! sequence per URI so clients see one coherent change set per debounce
//! flush.

use indexmap::IndexMap;

use super::protocol::{FileChange, FileChangeType};

/// Outcome of merging one incoming change with the latest recorded one.
enum Reduction {
    /// The two collapse into a single entry of this type.
    Single(FileChangeType),
    /// Added followed by Deleted stays as the explicit two-entry sequence.
    Pair,
}

/// Merge rule for `current` (last recorded) followed by `next` (incoming).
fn reduce(current: FileChangeType, next: FileChangeType) -> Reduction {
    use FileChangeType::*;
    match (current, next) {
        (Added, Deleted) => Reduction::Pair,
        (Added, _) => Reduction::Single(Added),
        (_, Deleted) => Reduction::Single(Deleted),
        (Deleted, _) => Reduction::Single(Updated),
        (Updated, _) => Reduction::Single(Updated),
    }
}

/// Accumulates changes per URI, reducing as they arrive.
///
/// Reduction replays history: the incoming type is reduced against the last
/// recorded entry, and when they collapse into a single type that result is
/// re-reduced against the next older entry, until the list is exhausted or
/// an explicit Added/Deleted pair ends the fold. This keeps sequences like
/// Added, Deleted, Added collapsing back to a plain Added instead of
/// degrading into an Updated.
#[derive(Debug, Default)]
pub struct FileChangeCollection {
    changes: IndexMap<String, Vec<FileChange>>,
}

impl FileChangeCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, change: FileChange) {
        let FileChange { uri, kind } = change;
        let entries = self.changes.entry(uri.clone()).or_default();
        let mut next = kind;
        loop {
            match entries.pop() {
                None => {
                    entries.push(FileChange::new(uri.clone(), next));
                    return;
                }
                Some(current) => match reduce(current.kind, next) {
                    Reduction::Single(kind) => next = kind,
                    Reduction::Pair => {
                        entries.push(current);
                        entries.push(FileChange::new(uri.clone(), FileChangeType::Deleted));
                        return;
                    }
                },
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// All URIs' entries concatenated, URIs in first-seen order, entries
    /// within one URI in reduced sequence order.
    pub fn values(self) -> Vec<FileChange> {
        self.changes.into_values().flatten().collect()
    }
}
