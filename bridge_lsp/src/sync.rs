//! Document sync feed.
//!
//! Watches the workspace and forwards create/modify/delete events for
//! selected documents to the session. Events for other files, or events that
//! arrive while the session is not running, are dropped.

use crate::error::BridgeError;
use crate::types::DocumentSelector;
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};

/// Kind of file-system change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    Created,
    Changed,
    Deleted,
}

impl From<FileChangeKind> for lsp_types::FileChangeType {
    fn from(kind: FileChangeKind) -> Self {
        match kind {
            FileChangeKind::Created => lsp_types::FileChangeType::CREATED,
            FileChangeKind::Changed => lsp_types::FileChangeType::CHANGED,
            FileChangeKind::Deleted => lsp_types::FileChangeType::DELETED,
        }
    }
}

/// A change to one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: FileChangeKind,
}

impl FileChange {
    pub fn new(path: impl Into<PathBuf>, kind: FileChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Receiver of filtered changes. Implementations must not block.
pub trait ChangeSink: Send + Sync + 'static {
    fn is_active(&self) -> bool;
    fn forward(&self, changes: Vec<FileChange>);
}

/// Maps a watcher event onto per-file changes.
pub fn changes_for(event: &notify::Event) -> Vec<FileChange> {
    let all = |kind: FileChangeKind| -> Vec<FileChange> {
        event
            .paths
            .iter()
            .map(|path| FileChange::new(path.clone(), kind))
            .collect()
    };

    match event.kind {
        EventKind::Create(_) => all(FileChangeKind::Created),
        EventKind::Remove(_) => all(FileChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => all(FileChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => all(FileChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // paths are [from, to]
            let mut changes = Vec::new();
            if let Some(from) = event.paths.first() {
                changes.push(FileChange::new(from.clone(), FileChangeKind::Deleted));
            }
            if let Some(to) = event.paths.get(1) {
                changes.push(FileChange::new(to.clone(), FileChangeKind::Created));
            }
            changes
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => all(FileChangeKind::Changed),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

/// Filters one watcher event and forwards what survives.
///
/// Returns the number of changes forwarded.
pub fn route_event(
    event: &notify::Event,
    selector: &DocumentSelector,
    sink: &dyn ChangeSink,
) -> usize {
    if !sink.is_active() {
        log::trace!("Session not running, discarding {:?}", event.kind);
        return 0;
    }

    let changes: Vec<FileChange> = changes_for(event)
        .into_iter()
        .filter(|change| {
            let selected = selector.matches_path(&change.path);
            if !selected {
                log::trace!("Ignoring change outside selector: {}", change.path.display());
            }
            selected
        })
        .collect();

    let count = changes.len();
    if count > 0 {
        sink.forward(changes);
    }
    count
}

/// Watches a directory tree for the lifetime of the value.
pub struct DocumentSyncFeed {
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl DocumentSyncFeed {
    /// Starts watching `root` recursively.
    pub fn watch(
        root: &Path,
        selector: DocumentSelector,
        sink: impl ChangeSink,
    ) -> Result<Self, BridgeError> {
        let watch_failed = |e: notify::Error| BridgeError::WatchFailed {
            path: root.to_path_buf(),
            reason: e.to_string(),
        };

        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    route_event(&event, &selector, &sink);
                }
                Err(e) => log::warn!("File watcher error: {}", e),
            })
            .map_err(watch_failed)?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(watch_failed)?;

        log::info!("Watching {} for document changes", root.display());
        Ok(Self {
            _watcher: watcher,
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
