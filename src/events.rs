//! Normalized event types emitted to subscribers.

use std::fs::Metadata;
use std::path::PathBuf;
use std::time::SystemTime;

/// The semantic kinds of change the watcher reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A file appeared.
    Add,
    /// A directory appeared.
    AddDir,
    /// A file's contents changed.
    Change,
    /// A file disappeared.
    Unlink,
    /// A directory disappeared.
    UnlinkDir,
}

impl EventKind {
    /// Whether this kind describes a file or directory that now exists.
    pub fn is_upsert(self) -> bool {
        matches!(self, EventKind::Add | EventKind::AddDir | EventKind::Change)
    }
}

/// A snapshot of the interesting parts of a file's metadata.
///
/// Carried on `add`/`addDir`/`change` events when the backend already had a
/// stat in hand, or when `always_stat` is configured.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileMeta {
    /// Whether the path is a directory.
    pub is_dir: bool,
    /// Whether the path is a symbolic link (as seen by `lstat`).
    pub is_symlink: bool,
    /// Size in bytes (0 for directories on some platforms).
    pub len: u64,
    /// Last modification time, when the filesystem provides one.
    pub modified: Option<SystemTime>,
}

impl From<&Metadata> for FileMeta {
    fn from(meta: &Metadata) -> Self {
        Self {
            is_dir: meta.is_dir(),
            is_symlink: meta.file_type().is_symlink(),
            len: meta.len(),
            modified: meta.modified().ok(),
        }
    }
}

/// A normalized change event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    /// What happened.
    pub kind: EventKind,
    /// The affected path, relativized against `cwd` when one is configured.
    pub path: PathBuf,
    /// Stat enrichment, when available.
    pub meta: Option<FileMeta>,
}

impl WatchEvent {
    pub(crate) fn new(kind: EventKind, path: PathBuf, meta: Option<FileMeta>) -> Self {
        Self { kind, path, meta }
    }
}
