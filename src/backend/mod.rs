//! The backend contract and the bridges that implement it.
//!
//! A backend turns OS-level filesystem activity into raw events on behalf of
//! the core. It is asked to watch one root at a time and hands back a
//! [`Closer`] per watch; everything it learns flows through the
//! [`BackendLink`] helpers into the core's single dispatch context.

pub(crate) mod native;
pub(crate) mod per_dir;
pub(crate) mod poll;
pub(crate) mod scan;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

use crate::engine::registry::Closer;
use crate::engine::watcher::Shared;
use crate::error::WatchError;
use crate::events::FileMeta;

pub(crate) use native::NativeBackend;
pub(crate) use per_dir::PerDirBackend;
pub(crate) use poll::PollBackend;

/// Which bridge the watcher selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// The OS recursive facility (FSEvents, inotify, ReadDirectoryChangesW).
    Native,
    /// One non-recursive OS watch per directory.
    PerDir,
    /// Periodic scan-and-diff, no OS facility at all.
    Poll,
}

/// The shape of a raw backend observation before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    /// Something appeared.
    Create {
        /// Whether the new entry is a directory.
        is_dir: bool,
    },
    /// A file's contents changed.
    Modify,
    /// Something disappeared. The core classifies file vs directory from its
    /// registry, since the path can no longer be stat'ed.
    Remove,
}

/// A raw, unnormalized event posted by a backend.
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// What the backend observed.
    pub kind: RawKind,
    /// Absolute path of the affected entry.
    pub path: PathBuf,
    /// A stat taken by the backend, when it had one in hand.
    pub meta: Option<FileMeta>,
    /// Whether this was discovered by the initial enumeration.
    pub initial: bool,
}

impl RawEvent {
    /// An appearance, classified by the supplied stat.
    pub fn created(path: PathBuf, meta: FileMeta, initial: bool) -> Self {
        Self {
            kind: RawKind::Create { is_dir: meta.is_dir },
            path,
            meta: Some(meta),
            initial,
        }
    }

    /// A content change.
    pub fn modified(path: PathBuf, meta: Option<FileMeta>) -> Self {
        Self {
            kind: RawKind::Modify,
            path,
            meta,
            initial: false,
        }
    }

    /// A disappearance.
    pub fn removed(path: PathBuf) -> Self {
        Self {
            kind: RawKind::Remove,
            path,
            meta: None,
            initial: false,
        }
    }
}

/// Messages handed from backends (and internal timers) to the dispatch task.
#[derive(Debug)]
pub(crate) enum CoreMessage {
    Raw(RawEvent),
    ScanComplete,
    Armed,
    RegisterCloser(PathBuf, Closer),
    Error(WatchError),
    Shutdown,
}

/// The helpers a backend uses to talk back to the core.
#[derive(Clone)]
pub struct BackendLink {
    pub(crate) tx: mpsc::UnboundedSender<CoreMessage>,
    pub(crate) shared: Weak<Shared>,
    pub(crate) follow_symlinks: bool,
    pub(crate) silent: bool,
}

impl BackendLink {
    /// Posts a raw event into the core.
    pub fn raw(&self, event: RawEvent) {
        let _ = self.tx.send(CoreMessage::Raw(event));
    }

    /// Signals that the initial enumeration for one watch finished.
    pub fn scan_complete(&self) {
        if !self.silent {
            let _ = self.tx.send(CoreMessage::ScanComplete);
        }
    }

    /// Signals that the OS-level watch is armed.
    pub fn armed(&self) {
        if !self.silent {
            let _ = self.tx.send(CoreMessage::Armed);
        }
    }

    /// Posts an error; the core applies the propagation policy.
    pub fn error(&self, err: WatchError) {
        let _ = self.tx.send(CoreMessage::Error(err));
    }

    /// Hands ownership of a per-path closer to the registry.
    pub fn register_closer(&self, path: PathBuf, closer: Closer) {
        let _ = self.tx.send(CoreMessage::RegisterCloser(path, closer));
    }

    /// Whether to follow symlinks when classifying entries.
    pub fn follow_symlinks(&self) -> bool {
        self.follow_symlinks
    }

    /// True once the core is gone; long-running backend loops should exit.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.shared.strong_count() == 0
    }

    /// Whether a discovered directory should be descended into.
    pub async fn filter_dir(&self, path: &Path) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut st = shared.state.lock().await;
        !st.closed && !st.ignore.is_ignored(path, None)
    }

    /// Whether a discovered file is worth reporting.
    pub async fn filter_path(&self, path: &Path, meta: Option<&FileMeta>) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut st = shared.state.lock().await;
        !st.closed && !st.ignore.is_ignored(path, meta)
    }
}

/// The contract each bridge implements.
///
/// `watch` begins observing a subtree (or single file), performs the initial
/// enumeration (reporting it with `initial` raw events followed by
/// [`BackendLink::scan_complete`]), and returns the [`Closer`] that releases
/// the watch.
pub trait Backend: Send + Sync {
    /// Which bridge this is.
    fn kind(&self) -> BackendKind;

    /// Begins watching `root`.
    fn watch(&self, root: PathBuf, link: BackendLink) -> Result<Closer, WatchError>;
}

/// Stats a path honoring the symlink policy.
pub(crate) async fn stat_for(path: &Path, follow_symlinks: bool) -> std::io::Result<std::fs::Metadata> {
    if follow_symlinks {
        tokio::fs::metadata(path).await
    } else {
        tokio::fs::symlink_metadata(path).await
    }
}

/// Hook invoked by the notify-event converter when a new directory appears,
/// so non-recursive bridges can arm and enumerate it.
pub(crate) type DirHook = Arc<dyn Fn(&BackendLink, PathBuf) + Send + Sync>;

/// Drains a notify event stream, converting each event to raw core events.
pub(crate) fn spawn_converter(
    mut rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    link: BackendLink,
    dir_hook: Option<DirHook>,
) {
    tokio::spawn(async move {
        while let Some(res) = rx.recv().await {
            if link.is_closed() {
                return;
            }
            match res {
                Ok(event) => convert_event(event, &link, dir_hook.as_ref()).await,
                Err(err) => link.error(WatchError::Backend(err)),
            }
        }
    });
}

async fn convert_event(event: notify::Event, link: &BackendLink, dir_hook: Option<&DirHook>) {
    use notify::event::{ModifyKind, RenameMode};
    use notify::EventKind as NK;

    match event.kind {
        NK::Create(_) => {
            for path in event.paths {
                report_present(path, link, dir_hook, true).await;
            }
        }
        NK::Remove(_) => {
            for path in event.paths {
                link.raw(RawEvent::removed(path));
            }
        }
        NK::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in event.paths {
                link.raw(RawEvent::removed(path));
            }
        }
        NK::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in event.paths {
                report_present(path, link, dir_hook, true).await;
            }
        }
        NK::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            let mut paths = event.paths;
            let to = paths.pop().unwrap_or_default();
            let from = paths.pop().unwrap_or_default();
            link.raw(RawEvent::removed(from));
            report_present(to, link, dir_hook, true).await;
        }
        NK::Modify(ModifyKind::Metadata(_)) | NK::Access(_) => {}
        NK::Modify(_) | NK::Any | NK::Other => {
            for path in event.paths {
                report_present(path, link, dir_hook, false).await;
            }
        }
    }
}

/// Stats a path reported as present; a failed stat means it vanished again
/// and is reported as a removal instead.
async fn report_present(path: PathBuf, link: &BackendLink, dir_hook: Option<&DirHook>, is_create: bool) {
    match stat_for(&path, link.follow_symlinks).await {
        Err(_) => link.raw(RawEvent::removed(path)),
        Ok(stat) => {
            let meta = FileMeta::from(&stat);
            if meta.is_dir {
                link.raw(RawEvent::created(path.clone(), meta, false));
                if is_create {
                    if let Some(hook) = dir_hook {
                        hook(link, path);
                    }
                }
            } else if is_create {
                link.raw(RawEvent::created(path, meta, false));
            } else {
                link.raw(RawEvent::modified(path, Some(meta)));
            }
        }
    }
}
