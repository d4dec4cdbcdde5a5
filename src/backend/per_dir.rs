//! Bridge that arms one non-recursive OS watch per directory.
//!
//! A single shared `notify` watcher carries every armed directory. The
//! initial enumeration arms each discovered directory and registers a closer
//! for it with the core registry; directories created later are armed by the
//! converter's directory hook.

use notify::{RecursiveMode, Watcher as _};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::backend::{scan, spawn_converter, Backend, BackendKind, BackendLink, DirHook};
use crate::engine::registry::Closer;
use crate::error::WatchError;

type NotifyStream = mpsc::UnboundedReceiver<notify::Result<notify::Event>>;

/// Shared handle to the underlying non-recursive watcher.
#[derive(Clone)]
struct WatcherHandle(Arc<Mutex<notify::RecommendedWatcher>>);

impl WatcherHandle {
    fn locked(&self) -> MutexGuard<'_, notify::RecommendedWatcher> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn arm(&self, dir: &Path) -> Result<(), WatchError> {
        self.locked()
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::WatchPath {
                path: dir.to_path_buf(),
                source,
            })
    }

    fn closer_for(&self, dir: &Path) -> Closer {
        let handle = self.clone();
        let dir = dir.to_path_buf();
        Closer::new(move || {
            let _ = handle.locked().unwatch(&dir);
        })
    }
}

/// The per-directory bridge.
pub(crate) struct PerDirBackend {
    watcher: WatcherHandle,
    // Taken by the first `watch` call, which spawns the converter.
    stream: Mutex<Option<NotifyStream>>,
}

impl PerDirBackend {
    pub(crate) fn new() -> Result<Self, WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        Ok(Self {
            watcher: WatcherHandle(Arc::new(Mutex::new(watcher))),
            stream: Mutex::new(Some(rx)),
        })
    }

    fn ensure_converter(&self, link: &BackendLink) {
        let stream = self
            .stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(rx) = stream {
            let watcher = self.watcher.clone();
            let hook: DirHook = Arc::new(move |link: &BackendLink, dir: PathBuf| {
                match watcher.arm(&dir) {
                    Ok(()) => link.register_closer(dir.clone(), watcher.closer_for(&dir)),
                    Err(err) => link.error(err),
                }
                let link = link.clone();
                tokio::spawn(async move {
                    scan::scan_tree(&dir, &link, false, true).await;
                });
            });
            spawn_converter(rx, link.clone(), Some(hook));
        }
    }
}

impl Backend for PerDirBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::PerDir
    }

    fn watch(&self, root: PathBuf, link: BackendLink) -> Result<Closer, WatchError> {
        self.ensure_converter(&link);
        self.watcher.arm(&root)?;
        tracing::debug!(path = %root.display(), "per-directory watch armed");

        let watcher = self.watcher.clone();
        let scan_link = link;
        let scan_root = root.clone();
        tokio::spawn(async move {
            let entries = scan::scan_tree(&scan_root, &scan_link, true, true).await;
            for (path, meta) in &entries {
                if meta.is_dir && *path != scan_root {
                    match watcher.arm(path) {
                        Ok(()) => {
                            scan_link.register_closer(path.clone(), watcher.closer_for(path))
                        }
                        Err(err) => scan_link.error(err),
                    }
                }
            }
            scan_link.scan_complete();
        });

        Ok(self.watcher.closer_for(&root))
    }
}
