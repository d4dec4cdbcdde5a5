//! Bridge over the OS recursive watching facility.
//!
//! One `notify` recommended watcher per watched root, in recursive mode.
//! The notify callback runs on a backend thread; results are forwarded over
//! a channel and converted to raw events on the core runtime.

use notify::{RecursiveMode, Watcher as _};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::backend::{scan, spawn_converter, Backend, BackendKind, BackendLink, DirHook};
use crate::engine::registry::Closer;
use crate::error::WatchError;

/// The recursive bridge.
pub(crate) struct NativeBackend;

impl NativeBackend {
    pub(crate) fn new() -> Self {
        Self
    }
}

impl Backend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn watch(&self, root: PathBuf, link: BackendLink) -> Result<Closer, WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|source| WatchError::WatchPath {
                path: root.clone(),
                source,
            })?;
        tracing::debug!(path = %root.display(), "recursive watch armed");
        link.armed();

        // Recursive facilities can skip per-entry events for a directory
        // that appears fully populated; enumerate it ourselves.
        let dir_hook: DirHook = Arc::new(|link: &BackendLink, dir: PathBuf| {
            let link = link.clone();
            tokio::spawn(async move {
                scan::scan_tree(&dir, &link, false, true).await;
            });
        });
        spawn_converter(rx, link.clone(), Some(dir_hook));

        let scan_link = link;
        let scan_root = root;
        tokio::spawn(async move {
            scan::scan_tree(&scan_root, &scan_link, true, true).await;
            scan_link.scan_complete();
        });

        Ok(Closer::new(move || drop(watcher)))
    }
}
