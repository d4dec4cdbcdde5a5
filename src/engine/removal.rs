//! Recursive subtree removal.
//!
//! A raw removal for `parent/basename` tears down the item and everything
//! the registry knows beneath it, children first, with an explicit work list
//! so deep trees cannot exhaust the stack. Pending write-stabilization holds
//! are cancelled on the way; an `add` that never stabilized short-circuits
//! without any emission.

use std::path::PathBuf;
use std::sync::Arc;

use crate::backend::{BackendKind, CoreMessage, RawEvent};
use crate::engine::emitter;
use crate::engine::stabilize;
use crate::engine::throttle::{ThrottleAction, REMOVE_WINDOW};
use crate::engine::watcher::Shared;
use crate::events::EventKind;
use crate::path_util::split_parent;

/// Removes `parent/basename` and its known subtree.
pub(crate) async fn remove(shared: &Arc<Shared>, parent: PathBuf, basename: String) {
    // Expand the subtree in preorder, then process in reverse so children
    // always precede their directories.
    let items: Vec<(PathBuf, String)> = {
        let st = shared.state.lock().await;
        if st.closed {
            return;
        }
        let mut items = Vec::new();
        let mut stack = vec![(parent, basename)];
        while let Some((par, name)) = stack.pop() {
            let path = par.join(&name);
            if let Some(dir) = st.registry.get(&path) {
                for child in dir.children() {
                    stack.push((path.clone(), child.to_string()));
                }
            }
            items.push((par, name));
        }
        items
    };

    for (par, name) in items.into_iter().rev() {
        remove_one(shared, par, name).await;
    }
}

async fn remove_one(shared: &Arc<Shared>, parent: PathBuf, name: String) {
    let path = parent.join(&name);
    let mut emit_kind = None;
    let mut rearm_parent = false;
    let mut parent_emptied = false;
    let mut closer = None;
    {
        let mut st = shared.state.lock().await;
        if st.closed {
            return;
        }
        let is_dir = st.registry.contains_dir(&path);
        if !st.throttle.admit(ThrottleAction::Remove, &path, REMOVE_WINDOW) {
            return;
        }

        // A watched file going away under a non-recursive backend: when this
        // was the only watched directory, the parent watch died with it, so
        // the file's return would go unseen without a fresh watch.
        if !is_dir
            && shared.backend_kind != BackendKind::Native
            && st.registry.dir_count() == 1
        {
            rearm_parent = true;
        }

        let was_tracked = st.registry.remove_child(&parent, &name);
        parent_emptied = st
            .registry
            .get(&parent)
            .map(|d| d.is_empty())
            .unwrap_or(false);

        let cancelled = stabilize::cancel(&mut st, &path);
        // The file never materialized for subscribers; stay silent.
        let short_circuit = matches!(cancelled, Some(EventKind::Add));

        st.registry.drop_dir(&path);

        if was_tracked && !short_circuit && !st.ignore.is_ignored(&path, None) {
            emit_kind = Some(if is_dir {
                EventKind::UnlinkDir
            } else {
                EventKind::Unlink
            });
        }

        if shared.backend_kind != BackendKind::Native {
            closer = st.registry.take_closer(&path);
        }
    }

    if rearm_parent {
        shared.rearm(parent.clone());
    }
    if let Some(kind) = emit_kind {
        emitter::emit(shared, kind, path.clone(), None).await;
    }
    if let Some(closer) = closer {
        closer.close();
    }

    // Losing the last child may mean the directory itself is gone without a
    // removal event of its own; probe and schedule its removal upward.
    if parent_emptied && split_parent(&parent).is_some() && !path_exists(&parent).await {
        let _ = shared
            .core_tx
            .send(CoreMessage::Raw(RawEvent::removed(parent)));
    }
}

async fn path_exists(path: &std::path::Path) -> bool {
    tokio::fs::symlink_metadata(path).await.is_ok()
}
