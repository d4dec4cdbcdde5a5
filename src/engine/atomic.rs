//! Atomic-save reconciliation.
//!
//! Editors commonly save by writing a sidecar and renaming it over the
//! target, which backends observe as unlink+create. When enabled, an
//! `unlink` is parked for a short window; an `add` for the same path inside
//! the window collapses the pair into a single `change` (handled in the
//! emitter), and unmatched unlinks are released as ordinary `unlink`s here.

use std::path::PathBuf;
use std::sync::Arc;

use crate::engine::emitter;
use crate::engine::watcher::Shared;
use crate::events::EventKind;

/// Schedules the release of a just-parked pending unlink.
pub(crate) fn spawn_release(shared: Arc<Shared>, path: PathBuf) {
    let window = shared.atomic_window;
    tokio::spawn(async move {
        tokio::time::sleep(window).await;
        let still_pending = {
            let mut st = shared.state.lock().await;
            !st.closed && st.pending_unlinks.remove(&path)
        };
        if still_pending {
            emitter::dispatch(&shared, EventKind::Unlink, path, None).await;
        }
    });
}
