//! Write-stabilization holds.
//!
//! When `await_write_finish` is enabled, the first `add`/`change` for a path
//! opens a [`PendingWrite`] and starts a poll chain that re-stats the file
//! until its size has stayed constant for the stability threshold, then
//! releases the original event enriched with the final stat. Cancellation is
//! by record removal: a poll that finds its record gone self-retires.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::engine::emitter;
use crate::engine::watcher::{EngineState, Shared};
use crate::error::WatchError;
use crate::events::{EventKind, FileMeta};

/// A held emission waiting for the file to stop growing.
#[derive(Debug)]
pub(crate) struct PendingWrite {
    /// The original event kind, re-emitted on release.
    pub(crate) kind: EventKind,
    /// When the size last moved (or the hold was opened/refreshed).
    pub(crate) last_change: Instant,
    /// Size seen by the previous poll.
    pub(crate) last_size: Option<u64>,
}

impl PendingWrite {
    pub(crate) fn new(kind: EventKind) -> Self {
        Self {
            kind,
            last_change: Instant::now(),
            last_size: None,
        }
    }
}

/// Drops the pending record for `path`, disarming its poll chain, and
/// returns the original event kind so the caller can decide whether the
/// removal should short-circuit.
pub(crate) fn cancel(state: &mut EngineState, path: &Path) -> Option<EventKind> {
    state.pending_writes.remove(path).map(|p| p.kind)
}

enum Poll {
    Again,
    Retired,
    Release(EventKind, FileMeta),
    Fail(io::Error),
}

/// Starts the poll chain for a freshly inserted [`PendingWrite`].
pub(crate) fn spawn_poll(shared: Arc<Shared>, path: PathBuf) {
    let Some(awf) = shared.config.await_write_finish else {
        return;
    };
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(awf.poll_interval).await;
            {
                let st = shared.state.lock().await;
                if st.closed || !st.pending_writes.contains_key(&path) {
                    return;
                }
            }
            let stat = tokio::fs::metadata(&path).await;
            let outcome = {
                let mut st = shared.state.lock().await;
                let Some(pending) = st.pending_writes.get_mut(&path) else {
                    return;
                };
                match stat {
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        // The file was deleted out from under the hold.
                        st.pending_writes.remove(&path);
                        Poll::Retired
                    }
                    Err(e) => {
                        st.pending_writes.remove(&path);
                        Poll::Fail(e)
                    }
                    Ok(meta) => {
                        if pending.last_size != Some(meta.len()) {
                            pending.last_size = Some(meta.len());
                            pending.last_change = Instant::now();
                        }
                        if pending.last_change.elapsed() >= awf.stability_threshold {
                            let kind = pending.kind;
                            st.pending_writes.remove(&path);
                            Poll::Release(kind, FileMeta::from(&meta))
                        } else {
                            Poll::Again
                        }
                    }
                }
            };
            match outcome {
                Poll::Again => {}
                Poll::Retired => return,
                Poll::Release(kind, meta) => {
                    emitter::dispatch(&shared, kind, path, Some(meta)).await;
                    return;
                }
                Poll::Fail(source) => {
                    emitter::handle_backend_error(
                        &shared,
                        WatchError::Stat {
                            path: path.clone(),
                            source,
                        },
                    )
                    .await;
                    return;
                }
            }
        }
    });
}
