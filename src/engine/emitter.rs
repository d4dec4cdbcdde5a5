//! Event normalization and fan-out.
//!
//! Every emission flows through [`emit`]: atomic-save reconciliation,
//! write-stabilization holds, change throttling, optional stat enrichment,
//! then dispatch to the per-kind channel and the `all` channel. The emitter
//! also arbitrates the one-shot `ready` signal.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch};

use crate::config::WatchConfig;
use crate::engine::atomic;
use crate::engine::stabilize::{self, PendingWrite};
use crate::engine::throttle::{ThrottleAction, CHANGE_WINDOW};
use crate::engine::watcher::Shared;
use crate::error::{ErrorClass, WatchError};
use crate::events::{EventKind, FileMeta, WatchEvent};

/// Broadcast senders for every subscriber channel.
///
/// `error` events are never fanned out to `all`.
pub(crate) struct EventBus {
    add: broadcast::Sender<WatchEvent>,
    add_dir: broadcast::Sender<WatchEvent>,
    change: broadcast::Sender<WatchEvent>,
    unlink: broadcast::Sender<WatchEvent>,
    unlink_dir: broadcast::Sender<WatchEvent>,
    all: broadcast::Sender<WatchEvent>,
    errors: broadcast::Sender<Arc<WatchError>>,
    ready: watch::Sender<bool>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let cap = capacity.max(1);
        Self {
            add: broadcast::channel(cap).0,
            add_dir: broadcast::channel(cap).0,
            change: broadcast::channel(cap).0,
            unlink: broadcast::channel(cap).0,
            unlink_dir: broadcast::channel(cap).0,
            all: broadcast::channel(cap).0,
            errors: broadcast::channel(cap).0,
            ready: watch::channel(false).0,
        }
    }

    fn sender(&self, kind: EventKind) -> &broadcast::Sender<WatchEvent> {
        match kind {
            EventKind::Add => &self.add,
            EventKind::AddDir => &self.add_dir,
            EventKind::Change => &self.change,
            EventKind::Unlink => &self.unlink,
            EventKind::UnlinkDir => &self.unlink_dir,
        }
    }

    pub(crate) fn publish(&self, event: WatchEvent) {
        let _ = self.sender(event.kind).send(event.clone());
        let _ = self.all.send(event);
    }

    pub(crate) fn publish_error(&self, err: WatchError) {
        tracing::debug!(error = %err, "surfacing watcher error");
        let _ = self.errors.send(Arc::new(err));
    }

    pub(crate) fn publish_ready(&self) {
        self.ready.send_replace(true);
    }

    pub(crate) fn subscribe(&self, kind: EventKind) -> broadcast::Receiver<WatchEvent> {
        self.sender(kind).subscribe()
    }

    pub(crate) fn subscribe_all(&self) -> broadcast::Receiver<WatchEvent> {
        self.all.subscribe()
    }

    pub(crate) fn subscribe_errors(&self) -> broadcast::Receiver<Arc<WatchError>> {
        self.errors.subscribe()
    }

    pub(crate) fn ready_rx(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }
}

/// One-shot barrier over the outstanding initial scans.
///
/// The count only ever decreases once armed; `ready` fires at most once per
/// watcher lifetime.
#[derive(Debug, Default)]
pub(crate) struct ReadyBarrier {
    remaining: usize,
    armed: bool,
    emitted: bool,
}

impl ReadyBarrier {
    /// Registers `n` more units that must retire before readiness.
    pub(crate) fn expect(&mut self, n: usize) {
        if n > 0 {
            self.remaining += n;
            self.armed = true;
        }
    }

    /// Retires one unit. Returns true when the barrier just completed and
    /// the caller should publish `ready`.
    pub(crate) fn retire(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        if self.armed && self.remaining == 0 && !self.emitted {
            self.emitted = true;
            true
        } else {
            false
        }
    }
}

/// Relativizes a path against the configured working directory.
pub(crate) fn relativize(config: &WatchConfig, path: &Path) -> PathBuf {
    match &config.cwd {
        Some(cwd) => match path.strip_prefix(cwd) {
            Ok(rel) if rel.as_os_str().is_empty() => PathBuf::from("."),
            Ok(rel) => rel.to_path_buf(),
            Err(_) => path.to_path_buf(),
        },
        None => path.to_path_buf(),
    }
}

/// The normalization pipeline for one candidate emission.
pub(crate) async fn emit(
    shared: &Arc<Shared>,
    kind: EventKind,
    path: PathBuf,
    meta: Option<FileMeta>,
) {
    let mut kind = kind;
    {
        let mut st = shared.state.lock().await;
        if st.closed {
            return;
        }

        // Atomic reconciliation comes first: an add must cancel a parked
        // unlink before anything else can divert it, or the pair would
        // occupy both pending tables and the unlink would still release.
        if shared.atomic_enabled {
            match kind {
                EventKind::Unlink => {
                    st.pending_unlinks.insert(path.clone());
                    atomic::spawn_release(shared.clone(), path);
                    return;
                }
                EventKind::Add if st.pending_unlinks.remove(&path) => {
                    kind = EventKind::Change;
                }
                _ => {}
            }
        }

        // A pending write swallows the event and refreshes its clock.
        if shared.config.await_write_finish.is_some()
            && matches!(kind, EventKind::Add | EventKind::Change)
        {
            if let Some(pending) = st.pending_writes.get_mut(&path) {
                pending.last_change = Instant::now();
                return;
            }
            st.pending_writes.insert(path.clone(), PendingWrite::new(kind));
            stabilize::spawn_poll(shared.clone(), path);
            return;
        }

        if kind == EventKind::Change
            && !st.throttle.admit(ThrottleAction::Change, &path, CHANGE_WINDOW)
        {
            return;
        }
    }
    dispatch(shared, kind, path, meta).await;
}

/// The tail of the pipeline: stat enrichment and channel fan-out.
///
/// Called directly by the stabilization and atomic-release tasks, which have
/// already passed (or must bypass) the earlier stages.
pub(crate) async fn dispatch(
    shared: &Arc<Shared>,
    kind: EventKind,
    path: PathBuf,
    meta: Option<FileMeta>,
) {
    let mut meta = meta;
    if shared.config.always_stat && meta.is_none() && kind.is_upsert() {
        match tokio::fs::metadata(&path).await {
            Ok(m) => meta = Some(FileMeta::from(&m)),
            // Emitting a half-formed event is worse than dropping it.
            Err(_) => return,
        }
    }
    if shared.state.lock().await.closed {
        return;
    }
    let rel = relativize(&shared.config, &path);
    shared.bus.publish(WatchEvent::new(kind, rel, meta));
}

/// Retires one ready unit; publishes `ready` on a later scheduler turn when
/// the barrier completes, so subscribers attaching in the turn that `add`
/// returned still observe it.
pub(crate) async fn retire_ready(shared: &Arc<Shared>) {
    {
        let mut st = shared.state.lock().await;
        if st.closed || !st.ready.retire() {
            return;
        }
    }
    let shared = shared.clone();
    tokio::spawn(async move {
        tokio::task::yield_now().await;
        if !shared.state.lock().await.closed {
            shared.bus.publish_ready();
        }
    });
}

/// Applies the error-propagation policy to a backend or probe failure.
pub(crate) async fn handle_backend_error(shared: &Arc<Shared>, err: WatchError) {
    match err.class() {
        ErrorClass::Benign => {
            tracing::debug!(error = %err, "swallowing benign filesystem error");
        }
        ErrorClass::Permission if shared.config.ignore_permission_errors => {
            tracing::debug!(error = %err, "swallowing permission error");
        }
        _ => {
            if !shared.state.lock().await.closed {
                shared.bus.publish_error(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_barrier_fires_once_at_zero() {
        let mut barrier = ReadyBarrier::default();
        barrier.expect(2);
        assert!(!barrier.retire());
        assert!(barrier.retire());
        assert!(!barrier.retire());
        barrier.expect(1);
        assert!(!barrier.retire());
    }

    #[test]
    fn ready_barrier_inert_until_armed() {
        let mut barrier = ReadyBarrier::default();
        assert!(!barrier.retire());
        barrier.expect(1);
        assert!(barrier.retire());
    }

    #[test]
    fn relativize_against_cwd() {
        let cfg = WatchConfig {
            cwd: Some(PathBuf::from("/base")),
            ..WatchConfig::default()
        };
        assert_eq!(relativize(&cfg, Path::new("/base/a/b")), PathBuf::from("a/b"));
        assert_eq!(relativize(&cfg, Path::new("/base")), PathBuf::from("."));
        assert_eq!(relativize(&cfg, Path::new("/else/x")), PathBuf::from("/else/x"));

        let bare = WatchConfig::default();
        assert_eq!(relativize(&bare, Path::new("/a/b")), PathBuf::from("/a/b"));
    }
}
