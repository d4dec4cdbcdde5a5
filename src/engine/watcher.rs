//! The watcher: add/unwatch orchestration and the core dispatch context.
//!
//! All engine state lives behind one lock and every backend observation is
//! funneled through one dispatch task, so core components never race each
//! other. Backends that use OS threads internally hand their results to this
//! context over a channel before anything touches core state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::backend::{
    Backend, BackendKind, BackendLink, CoreMessage, NativeBackend, PerDirBackend, PollBackend,
    RawEvent, RawKind,
};
use crate::config::{AtomicSave, WatchConfig};
use crate::engine::emitter::{self, EventBus, ReadyBarrier};
use crate::engine::ignore::IgnoreFilter;
use crate::engine::registry::WatchRegistry;
use crate::engine::removal;
use crate::engine::stabilize::PendingWrite;
use crate::engine::throttle::Throttler;
use crate::error::WatchError;
use crate::events::{EventKind, WatchEvent};
use crate::path_util::{self, split_parent};

const DEFAULT_ATOMIC_WINDOW: Duration = Duration::from_millis(100);

/// One resolved positive watch input.
#[derive(Debug)]
pub(crate) struct WatchSpec {
    /// The pattern as resolved (post brace-expansion).
    source: String,
    /// The deepest wildcard-free ancestor; what the backend observes.
    root: PathBuf,
    /// Compiled matcher; `None` for literal paths.
    matcher: Option<globset::GlobMatcher>,
}

impl WatchSpec {
    fn allows(&self, path: &Path, is_dir: bool) -> bool {
        if is_dir || self.matcher.is_none() {
            path.starts_with(&self.root)
        } else {
            self.matcher.as_ref().is_some_and(|m| m.is_match(path))
        }
    }
}

/// Mutable engine state, guarded by the one core lock.
pub(crate) struct EngineState {
    pub(crate) registry: WatchRegistry,
    pub(crate) ignore: IgnoreFilter,
    pub(crate) throttle: Throttler,
    pub(crate) pending_writes: HashMap<PathBuf, PendingWrite>,
    pub(crate) pending_unlinks: HashSet<PathBuf>,
    pub(crate) specs: Vec<WatchSpec>,
    pub(crate) ready: ReadyBarrier,
    pub(crate) closed: bool,
}

impl EngineState {
    /// Whether any watch spec claims this path.
    fn covered(&self, path: &Path, is_dir: bool) -> bool {
        self.specs.iter().any(|spec| spec.allows(path, is_dir))
    }
}

/// Everything the engine components share.
pub(crate) struct Shared {
    pub(crate) config: WatchConfig,
    pub(crate) backend_kind: BackendKind,
    pub(crate) atomic_enabled: bool,
    pub(crate) atomic_window: Duration,
    pub(crate) predoubled: bool,
    pub(crate) backend: Box<dyn Backend>,
    pub(crate) state: Mutex<EngineState>,
    pub(crate) bus: EventBus,
    pub(crate) core_tx: mpsc::UnboundedSender<CoreMessage>,
}

impl Shared {
    pub(crate) fn link(self: &Arc<Self>, silent: bool) -> BackendLink {
        BackendLink {
            tx: self.core_tx.clone(),
            shared: Arc::downgrade(self),
            follow_symlinks: self.config.follow_symlinks,
            silent,
        }
    }

    /// Re-watches a directory whose watch died with its last file.
    pub(crate) fn rearm(self: &Arc<Self>, dir: PathBuf) {
        match self.backend.watch(dir.clone(), self.link(true)) {
            Ok(closer) => {
                let _ = self.core_tx.send(CoreMessage::RegisterCloser(dir, closer));
            }
            Err(err) => {
                tracing::debug!(path = %dir.display(), error = %err, "re-arm failed");
            }
        }
    }
}

/// A filesystem watcher: give it paths and glob patterns, subscribe to a
/// normalized stream of `add`/`addDir`/`change`/`unlink`/`unlinkDir` events.
///
/// Constructed with a frozen [`WatchConfig`]; must be created and used from
/// within a Tokio runtime. Dropping the watcher tears everything down, but
/// [`close`](Self::close) releases backend resources deterministically and
/// is preferred.
pub struct Watcher {
    shared: Arc<Shared>,
}

impl Watcher {
    /// Creates a watcher, selecting a backend from the configuration.
    ///
    /// Returns the watcher and a receiver on the `all` channel.
    pub fn new(config: WatchConfig) -> Result<(Self, broadcast::Receiver<WatchEvent>), WatchError> {
        let backend: Box<dyn Backend> = match select_backend(&config) {
            BackendKind::Native => Box::new(NativeBackend::new()),
            BackendKind::PerDir => Box::new(PerDirBackend::new()?),
            BackendKind::Poll => {
                Box::new(PollBackend::new(config.interval, config.binary_interval))
            }
        };
        Self::with_backend(config, backend)
    }

    pub(crate) fn with_backend(
        config: WatchConfig,
        backend: Box<dyn Backend>,
    ) -> Result<(Self, broadcast::Receiver<WatchEvent>), WatchError> {
        let backend_kind = backend.kind();
        let (atomic_enabled, atomic_window) = resolve_atomic(config.atomic, backend_kind);
        let ignore = IgnoreFilter::new(&config.ignored, atomic_enabled)?;
        let (core_tx, core_rx) = mpsc::unbounded_channel();
        let bus = EventBus::new(config.buffer_size);
        let all_rx = bus.subscribe_all();
        let predoubled = config.persistent && backend_kind == BackendKind::Native;

        let shared = Arc::new(Shared {
            config,
            backend_kind,
            atomic_enabled,
            atomic_window,
            predoubled,
            backend,
            state: Mutex::new(EngineState {
                registry: WatchRegistry::new(),
                ignore,
                throttle: Throttler::new(),
                pending_writes: HashMap::new(),
                pending_unlinks: HashSet::new(),
                specs: Vec::new(),
                ready: ReadyBarrier::default(),
                closed: false,
            }),
            bus,
            core_tx,
        });
        tokio::spawn(run_dispatch(shared.clone(), core_rx));
        tracing::debug!(backend = ?backend_kind, "watcher created");
        Ok((Self { shared }, all_rx))
    }

    /// Starts watching the given paths.
    ///
    /// Inputs may be literal paths, glob patterns, or `!`-prefixed negations
    /// (recorded as runtime exclusions). Relative inputs resolve against the
    /// configured `cwd`. An empty input is a programmer error and fails the
    /// whole call synchronously; filesystem absences do not.
    pub async fn add<I, S>(&self, paths: I) -> Result<(), WatchError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let cwd = self.shared.config.cwd.clone();
        let mut negatives = Vec::new();
        let mut positives = Vec::new();
        for input in paths {
            let input = input.as_ref();
            if input.strip_prefix('!').unwrap_or(input).trim().is_empty() {
                return Err(WatchError::InvalidPath {
                    path: input.to_string(),
                    reason: "watch paths must be non-empty",
                });
            }
            let (negated, resolved) = path_util::resolve(input, cwd.as_deref());
            if negated {
                negatives.push(resolved);
            } else {
                positives.push(resolved);
            }
        }

        // Compile before mutating anything so a bad pattern fails fast.
        let mut new_specs = Vec::new();
        for pattern in &positives {
            if self.shared.config.disable_globbing || !path_util::is_glob(pattern) {
                new_specs.push(WatchSpec {
                    source: pattern.clone(),
                    root: PathBuf::from(pattern),
                    matcher: None,
                });
                continue;
            }
            for expanded in path_util::brace_expand(pattern) {
                let matcher = globset::GlobBuilder::new(&expanded)
                    .literal_separator(true)
                    .build()
                    .map_err(|source| WatchError::Pattern {
                        pattern: expanded.clone(),
                        source,
                    })?
                    .compile_matcher();
                new_specs.push(WatchSpec {
                    root: path_util::watch_root(&expanded),
                    source: expanded,
                    matcher: Some(matcher),
                });
            }
        }

        let to_arm: Vec<PathBuf> = {
            let mut st = self.shared.state.lock().await;
            if st.closed {
                return Err(WatchError::Closed);
            }
            for pattern in &negatives {
                st.ignore.learn(pattern);
            }
            for pattern in &positives {
                st.ignore.unlearn(pattern);
            }
            let mut roots = Vec::new();
            for spec in new_specs {
                // Arming is keyed on the live closer, not on spec presence:
                // an unwatched root keeps its spec but loses its closer and
                // must be watched again.
                if !st.registry.has_closer(&spec.root) && !roots.contains(&spec.root) {
                    roots.push(spec.root.clone());
                }
                if st.specs.iter().any(|s| s.source == spec.source) {
                    continue;
                }
                st.specs.push(spec);
            }
            let units = if self.shared.predoubled { 2 } else { 1 };
            st.ready.expect(roots.len() * units);
            roots
        };

        for root in to_arm {
            match self.shared.backend.watch(root.clone(), self.shared.link(false)) {
                Ok(closer) => {
                    let mut st = self.shared.state.lock().await;
                    if st.closed {
                        closer.close();
                    } else {
                        st.registry.put_closer(root, closer);
                    }
                }
                Err(err) => {
                    // The scan-complete signal will never come; retire its
                    // units so readiness is not wedged, then apply policy.
                    let units = if self.shared.predoubled { 2 } else { 1 };
                    for _ in 0..units {
                        emitter::retire_ready(&self.shared).await;
                    }
                    emitter::handle_backend_error(&self.shared, err).await;
                }
            }
        }
        Ok(())
    }

    /// Stops watching the given paths.
    ///
    /// Each path's closers are invoked and the path joins the runtime ignore
    /// set, so late in-flight events for it are filtered.
    pub async fn unwatch<I, S>(&self, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let cwd = self.shared.config.cwd.clone();
        let mut closers = Vec::new();
        {
            let mut st = self.shared.state.lock().await;
            if st.closed {
                return;
            }
            for input in paths {
                let (_, resolved) = path_util::resolve(input.as_ref(), cwd.as_deref());
                let path = PathBuf::from(&resolved);
                closers.extend(st.registry.take_closers_under(&path));
                st.ignore.learn(&resolved);
                st.registry.drop_subtree(&path);
            }
        }
        for closer in closers {
            closer.close();
        }
    }

    /// Closes the watcher: releases every backend watch, clears all state,
    /// and silences all future emissions. Idempotent.
    pub async fn close(&self) {
        let closers = {
            let mut st = self.shared.state.lock().await;
            if st.closed {
                return;
            }
            st.closed = true;
            st.pending_writes.clear();
            st.pending_unlinks.clear();
            st.throttle.clear();
            let closers = st.registry.drain_closers();
            st.registry.clear();
            closers
        };
        for closer in closers {
            closer.close();
        }
        let _ = self.shared.core_tx.send(CoreMessage::Shutdown);
    }

    /// Snapshot of watched directories and their known children, sorted.
    ///
    /// Keys are relativized against `cwd` when one is configured.
    pub async fn get_watched(&self) -> BTreeMap<PathBuf, Vec<String>> {
        let st = self.shared.state.lock().await;
        st.registry
            .iter()
            .map(|(dir, watched)| {
                (
                    emitter::relativize(&self.shared.config, dir),
                    watched.children().map(str::to_string).collect(),
                )
            })
            .collect()
    }

    /// Subscribes to the `all` channel (every kind except errors).
    pub fn events(&self) -> broadcast::Receiver<WatchEvent> {
        self.shared.bus.subscribe_all()
    }

    /// Subscribes to a single event kind.
    pub fn events_of(&self, kind: EventKind) -> broadcast::Receiver<WatchEvent> {
        self.shared.bus.subscribe(kind)
    }

    /// Subscribes to the error channel.
    pub fn errors(&self) -> broadcast::Receiver<Arc<WatchError>> {
        self.shared.bus.subscribe_errors()
    }

    /// Resolves once every initial scan registered so far has completed.
    /// `ready` fires at most once per watcher lifetime.
    pub async fn ready(&self) {
        let mut rx = self.shared.bus.ready_rx();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// The frozen configuration.
    pub fn config(&self) -> &WatchConfig {
        &self.shared.config
    }

    /// Which backend was selected.
    pub fn backend_kind(&self) -> BackendKind {
        self.shared.backend_kind
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        let _ = self.shared.core_tx.send(CoreMessage::Shutdown);
    }
}

fn select_backend(config: &WatchConfig) -> BackendKind {
    // An explicit request for the recursive backend outranks polling.
    if config.use_recursive == Some(true) {
        return BackendKind::Native;
    }
    if config.use_polling {
        return BackendKind::Poll;
    }
    match config.use_recursive {
        Some(false) => BackendKind::PerDir,
        _ => BackendKind::Native,
    }
}

fn resolve_atomic(setting: AtomicSave, kind: BackendKind) -> (bool, Duration) {
    match setting {
        AtomicSave::Auto => (kind == BackendKind::PerDir, DEFAULT_ATOMIC_WINDOW),
        AtomicSave::On => (true, DEFAULT_ATOMIC_WINDOW),
        AtomicSave::Off => (false, DEFAULT_ATOMIC_WINDOW),
        AtomicSave::WindowMs(ms) => (true, Duration::from_millis(ms)),
    }
}

async fn run_dispatch(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<CoreMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            CoreMessage::Shutdown => break,
            CoreMessage::Raw(event) => handle_raw(&shared, event).await,
            CoreMessage::ScanComplete => emitter::retire_ready(&shared).await,
            CoreMessage::Armed => {
                if shared.predoubled {
                    emitter::retire_ready(&shared).await;
                }
            }
            CoreMessage::RegisterCloser(path, closer) => {
                let mut st = shared.state.lock().await;
                if st.closed {
                    closer.close();
                } else {
                    st.registry.put_closer(path, closer);
                }
            }
            CoreMessage::Error(err) => emitter::handle_backend_error(&shared, err).await,
        }
    }
}

async fn handle_raw(shared: &Arc<Shared>, event: RawEvent) {
    match event.kind {
        RawKind::Create { is_dir } => {
            let kind = if is_dir { EventKind::AddDir } else { EventKind::Add };
            upsert(shared, kind, event).await;
        }
        RawKind::Modify => upsert(shared, EventKind::Change, event).await,
        RawKind::Remove => {
            if let Some((parent, name)) = split_parent(&event.path) {
                removal::remove(shared, parent, name).await;
            }
        }
    }
}

/// Filters and records a create/change observation, then hands it to the
/// emitter pipeline.
async fn upsert(shared: &Arc<Shared>, kind: EventKind, event: RawEvent) {
    let path = event.path;
    {
        let mut st = shared.state.lock().await;
        if st.closed {
            return;
        }
        if !st.covered(&path, kind == EventKind::AddDir) {
            return;
        }
        if st.ignore.is_ignored(&path, event.meta.as_ref()) {
            return;
        }
        match kind {
            EventKind::Add => {
                if let Some((parent, name)) = split_parent(&path) {
                    // An already-known child means this create is a rescan
                    // duplicate, not an appearance.
                    if !st.registry.add_child(&parent, &name) {
                        return;
                    }
                }
            }
            EventKind::AddDir => {
                let newly = st.registry.ensure(&path);
                if let Some((parent, name)) = split_parent(&path) {
                    st.registry.add_child(&parent, &name);
                }
                if !newly {
                    return;
                }
            }
            _ => {}
        }
        if event.initial && shared.config.ignore_initial {
            return;
        }
    }
    emitter::emit(shared, kind, path, event.meta).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::Closer;
    use crate::events::FileMeta;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;
    use tokio::time::{sleep, timeout};

    fn file_meta(len: u64) -> FileMeta {
        FileMeta {
            is_dir: false,
            is_symlink: false,
            len,
            modified: None,
        }
    }

    fn dir_meta() -> FileMeta {
        FileMeta {
            is_dir: true,
            is_symlink: false,
            len: 0,
            modified: None,
        }
    }

    /// A scripted backend: tests drive raw events through the captured link.
    struct ManualBackend {
        slot: Arc<StdMutex<Option<BackendLink>>>,
    }

    impl Backend for ManualBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::PerDir
        }

        fn watch(&self, _root: PathBuf, link: BackendLink) -> Result<Closer, WatchError> {
            if !link.silent {
                *self.slot.lock().unwrap() = Some(link.clone());
            }
            link.scan_complete();
            Ok(Closer::noop())
        }
    }

    fn manual_watcher(
        config: WatchConfig,
    ) -> (
        Watcher,
        broadcast::Receiver<WatchEvent>,
        Arc<StdMutex<Option<BackendLink>>>,
    ) {
        let slot = Arc::new(StdMutex::new(None));
        let backend = ManualBackend { slot: slot.clone() };
        let (watcher, rx) = Watcher::with_backend(config, Box::new(backend)).unwrap();
        (watcher, rx, slot)
    }

    fn take_link(slot: &Arc<StdMutex<Option<BackendLink>>>) -> BackendLink {
        slot.lock().unwrap().clone().unwrap()
    }

    fn poll_config(interval_ms: u64) -> WatchConfig {
        WatchConfig {
            use_polling: true,
            interval: Duration::from_millis(interval_ms),
            binary_interval: Duration::from_millis(interval_ms * 3),
            ..WatchConfig::default()
        }
    }

    async fn drain_for(
        rx: &mut broadcast::Receiver<WatchEvent>,
        duration: Duration,
    ) -> Vec<WatchEvent> {
        let mut out = Vec::new();
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(event)) => out.push(event),
                _ => break,
            }
        }
        out
    }

    #[test]
    fn backend_selection_precedence() {
        let auto = WatchConfig::default();
        assert_eq!(select_backend(&auto), BackendKind::Native);

        let polling = WatchConfig {
            use_polling: true,
            ..WatchConfig::default()
        };
        assert_eq!(select_backend(&polling), BackendKind::Poll);

        let per_dir = WatchConfig {
            use_recursive: Some(false),
            ..WatchConfig::default()
        };
        assert_eq!(select_backend(&per_dir), BackendKind::PerDir);

        // Explicit recursive outranks polling.
        let both = WatchConfig {
            use_recursive: Some(true),
            use_polling: true,
            ..WatchConfig::default()
        };
        assert_eq!(select_backend(&both), BackendKind::Native);
    }

    #[test]
    fn atomic_defaults_follow_backend() {
        assert!(resolve_atomic(AtomicSave::Auto, BackendKind::PerDir).0);
        assert!(!resolve_atomic(AtomicSave::Auto, BackendKind::Native).0);
        assert!(!resolve_atomic(AtomicSave::Auto, BackendKind::Poll).0);
        assert!(resolve_atomic(AtomicSave::On, BackendKind::Poll).0);
        assert!(!resolve_atomic(AtomicSave::Off, BackendKind::PerDir).0);
        let (on, window) = resolve_atomic(AtomicSave::WindowMs(250), BackendKind::Poll);
        assert!(on);
        assert_eq!(window, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn empty_path_is_a_programmer_error() {
        let (watcher, _rx, _slot) = manual_watcher(WatchConfig::default());
        let err = watcher.add([""]).await.unwrap_err();
        assert!(matches!(err, WatchError::InvalidPath { .. }));
        let err = watcher.add(["!"]).await.unwrap_err();
        assert!(matches!(err, WatchError::InvalidPath { .. }));
    }

    #[tokio::test]
    async fn ready_fires_after_initial_scan() {
        let (watcher, _rx, _slot) = manual_watcher(WatchConfig::default());
        watcher.add(["/w"]).await.unwrap();
        timeout(Duration::from_secs(1), watcher.ready())
            .await
            .expect("ready never fired");
    }

    #[tokio::test]
    async fn atomic_unlink_then_add_fuses_into_change() {
        let config = WatchConfig {
            atomic: AtomicSave::WindowMs(150),
            ..WatchConfig::default()
        };
        let (watcher, mut rx, slot) = manual_watcher(config);
        watcher.add(["/w"]).await.unwrap();
        let link = take_link(&slot);

        link.raw(RawEvent::created(PathBuf::from("/w/x.txt"), file_meta(2), true));
        let seeded = drain_for(&mut rx, Duration::from_millis(100)).await;
        assert_eq!(seeded.len(), 1);
        assert_eq!(seeded[0].kind, EventKind::Add);

        link.raw(RawEvent::removed(PathBuf::from("/w/x.txt")));
        sleep(Duration::from_millis(20)).await;
        link.raw(RawEvent::created(PathBuf::from("/w/x.txt"), file_meta(3), false));

        let events = drain_for(&mut rx, Duration::from_millis(400)).await;
        assert_eq!(events.len(), 1, "expected exactly one fused event: {events:?}");
        assert_eq!(events[0].kind, EventKind::Change);
        assert_eq!(events[0].path, PathBuf::from("/w/x.txt"));
    }

    #[tokio::test]
    async fn unmatched_pending_unlink_is_released() {
        let config = WatchConfig {
            atomic: AtomicSave::WindowMs(80),
            ..WatchConfig::default()
        };
        let (watcher, mut rx, slot) = manual_watcher(config);
        watcher.add(["/w"]).await.unwrap();
        let link = take_link(&slot);

        link.raw(RawEvent::created(PathBuf::from("/w/x.txt"), file_meta(2), true));
        drain_for(&mut rx, Duration::from_millis(50)).await;

        link.raw(RawEvent::removed(PathBuf::from("/w/x.txt")));
        let events = drain_for(&mut rx, Duration::from_millis(300)).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Unlink);
    }

    #[tokio::test]
    async fn atomic_rewrite_wins_over_write_stabilization() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("x.txt");
        std::fs::write(&file, b"ab").unwrap();

        let config = WatchConfig {
            await_write_finish: Some(crate::config::WriteStability {
                stability_threshold: Duration::from_millis(150),
                poll_interval: Duration::from_millis(50),
            }),
            atomic: AtomicSave::WindowMs(100),
            ..WatchConfig::default()
        };
        let (watcher, mut rx, slot) = manual_watcher(config);
        watcher.add([tmp.path().to_str().unwrap()]).await.unwrap();
        let link = take_link(&slot);

        // Seed the file and let its held add stabilize out.
        link.raw(RawEvent::created(file.clone(), file_meta(2), true));
        let seeded = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("seeded add never stabilized")
            .unwrap();
        assert_eq!(seeded.kind, EventKind::Add);

        // Unlink parks; the add inside the window must cancel it and come
        // back out of stabilization as a single change.
        link.raw(RawEvent::removed(file.clone()));
        sleep(Duration::from_millis(20)).await;
        link.raw(RawEvent::created(file.clone(), file_meta(2), false));

        let events = drain_for(&mut rx, Duration::from_millis(700)).await;
        assert_eq!(events.len(), 1, "expected exactly one fused event: {events:?}");
        assert_eq!(events[0].kind, EventKind::Change);
        assert_eq!(events[0].path, file);
        assert!(!events.iter().any(|e| e.kind == EventKind::Unlink));
    }

    #[tokio::test]
    async fn rapid_changes_are_throttled() {
        let (watcher, mut rx, slot) = manual_watcher(WatchConfig::default());
        watcher.add(["/w"]).await.unwrap();
        let link = take_link(&slot);

        link.raw(RawEvent::modified(PathBuf::from("/w/a.txt"), Some(file_meta(1))));
        link.raw(RawEvent::modified(PathBuf::from("/w/a.txt"), Some(file_meta(2))));
        link.raw(RawEvent::modified(PathBuf::from("/w/a.txt"), Some(file_meta(3))));

        let events = drain_for(&mut rx, Duration::from_millis(200)).await;
        let changes: Vec<_> = events.iter().filter(|e| e.kind == EventKind::Change).collect();
        assert_eq!(changes.len(), 1, "one change per 50ms window: {events:?}");
    }

    #[tokio::test]
    async fn write_stabilization_waits_for_growth_to_stop() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("big");
        std::fs::write(&file, b"a").unwrap();

        let config = WatchConfig {
            await_write_finish: Some(crate::config::WriteStability {
                stability_threshold: Duration::from_millis(200),
                poll_interval: Duration::from_millis(50),
            }),
            ..WatchConfig::default()
        };
        let (watcher, mut rx, slot) = manual_watcher(config);
        watcher.add([tmp.path().to_str().unwrap()]).await.unwrap();
        let link = take_link(&slot);

        link.raw(RawEvent::created(file.clone(), file_meta(1), false));

        let writer = file.clone();
        let append = tokio::spawn(async move {
            for _ in 0..10 {
                sleep(Duration::from_millis(40)).await;
                let mut content = std::fs::read(&writer).unwrap();
                content.push(b'b');
                std::fs::write(&writer, content).unwrap();
            }
        });

        let during = drain_for(&mut rx, Duration::from_millis(300)).await;
        assert!(during.is_empty(), "no emission while still growing: {during:?}");
        append.await.unwrap();

        let event = timeout(Duration::from_millis(1500), rx.recv())
            .await
            .expect("stabilized event never arrived")
            .unwrap();
        assert_eq!(event.kind, EventKind::Add);
        assert_eq!(event.path, file);
        assert_eq!(event.meta.unwrap().len, 11);
    }

    #[tokio::test]
    async fn removal_cancels_unstabilized_add_silently() {
        let config = WatchConfig {
            await_write_finish: Some(crate::config::WriteStability {
                stability_threshold: Duration::from_millis(600),
                // Wide enough that the removal below lands before the first
                // poll can notice the path never existed.
                poll_interval: Duration::from_millis(300),
            }),
            atomic: AtomicSave::Off,
            ..WatchConfig::default()
        };
        let (watcher, mut rx, slot) = manual_watcher(config);
        watcher.add(["/w"]).await.unwrap();
        let link = take_link(&slot);

        link.raw(RawEvent::created(PathBuf::from("/w/ghost"), file_meta(1), false));
        sleep(Duration::from_millis(30)).await;
        link.raw(RawEvent::removed(PathBuf::from("/w/ghost")));

        let events = drain_for(&mut rx, Duration::from_millis(500)).await;
        assert!(events.is_empty(), "the file never materialized: {events:?}");
    }

    #[tokio::test]
    async fn closed_watchers_emit_nothing() {
        let (watcher, mut rx, slot) = manual_watcher(WatchConfig::default());
        watcher.add(["/w"]).await.unwrap();
        let link = take_link(&slot);

        watcher.close().await;
        link.raw(RawEvent::created(PathBuf::from("/w/late.txt"), file_meta(1), false));

        let events = drain_for(&mut rx, Duration::from_millis(150)).await;
        assert!(events.is_empty());
        assert!(matches!(watcher.add(["/w"]).await, Err(WatchError::Closed)));
        // Idempotent.
        watcher.close().await;
    }

    #[tokio::test]
    async fn get_watched_relativizes_and_sorts() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let config = WatchConfig {
            cwd: Some(root.clone()),
            ..WatchConfig::default()
        };
        let (watcher, _rx, slot) = manual_watcher(config);
        watcher.add([root.to_str().unwrap()]).await.unwrap();
        let link = take_link(&slot);

        link.raw(RawEvent::created(root.clone(), dir_meta(), true));
        link.raw(RawEvent::created(root.join("sub"), dir_meta(), true));
        link.raw(RawEvent::created(root.join("sub/b.txt"), file_meta(1), true));
        link.raw(RawEvent::created(root.join("sub/a.txt"), file_meta(1), true));
        sleep(Duration::from_millis(100)).await;

        let watched = watcher.get_watched().await;
        assert_eq!(watched.get(Path::new(".")).unwrap(), &vec!["sub".to_string()]);
        assert_eq!(
            watched.get(Path::new("sub")).unwrap(),
            &vec!["a.txt".to_string(), "b.txt".to_string()]
        );
    }

    #[tokio::test]
    async fn plain_add_then_ready() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"hi").unwrap();

        let (watcher, mut rx) = Watcher::with_backend(
            poll_config(25),
            Box::new(PollBackend::new(
                Duration::from_millis(25),
                Duration::from_millis(75),
            )),
        )
        .unwrap();
        watcher.add([tmp.path().to_str().unwrap()]).await.unwrap();

        let event = timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.unwrap();
                if event.kind == EventKind::Add {
                    return event;
                }
            }
        })
        .await
        .expect("initial add never arrived");
        assert_eq!(event.path, tmp.path().join("a.txt"));

        timeout(Duration::from_secs(1), watcher.ready())
            .await
            .expect("ready never fired");
        watcher.close().await;
    }

    #[tokio::test]
    async fn glob_watch_filters_files_but_reports_dirs() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let pattern = format!("{}/**/*.log", root.display());

        let mut config = poll_config(25);
        config.ignore_initial = true;
        let (watcher, mut rx) = Watcher::with_backend(
            config,
            Box::new(PollBackend::new(
                Duration::from_millis(25),
                Duration::from_millis(75),
            )),
        )
        .unwrap();
        watcher.add([pattern.as_str()]).await.unwrap();
        watcher.ready().await;

        std::fs::write(root.join("a.log"), b"x").unwrap();
        std::fs::create_dir(root.join("sub")).unwrap();
        std::fs::write(root.join("sub/b.log"), b"x").unwrap();
        std::fs::write(root.join("sub/b.txt"), b"x").unwrap();

        let events = drain_for(&mut rx, Duration::from_millis(800)).await;
        let kinds: Vec<(EventKind, PathBuf)> =
            events.iter().map(|e| (e.kind, e.path.clone())).collect();
        assert!(kinds.contains(&(EventKind::Add, root.join("a.log"))), "{kinds:?}");
        assert!(kinds.contains(&(EventKind::AddDir, root.join("sub"))), "{kinds:?}");
        assert!(kinds.contains(&(EventKind::Add, root.join("sub/b.log"))), "{kinds:?}");
        assert!(
            !events.iter().any(|e| e.path.ends_with("b.txt")),
            "non-matching file leaked: {kinds:?}"
        );
        watcher.close().await;
    }

    #[tokio::test]
    async fn negated_subtree_stays_silent() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();

        let mut config = poll_config(25);
        config.ignore_initial = true;
        let (watcher, mut rx) = Watcher::with_backend(
            config,
            Box::new(PollBackend::new(
                Duration::from_millis(25),
                Duration::from_millis(75),
            )),
        )
        .unwrap();
        let negation = format!("!{}/skip", root.display());
        watcher
            .add([root.to_str().unwrap(), negation.as_str()])
            .await
            .unwrap();
        watcher.ready().await;

        std::fs::create_dir(root.join("skip")).unwrap();
        std::fs::create_dir(root.join("keep")).unwrap();
        std::fs::write(root.join("skip/x"), b"x").unwrap();
        std::fs::write(root.join("keep/y"), b"y").unwrap();

        let events = drain_for(&mut rx, Duration::from_millis(800)).await;
        assert!(
            events.iter().any(|e| e.path == root.join("keep/y")),
            "{events:?}"
        );
        assert!(
            !events.iter().any(|e| e.path.starts_with(root.join("skip"))),
            "negated subtree leaked: {events:?}"
        );
        watcher.close().await;
    }

    #[tokio::test]
    async fn recursive_removal_children_first_no_duplicates() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        std::fs::create_dir_all(root.join("d1/d2")).unwrap();
        std::fs::write(root.join("d1/d2/f"), b"x").unwrap();

        let mut config = poll_config(25);
        config.ignore_initial = true;
        let (watcher, mut rx) = Watcher::with_backend(
            config,
            Box::new(PollBackend::new(
                Duration::from_millis(25),
                Duration::from_millis(75),
            )),
        )
        .unwrap();
        watcher.add([root.to_str().unwrap()]).await.unwrap();
        watcher.ready().await;
        // Let the first diff tick settle on the initial snapshot.
        sleep(Duration::from_millis(60)).await;

        std::fs::remove_dir_all(root.join("d1")).unwrap();

        let events = drain_for(&mut rx, Duration::from_millis(1200)).await;
        let removals: Vec<(EventKind, PathBuf)> =
            events.iter().map(|e| (e.kind, e.path.clone())).collect();
        let expected = vec![
            (EventKind::Unlink, root.join("d1/d2/f")),
            (EventKind::UnlinkDir, root.join("d1/d2")),
            (EventKind::UnlinkDir, root.join("d1")),
        ];
        assert_eq!(removals, expected, "children first, exactly once");
        watcher.close().await;
    }

    #[tokio::test]
    async fn unwatch_then_add_behaves_like_fresh() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        std::fs::write(root.join("a.txt"), b"x").unwrap();

        let (watcher, mut rx) = Watcher::with_backend(
            poll_config(25),
            Box::new(PollBackend::new(
                Duration::from_millis(25),
                Duration::from_millis(75),
            )),
        )
        .unwrap();
        watcher.add([root.to_str().unwrap()]).await.unwrap();
        let first = drain_for(&mut rx, Duration::from_millis(300)).await;
        assert!(first.iter().any(|e| e.kind == EventKind::Add));

        watcher.unwatch([root.to_str().unwrap()]).await;
        std::fs::write(root.join("b.txt"), b"y").unwrap();
        let silent = drain_for(&mut rx, Duration::from_millis(300)).await;
        assert!(silent.is_empty(), "unwatched path leaked: {silent:?}");

        watcher.add([root.to_str().unwrap()]).await.unwrap();
        let again = drain_for(&mut rx, Duration::from_millis(500)).await;
        let added: Vec<&PathBuf> = again
            .iter()
            .filter(|e| e.kind == EventKind::Add)
            .map(|e| &e.path)
            .collect();
        assert!(added.contains(&&root.join("a.txt")), "{added:?}");
        assert!(added.contains(&&root.join("b.txt")), "{added:?}");
        watcher.close().await;
    }

    #[tokio::test]
    async fn pending_tables_stay_disjoint() {
        let config = WatchConfig {
            await_write_finish: Some(crate::config::WriteStability {
                stability_threshold: Duration::from_millis(600),
                poll_interval: Duration::from_millis(300),
            }),
            atomic: AtomicSave::WindowMs(100),
            ..WatchConfig::default()
        };
        let (watcher, _rx, slot) = manual_watcher(config);
        watcher.add(["/w"]).await.unwrap();
        let link = take_link(&slot);

        // Seed a tracked file so its removal parks a pending unlink.
        link.raw(RawEvent::created(PathBuf::from("/w/b"), file_meta(1), true));
        sleep(Duration::from_millis(30)).await;
        {
            let mut st = watcher.shared.state.lock().await;
            st.pending_writes.clear();
        }

        link.raw(RawEvent::created(PathBuf::from("/w/a"), file_meta(1), false));
        link.raw(RawEvent::removed(PathBuf::from("/w/b")));
        sleep(Duration::from_millis(30)).await;

        {
            let st = watcher.shared.state.lock().await;
            assert!(st.pending_writes.contains_key(Path::new("/w/a")));
            assert!(st.pending_unlinks.contains(Path::new("/w/b")));
            for path in st.pending_writes.keys() {
                assert!(!st.pending_unlinks.contains(path));
            }
        }
        sleep(Duration::from_millis(300)).await;
    }
}
