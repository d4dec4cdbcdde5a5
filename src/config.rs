//! Watcher configuration.
//!
//! A [`WatchConfig`] is assembled through [`WatchConfigBuilder`] and frozen
//! once the watcher is constructed: the watcher takes it by value and never
//! exposes a mutable handle.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::events::FileMeta;

/// Environment variable forcing polling on or off.
pub const ENV_USE_POLLING: &str = "PATHWATCH_USEPOLLING";
/// Environment variable overriding the polling interval in milliseconds.
pub const ENV_INTERVAL: &str = "PATHWATCH_INTERVAL";

/// An ignore source: either a glob pattern or an arbitrary predicate over
/// the path and (when available) its metadata.
#[derive(Clone)]
pub enum IgnorePattern {
    /// A glob pattern matched against the full path.
    Glob(String),
    /// A predicate receiving the path and an optional stat snapshot.
    Predicate(Arc<dyn Fn(&Path, Option<&FileMeta>) -> bool + Send + Sync>),
}

impl fmt::Debug for IgnorePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnorePattern::Glob(g) => f.debug_tuple("Glob").field(g).finish(),
            IgnorePattern::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl From<&str> for IgnorePattern {
    fn from(s: &str) -> Self {
        IgnorePattern::Glob(s.to_string())
    }
}

impl From<String> for IgnorePattern {
    fn from(s: String) -> Self {
        IgnorePattern::Glob(s)
    }
}

/// Atomic-save reconciliation setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AtomicSave {
    /// Enabled iff the selected backend is the per-directory one.
    #[default]
    Auto,
    /// Force-enabled with the default 100 ms window.
    On,
    /// Disabled.
    Off,
    /// Force-enabled with a custom window.
    WindowMs(u64),
}

/// Write-stabilization parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteStability {
    /// How long the size must stay constant before the event is released.
    pub stability_threshold: Duration,
    /// How often the file is re-stat'ed while pending.
    pub poll_interval: Duration,
}

impl Default for WriteStability {
    fn default() -> Self {
        Self {
            stability_threshold: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Frozen watcher configuration.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Keep one extra ready unit pending until the recursive backend is
    /// armed (mirrors keeping the process alive while watching).
    pub persistent: bool,
    /// Suppress events produced by the initial enumeration.
    pub ignore_initial: bool,
    /// Swallow permission-denied errors instead of surfacing them.
    pub ignore_permission_errors: bool,
    /// Polling interval.
    pub interval: Duration,
    /// Polling interval for files with known-binary extensions.
    pub binary_interval: Duration,
    /// Treat all inputs as literal paths.
    pub disable_globbing: bool,
    /// Force (`Some(true)`) or forbid (`Some(false)`) the recursive backend.
    pub use_recursive: Option<bool>,
    /// Force the polling backend.
    pub use_polling: bool,
    /// Atomic-save reconciliation.
    pub atomic: AtomicSave,
    /// Follow symlinks when classifying and descending.
    pub follow_symlinks: bool,
    /// Hold `add`/`change` events until the file's size stabilizes.
    pub await_write_finish: Option<WriteStability>,
    /// Ignore sources evaluated as a disjunction.
    pub ignored: Vec<IgnorePattern>,
    /// Working directory; emitted paths are relativized against it.
    pub cwd: Option<PathBuf>,
    /// Stat-enrich `add`/`addDir`/`change` events that arrive without one.
    pub always_stat: bool,
    /// Capacity of each subscriber channel.
    pub buffer_size: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            persistent: true,
            ignore_initial: false,
            ignore_permission_errors: false,
            interval: Duration::from_millis(100),
            binary_interval: Duration::from_millis(300),
            disable_globbing: false,
            use_recursive: None,
            use_polling: false,
            atomic: AtomicSave::Auto,
            follow_symlinks: true,
            await_write_finish: None,
            ignored: Vec::new(),
            cwd: None,
            always_stat: false,
            buffer_size: 256,
        }
    }
}

impl WatchConfig {
    /// Starts building a configuration.
    pub fn builder() -> WatchConfigBuilder {
        WatchConfigBuilder::default()
    }
}

/// Builder for [`WatchConfig`] with sensible defaults.
///
/// Environment overrides are applied in [`build`](Self::build), after all
/// explicit settings.
#[derive(Debug, Default)]
pub struct WatchConfigBuilder {
    cfg: WatchConfig,
}

impl WatchConfigBuilder {
    /// See [`WatchConfig::persistent`].
    pub fn persistent(mut self, yes: bool) -> Self {
        self.cfg.persistent = yes;
        self
    }

    /// See [`WatchConfig::ignore_initial`].
    pub fn ignore_initial(mut self, yes: bool) -> Self {
        self.cfg.ignore_initial = yes;
        self
    }

    /// See [`WatchConfig::ignore_permission_errors`].
    pub fn ignore_permission_errors(mut self, yes: bool) -> Self {
        self.cfg.ignore_permission_errors = yes;
        self
    }

    /// See [`WatchConfig::interval`].
    pub fn interval(mut self, interval: Duration) -> Self {
        self.cfg.interval = interval;
        self
    }

    /// See [`WatchConfig::binary_interval`].
    pub fn binary_interval(mut self, interval: Duration) -> Self {
        self.cfg.binary_interval = interval;
        self
    }

    /// See [`WatchConfig::disable_globbing`].
    pub fn disable_globbing(mut self, yes: bool) -> Self {
        self.cfg.disable_globbing = yes;
        self
    }

    /// See [`WatchConfig::use_recursive`].
    pub fn use_recursive(mut self, yes: bool) -> Self {
        self.cfg.use_recursive = Some(yes);
        self
    }

    /// See [`WatchConfig::use_polling`].
    pub fn use_polling(mut self, yes: bool) -> Self {
        self.cfg.use_polling = yes;
        self
    }

    /// See [`WatchConfig::atomic`].
    pub fn atomic(mut self, setting: AtomicSave) -> Self {
        self.cfg.atomic = setting;
        self
    }

    /// See [`WatchConfig::follow_symlinks`].
    pub fn follow_symlinks(mut self, yes: bool) -> Self {
        self.cfg.follow_symlinks = yes;
        self
    }

    /// Enables write-stabilization with the default parameters
    /// (2000 ms threshold, 100 ms poll).
    pub fn await_write_finish(mut self, yes: bool) -> Self {
        self.cfg.await_write_finish = yes.then(WriteStability::default);
        self
    }

    /// Enables write-stabilization with explicit parameters.
    pub fn await_write_finish_with(mut self, params: WriteStability) -> Self {
        self.cfg.await_write_finish = Some(params);
        self
    }

    /// Appends an ignore source.
    pub fn ignored(mut self, pattern: impl Into<IgnorePattern>) -> Self {
        self.cfg.ignored.push(pattern.into());
        self
    }

    /// Appends an ignore predicate.
    pub fn ignored_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Path, Option<&FileMeta>) -> bool + Send + Sync + 'static,
    {
        self.cfg.ignored.push(IgnorePattern::Predicate(Arc::new(f)));
        self
    }

    /// See [`WatchConfig::cwd`].
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cfg.cwd = Some(dir.into());
        self
    }

    /// See [`WatchConfig::always_stat`].
    pub fn always_stat(mut self, yes: bool) -> Self {
        self.cfg.always_stat = yes;
        self
    }

    /// See [`WatchConfig::buffer_size`].
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.cfg.buffer_size = size;
        self
    }

    /// Finalizes the configuration, applying environment overrides.
    pub fn build(mut self) -> WatchConfig {
        if let Some(force) = env_use_polling() {
            self.cfg.use_polling = force;
        }
        if let Some(interval) = env_interval() {
            self.cfg.interval = interval;
        }
        self.cfg
    }
}

fn env_use_polling() -> Option<bool> {
    let raw = std::env::var(ENV_USE_POLLING).ok()?;
    match raw.as_str() {
        "" => None,
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        other => {
            tracing::warn!(
                value = other,
                "{ENV_USE_POLLING} is not one of true/1/false/0; treating as enabled"
            );
            Some(true)
        }
    }
}

fn env_interval() -> Option<Duration> {
    let raw = std::env::var(ENV_INTERVAL).ok()?;
    match raw.parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            tracing::warn!(value = raw.as_str(), "{ENV_INTERVAL} is not an integer; ignoring");
            None
        }
    }
}
