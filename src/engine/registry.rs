//! The watched-directory registry.
//!
//! An in-memory model of which directories are observed and which child
//! basenames are currently known to exist under each. The registry also owns
//! every [`Closer`] handed back by a backend; the removal engine and
//! `close()` are the only release paths.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

/// A cancellation handle bound to one watched path.
///
/// Invoking it releases the OS resources behind that watch. Closers are
/// idempotent-safe by construction: the registry removes an entry before
/// invoking it, so a path's closer can run at most once.
pub struct Closer(Option<Box<dyn FnOnce() + Send>>);

impl Closer {
    /// Wraps a release action.
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(release)))
    }

    /// A closer that releases nothing.
    pub fn noop() -> Self {
        Self(None)
    }

    /// Releases the watch.
    pub fn close(mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

impl fmt::Debug for Closer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Closer")
    }
}

/// One watched directory: the set of child basenames known to exist.
#[derive(Debug, Default)]
pub struct WatchedDir {
    children: BTreeSet<String>,
}

impl WatchedDir {
    /// Records a child basename. `.` and `..` are silently ignored.
    /// Returns true when the child was not previously known.
    pub fn add(&mut self, name: &str) -> bool {
        if name == "." || name == ".." {
            return false;
        }
        self.children.insert(name.to_string())
    }

    /// Forgets a child basename. Returns true when it was known.
    pub fn remove(&mut self, name: &str) -> bool {
        self.children.remove(name)
    }

    /// Whether the basename is currently known.
    pub fn has(&self, name: &str) -> bool {
        self.children.contains(name)
    }

    /// The known children, sorted.
    pub fn children(&self) -> impl Iterator<Item = &str> {
        self.children.iter().map(String::as_str)
    }

    /// Whether no children are known.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

/// Mapping from absolute canonical directory path to its [`WatchedDir`],
/// plus the closers owned on behalf of backends.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    dirs: HashMap<PathBuf, WatchedDir>,
    closers: HashMap<PathBuf, Closer>,
}

impl WatchRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures a directory entry exists. Returns true when newly created.
    pub fn ensure(&mut self, dir: &Path) -> bool {
        if self.dirs.contains_key(dir) {
            false
        } else {
            self.dirs.insert(dir.to_path_buf(), WatchedDir::default());
            true
        }
    }

    /// Looks up a directory entry.
    pub fn get(&self, dir: &Path) -> Option<&WatchedDir> {
        self.dirs.get(dir)
    }

    /// Records `name` as a child of `dir`, creating the entry lazily.
    /// Returns true when the child was not previously known.
    pub fn add_child(&mut self, dir: &Path, name: &str) -> bool {
        self.dirs.entry(dir.to_path_buf()).or_default().add(name)
    }

    /// Forgets a child of `dir`. Returns true when it was known.
    pub fn remove_child(&mut self, dir: &Path, name: &str) -> bool {
        self.dirs.get_mut(dir).map(|d| d.remove(name)).unwrap_or(false)
    }

    /// Whether `dir` currently lists `name` as a child.
    pub fn has_child(&self, dir: &Path, name: &str) -> bool {
        self.dirs.get(dir).map(|d| d.has(name)).unwrap_or(false)
    }

    /// Whether `path` is itself a watched directory.
    pub fn contains_dir(&self, path: &Path) -> bool {
        self.dirs.contains_key(path)
    }

    /// Drops a directory entry. Returns true when it existed.
    pub fn drop_dir(&mut self, path: &Path) -> bool {
        self.dirs.remove(path).is_some()
    }

    /// Number of watched directories.
    pub fn dir_count(&self) -> usize {
        self.dirs.len()
    }

    /// Iterates all watched directories.
    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &WatchedDir)> {
        self.dirs.iter()
    }

    /// Drops every directory entry at or under `prefix` and detaches the
    /// prefix from its parent's child set.
    pub fn drop_subtree(&mut self, prefix: &Path) {
        let doomed: Vec<PathBuf> = self
            .dirs
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect();
        for path in doomed {
            self.dirs.remove(&path);
        }
        if let Some(parent) = prefix.parent() {
            if let (Some(dir), Some(name)) = (
                self.dirs.get_mut(parent),
                prefix.file_name().and_then(|n| n.to_str()),
            ) {
                dir.remove(name);
            }
        }
    }

    /// Whether a closer is currently held for `path`.
    pub fn has_closer(&self, path: &Path) -> bool {
        self.closers.contains_key(path)
    }

    /// Stores the closer for a path, releasing any previous one.
    pub fn put_closer(&mut self, path: PathBuf, closer: Closer) {
        if let Some(old) = self.closers.insert(path, closer) {
            old.close();
        }
    }

    /// Removes and returns the closer for a path.
    pub fn take_closer(&mut self, path: &Path) -> Option<Closer> {
        self.closers.remove(path)
    }

    /// Removes and returns every closer at or under `prefix`.
    pub fn take_closers_under(&mut self, prefix: &Path) -> Vec<Closer> {
        let keys: Vec<PathBuf> = self
            .closers
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect();
        keys.iter().filter_map(|k| self.closers.remove(k)).collect()
    }

    /// Removes and returns every closer.
    pub fn drain_closers(&mut self) -> Vec<Closer> {
        self.closers.drain().map(|(_, c)| c).collect()
    }

    /// Drops all state.
    pub fn clear(&mut self) {
        self.dirs.clear();
        self.closers.clear();
    }
}
