//! Duplicate-action suppression.
//!
//! The first `(action, path)` in a window is admitted and opens an entry;
//! repeats inside the window are suppressed and counted. Entries expire
//! lazily on the next lookup past their deadline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Window applied to `change` emissions.
pub(crate) const CHANGE_WINDOW: Duration = Duration::from_millis(50);
/// Window applied to removal operations, guarding double-removal races.
pub(crate) const REMOVE_WINDOW: Duration = Duration::from_millis(100);

/// The throttled action classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThrottleAction {
    /// A `change` emission.
    Change,
    /// A removal operation.
    Remove,
}

#[derive(Debug)]
struct ThrottleEntry {
    expires_at: Instant,
    count: u32,
}

/// Per `(action, path)` suppression table.
#[derive(Debug, Default)]
pub struct Throttler {
    entries: HashMap<(ThrottleAction, PathBuf), ThrottleEntry>,
}

impl Throttler {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the action should proceed; false when it is a
    /// duplicate inside the live window.
    pub fn admit(&mut self, action: ThrottleAction, path: &Path, window: Duration) -> bool {
        let now = Instant::now();
        if self.entries.len() > 4096 {
            self.entries.retain(|_, e| e.expires_at > now);
        }
        let key = (action, path.to_path_buf());
        match self.entries.get_mut(&key) {
            Some(entry) if entry.expires_at > now => {
                entry.count += 1;
                false
            }
            _ => {
                self.entries.insert(
                    key,
                    ThrottleEntry {
                        expires_at: now + window,
                        count: 0,
                    },
                );
                true
            }
        }
    }

    /// How many duplicates were suppressed in the current window.
    pub fn suppressed(&self, action: ThrottleAction, path: &Path) -> u32 {
        self.entries
            .get(&(action, path.to_path_buf()))
            .map(|e| e.count)
            .unwrap_or(0)
    }

    /// Drops all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
