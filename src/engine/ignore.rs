//! The compound ignore filter.
//!
//! Three sources, evaluated as a disjunction: user-supplied patterns and
//! predicates, runtime-learned paths (negated inputs and unwatched paths),
//! and well-known editor sidecar names when atomic-save detection is active.
//! The compiled glob matcher is cached and rebuilt lazily after mutation.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use crate::config::IgnorePattern;
use crate::error::WatchError;
use crate::events::FileMeta;
use crate::path_util::glob_escape;

type Predicate = Arc<dyn Fn(&Path, Option<&FileMeta>) -> bool + Send + Sync>;

/// Evaluates whether a path is excluded from watching.
pub struct IgnoreFilter {
    user_globs: Vec<String>,
    predicates: Vec<Predicate>,
    learned: BTreeSet<String>,
    atomic_enabled: bool,
    compiled: Option<GlobSet>,
}

impl IgnoreFilter {
    /// Builds the filter, validating user glob patterns eagerly so a bad
    /// pattern fails construction instead of a later lookup.
    pub fn new(patterns: &[IgnorePattern], atomic_enabled: bool) -> Result<Self, WatchError> {
        let mut user_globs = Vec::new();
        let mut predicates = Vec::new();
        for pattern in patterns {
            match pattern {
                IgnorePattern::Glob(g) => {
                    compile_one(g)?;
                    user_globs.push(g.clone());
                }
                IgnorePattern::Predicate(f) => predicates.push(f.clone()),
            }
        }
        Ok(Self {
            user_globs,
            predicates,
            learned: BTreeSet::new(),
            atomic_enabled,
            compiled: None,
        })
    }

    /// Records a runtime-learned exclusion for `path` and its subtree.
    pub fn learn(&mut self, path: &str) {
        let escaped = glob_escape(path);
        self.learned.insert(escaped.clone());
        self.learned.insert(format!("{escaped}/**"));
        self.compiled = None;
    }

    /// Drops a previously learned exclusion (both the path and its subtree
    /// form), so a re-added path is observable again.
    pub fn unlearn(&mut self, path: &str) {
        let escaped = glob_escape(path);
        let removed_plain = self.learned.remove(&escaped);
        let removed_tree = self.learned.remove(&format!("{escaped}/**"));
        if removed_plain || removed_tree {
            self.compiled = None;
        }
    }

    /// Whether the path is excluded.
    pub fn is_ignored(&mut self, path: &Path, meta: Option<&FileMeta>) -> bool {
        if self.atomic_enabled {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if is_editor_artifact(name) {
                    return true;
                }
            }
        }
        if self.matcher().is_match(path) {
            return true;
        }
        self.predicates.iter().any(|f| f(path, meta))
    }

    fn matcher(&mut self) -> &GlobSet {
        if self.compiled.is_none() {
            let mut builder = GlobSetBuilder::new();
            for glob in self.learned.iter().chain(self.user_globs.iter()) {
                if let Ok(g) = compile_one(glob) {
                    builder.add(g);
                }
            }
            // User patterns also match as directory prefixes.
            for glob in &self.user_globs {
                if let Ok(g) = compile_one(&format!("{glob}/**")) {
                    builder.add(g);
                }
            }
            self.compiled = Some(builder.build().unwrap_or_else(|_| GlobSet::empty()));
        }
        self.compiled.get_or_insert_with(GlobSet::empty)
    }
}

fn compile_one(pattern: &str) -> Result<globset::Glob, WatchError> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|source| WatchError::Pattern {
            pattern: pattern.to_string(),
            source,
        })
}

/// Matches sidecar names editors leave behind during atomic saves:
/// vim swap files, backup tildes, Sublime temp files.
fn is_editor_artifact(name: &str) -> bool {
    if name.ends_with('~') {
        return true;
    }
    if name.starts_with('.') && (name.ends_with(".swp") || name.ends_with(".swx")) {
        return true;
    }
    name.starts_with(".subl") && name.ends_with(".tmp")
}
