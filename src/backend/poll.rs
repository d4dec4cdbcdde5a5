//! The polling bridge: periodic scan-and-diff, no OS facility.
//!
//! Useful where native watching is unreliable (NFS, some container mounts).
//! Every tick re-walks the root and diffs against the previous snapshot;
//! files with known-binary extensions are re-stat'ed on the slower
//! `binary_interval` cadence to keep large-asset trees cheap.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{scan, stat_for, Backend, BackendKind, BackendLink, RawEvent};
use crate::engine::registry::Closer;
use crate::error::WatchError;
use crate::events::FileMeta;

const BINARY_EXTENSIONS: &[&str] = &[
    "7z", "avi", "bin", "bmp", "bz2", "class", "dll", "dylib", "exe", "flac", "gif", "gz", "ico",
    "iso", "jar", "jpeg", "jpg", "mkv", "mov", "mp3", "mp4", "ogg", "pdf", "png", "so", "tar",
    "ttf", "wav", "woff", "woff2", "xz", "zip",
];

fn is_binary_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| BINARY_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// The polling bridge.
pub(crate) struct PollBackend {
    interval: Duration,
    binary_interval: Duration,
}

impl PollBackend {
    pub(crate) fn new(interval: Duration, binary_interval: Duration) -> Self {
        Self {
            interval,
            binary_interval,
        }
    }
}

impl Backend for PollBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Poll
    }

    fn watch(&self, root: PathBuf, link: BackendLink) -> Result<Closer, WatchError> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let interval = self.interval.max(Duration::from_millis(1));
        let binary_every = (self.binary_interval.as_millis() / interval.as_millis()).max(1) as u64;
        tracing::debug!(path = %root.display(), ?interval, "polling watch armed");

        tokio::spawn(async move {
            let entries = scan::scan_tree(&root, &link, true, true).await;
            let mut snapshot: HashMap<PathBuf, FileMeta> = entries.into_iter().collect();
            link.scan_complete();

            let mut tick: u64 = 0;
            loop {
                tokio::time::sleep(interval).await;
                if flag.load(Ordering::SeqCst) || link.is_closed() {
                    return;
                }
                tick += 1;
                let restat_binary = tick % binary_every == 0;
                poll_once(&root, &link, &mut snapshot, restat_binary).await;
            }
        });

        Ok(Closer::new(move || stop.store(true, Ordering::SeqCst)))
    }
}

/// One diff pass: walk, compare against the snapshot, report the deltas.
async fn poll_once(
    root: &Path,
    link: &BackendLink,
    snapshot: &mut HashMap<PathBuf, FileMeta>,
    restat_binary: bool,
) {
    let next = walk(root, link, snapshot, restat_binary).await;

    // Additions sorted so directories surface before their contents.
    let mut added: Vec<&PathBuf> = next.keys().filter(|p| !snapshot.contains_key(*p)).collect();
    added.sort();
    for path in added {
        link.raw(RawEvent::created((*path).clone(), next[path], false));
    }

    for (path, meta) in &next {
        if let Some(old) = snapshot.get(path) {
            if !meta.is_dir && (old.len != meta.len || old.modified != meta.modified) {
                link.raw(RawEvent::modified(path.clone(), Some(*meta)));
            }
        }
    }

    let mut gone: Vec<&PathBuf> = snapshot.keys().filter(|p| !next.contains_key(*p)).collect();
    gone.sort();
    for path in gone.into_iter().rev() {
        link.raw(RawEvent::removed(path.clone()));
    }

    *snapshot = next;
}

async fn walk(
    root: &Path,
    link: &BackendLink,
    snapshot: &HashMap<PathBuf, FileMeta>,
    restat_binary: bool,
) -> HashMap<PathBuf, FileMeta> {
    let mut next = HashMap::new();

    let root_meta = match stat_for(root, link.follow_symlinks()).await {
        Ok(meta) => FileMeta::from(&meta),
        // Root gone (or unreadable): the diff reports everything removed.
        Err(_) => return next,
    };
    next.insert(root.to_path_buf(), root_meta);
    if !root_meta.is_dir {
        return next;
    }

    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(source) => {
                link.error(WatchError::ReadDir { path: dir, source });
                continue;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !restat_binary && is_binary_path(&path) {
                if let Some(old) = snapshot.get(&path) {
                    next.insert(path, *old);
                    continue;
                }
            }
            let meta = match stat_for(&path, link.follow_symlinks()).await {
                Ok(m) => FileMeta::from(&m),
                Err(_) => continue,
            };
            if meta.is_dir {
                if link.filter_dir(&path).await {
                    next.insert(path.clone(), meta);
                    stack.push(path);
                }
            } else if link.filter_path(&path, Some(&meta)).await {
                next.insert(path, meta);
            }
        }
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_extension_classification() {
        assert!(is_binary_path(Path::new("/w/archive.ZIP")));
        assert!(is_binary_path(Path::new("/w/photo.jpg")));
        assert!(!is_binary_path(Path::new("/w/source.rs")));
        assert!(!is_binary_path(Path::new("/w/noext")));
    }
}
