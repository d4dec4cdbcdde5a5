//! The shared initial enumeration.
//!
//! Walks a root with an explicit stack, classifying entries under the
//! symlink policy, pruning ignored directories, and optionally reporting
//! each discovery as a raw `initial` event. Returns the flat snapshot so the
//! polling bridge can diff against it.

use std::path::{Path, PathBuf};

use crate::backend::{stat_for, BackendLink, RawEvent};
use crate::error::WatchError;
use crate::events::FileMeta;

/// Enumerates `root`, reporting discoveries when `emit` is set.
pub(crate) async fn scan_tree(
    root: &Path,
    link: &BackendLink,
    initial: bool,
    emit: bool,
) -> Vec<(PathBuf, FileMeta)> {
    let mut out = Vec::new();

    let root_meta = match stat_for(root, link.follow_symlinks()).await {
        Ok(meta) => FileMeta::from(&meta),
        Err(source) => {
            link.error(WatchError::Stat {
                path: root.to_path_buf(),
                source,
            });
            return out;
        }
    };

    if !root_meta.is_dir {
        if link.filter_path(root, Some(&root_meta)).await {
            out.push((root.to_path_buf(), root_meta));
            if emit {
                link.raw(RawEvent::created(root.to_path_buf(), root_meta, initial));
            }
        }
        return out;
    }

    out.push((root.to_path_buf(), root_meta));
    if emit {
        link.raw(RawEvent::created(root.to_path_buf(), root_meta, initial));
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
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    let meta = match stat_for(&path, link.follow_symlinks()).await {
                        Ok(m) => FileMeta::from(&m),
                        // Raced with a deletion or a broken link; skip.
                        Err(_) => continue,
                    };
                    if meta.is_dir {
                        if link.filter_dir(&path).await {
                            out.push((path.clone(), meta));
                            if emit {
                                link.raw(RawEvent::created(path.clone(), meta, initial));
                            }
                            stack.push(path);
                        }
                    } else if link.filter_path(&path, Some(&meta)).await {
                        out.push((path.clone(), meta));
                        if emit {
                            link.raw(RawEvent::created(path, meta, initial));
                        }
                    }
                }
                Ok(None) => break,
                Err(source) => {
                    link.error(WatchError::ReadDir {
                        path: dir.clone(),
                        source,
                    });
                    break;
                }
            }
        }
    }
    out
}
