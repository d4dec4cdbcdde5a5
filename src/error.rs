//! Error types for the watcher engine.
//!
//! Errors are classified by cause rather than by type: filesystem absences
//! are benign and swallowed, permission failures are policy-dependent, and
//! everything else is surfaced on the watcher's error channel.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the file watcher system.
#[derive(Error, Debug)]
pub enum WatchError {
    /// Creating the underlying OS watcher failed.
    #[error("failed to create backend watcher: {0}")]
    Backend(#[from] notify::Error),

    /// Arming a watch on a specific path failed.
    #[error("failed to watch path {path}: {source}")]
    WatchPath {
        /// The path that could not be watched.
        path: PathBuf,
        /// The underlying backend error.
        source: notify::Error,
    },

    /// A watch path was rejected before touching the filesystem.
    ///
    /// This is a programmer error and is returned synchronously from
    /// [`add`](crate::Watcher::add).
    #[error("invalid watch path {path:?}: {reason}")]
    InvalidPath {
        /// The offending input.
        path: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A user-supplied glob pattern failed to compile.
    #[error("invalid glob pattern {pattern:?}: {source}")]
    Pattern {
        /// The offending pattern.
        pattern: String,
        /// The compile error.
        source: globset::Error,
    },

    /// A stat during write-stabilization polling or enrichment failed.
    #[error("failed to stat {path}: {source}")]
    Stat {
        /// The path that could not be stat'ed.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Enumerating a directory failed.
    #[error("failed to read directory {path}: {source}")]
    ReadDir {
        /// The directory that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The watcher has been closed.
    #[error("watcher is closed")]
    Closed,
}

/// How the engine reacts to an error from a backend or a filesystem probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorClass {
    /// Swallow unconditionally: the path is simply gone.
    Benign,
    /// Swallow iff `ignore_permission_errors` is set.
    Permission,
    /// Surface on the error channel.
    Fatal,
}

pub(crate) fn classify_io(err: &io::Error) -> ErrorClass {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorClass::Benign,
        io::ErrorKind::PermissionDenied => ErrorClass::Permission,
        // ENOTDIR surfaces without a stable ErrorKind on older toolchains.
        _ if err.raw_os_error() == Some(NOT_A_DIRECTORY) => ErrorClass::Benign,
        _ => ErrorClass::Fatal,
    }
}

#[cfg(unix)]
const NOT_A_DIRECTORY: i32 = 20;
#[cfg(windows)]
const NOT_A_DIRECTORY: i32 = 267;
#[cfg(not(any(unix, windows)))]
const NOT_A_DIRECTORY: i32 = -1;

impl WatchError {
    pub(crate) fn class(&self) -> ErrorClass {
        match self {
            WatchError::Stat { source, .. } | WatchError::ReadDir { source, .. } => {
                classify_io(source)
            }
            WatchError::Backend(e) | WatchError::WatchPath { source: e, .. } => match &e.kind {
                notify::ErrorKind::PathNotFound => ErrorClass::Benign,
                notify::ErrorKind::Io(io) => classify_io(io),
                _ => ErrorClass::Fatal,
            },
            _ => ErrorClass::Fatal,
        }
    }
}
