//! pathwatch
//!
//! A cross-platform filesystem-watching engine: give it paths and glob
//! patterns, get back a normalized, deduplicated, glob-filtered stream of
//! change events, independent of which OS notification facility produced
//! them.
//!
//! ## What the engine does
//!
//! - Resolves glob patterns to watch roots and re-filters a live tree
//! - Reconciles raw backend noise into canonical add/change/unlink events
//! - Fuses editor atomic saves (unlink+create) into a single `change`
//! - Optionally holds events until a growing file stabilizes
//! - Throttles duplicate emissions per path
//! - Tracks watched directories and tears subtrees down children-first
//! - Coordinates a one-shot `ready` signal over the initial scans
//!
//! ## Event flow
//!
//! ```text
//! Filesystem change
//!        ↓
//! Backend bridge (recursive / per-directory / polling)
//!        ↓
//! Core dispatch task [single logical context]
//!        ↓
//! ignore filter → atomic reconciliation → write-stabilization → throttle
//!        ↓
//! broadcast channels (add / addDir / change / unlink / unlinkDir / all)
//! ```
//!
//! ## Usage example
//!
//! ```rust,no_run
//! use pathwatch::{WatchConfig, Watcher};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), pathwatch::WatchError> {
//!     let config = WatchConfig::builder()
//!         .ignore_initial(true)
//!         .ignored("**/node_modules")
//!         .build();
//!
//!     let (watcher, mut events) = Watcher::new(config)?;
//!     watcher.add(["/path/to/project", "!/path/to/project/target"]).await?;
//!     watcher.ready().await;
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}: {}", event.kind, event.path.display());
//!     }
//!     watcher.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module structure
//!
//! - [`engine`]: the normalization core
//!   - [`engine::watcher`]: add/unwatch orchestration and dispatch
//!   - [`engine::registry`]: the watched-directory tree
//!   - [`engine::ignore`], [`engine::throttle`]: filtering and suppression
//! - [`backend`]: the backend contract and the three bridges
//! - [`config`], [`events`], [`error`], [`path_util`]: the public surface

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod path_util;

/// Re-exports for convenience.
pub mod prelude {
    pub use crate::backend::BackendKind;
    pub use crate::config::{AtomicSave, IgnorePattern, WatchConfig, WriteStability};
    pub use crate::error::WatchError;
    pub use crate::events::{EventKind, FileMeta, WatchEvent};
    pub use crate::Watcher;
}

pub use backend::BackendKind;
pub use config::{AtomicSave, IgnorePattern, WatchConfig, WatchConfigBuilder, WriteStability};
pub use engine::watcher::Watcher;
pub use error::WatchError;
pub use events::{EventKind, FileMeta, WatchEvent};
