//! The event-normalization and watch-lifecycle engine.
//!
//! This module hosts the core components:
//! - `registry`: the watched-directory tree and closer ownership
//! - `ignore`: the compound ignore filter
//! - `throttle`: duplicate-action suppression
//! - `stabilize`: write-stabilization holds
//! - `atomic`: atomic-save reconciliation
//! - `emitter`: normalization, fan-out and ready coordination
//! - `removal`: recursive subtree removal
//! - `watcher`: the public orchestrator

pub mod atomic;
pub mod emitter;
pub mod ignore;
pub mod registry;
pub mod removal;
pub mod stabilize;
pub mod throttle;
pub mod watcher;

pub use registry::{Closer, WatchRegistry, WatchedDir};
pub use watcher::Watcher;
