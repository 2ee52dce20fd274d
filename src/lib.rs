//! Content synchronization and cache coherence engine.
//!
//! Keeps a local mirror of a git content repository up to date, serves
//! parsed per-locale snapshots of it through a generation-checked cache,
//! and forwards invalidations to a downstream page cache.

pub mod cli;
pub mod config;
pub mod content;
pub mod daemon;
pub mod history;
pub mod invalidation;
pub mod mirror;
pub mod protocol;
pub mod scheduler;
pub mod sync;
pub mod types;
