//! Versioned response caches for offline support.
//!
//! This module provides:
//! - A durable store of named caches keyed by request identity
//! - A generation manager that precaches the manifest at install time and
//!   retires every other generation at activation time

mod generation;
mod storage;

pub use generation::{CacheManager, Generation};
pub use storage::{CacheStore, CachedEntry, SqliteCacheStore};
