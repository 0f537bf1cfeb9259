//! Generation-based response cache.
//!
//! This module provides:
//! - Normalized request keys and stored response snapshots
//! - Storage backends (SQLite, in-memory) holding named generations
//! - The generation store: bulk population from a manifest, exact-match
//!   lookup and writes against the active generation, enumeration and deletion

mod storage;
mod store;
mod types;

pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use store::{GenerationStore, DEFAULT_CONCURRENCY};
pub use types::{
  CacheResult, CacheSource, CachedEntry, GenerationInfo, RequestKey, ResponseType, StoredResponse,
};
