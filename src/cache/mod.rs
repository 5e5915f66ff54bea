//! Persistent response cache with reachability-aware staleness.
//!
//! This module provides the cache every context reads through:
//! - Responses are keyed by path plus parameters (see [`RequestKey`])
//! - The allowed age of an entry depends on the current network class
//! - Stale entries are served when a live fetch fails, if allowed
//! - Writes invalidate what they superseded

mod key;
mod layer;
mod storage;
mod traits;

pub use key::{normalize_path, Fingerprint, RequestKey};
pub use layer::{Cache, FetchPolicy};
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use traits::{CacheEntry, CacheResult, CacheSource};
