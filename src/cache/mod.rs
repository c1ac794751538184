//! Session-scoped response cache
//!
//! In-memory store keyed by derived cache keys, with TTL validity checks,
//! a retention sweep and a size bound.

pub mod key;
pub mod storage;

use std::time::Duration;

/// Cache timing defaults
pub struct CacheTtl;

impl CacheTtl {
    // How long a loaded resource is served without calling the producer
    pub const DEFAULT: Duration = Duration::from_secs(5 * 60); // 5 min

    // Anything older is swept, whatever its TTL
    pub const RETENTION_CEILING: Duration = Duration::from_secs(30 * 60); // 30 min

    pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60); // 1 min
}

// Re-export main types
pub use key::{KeyInputs, cache_key, resource_prefix};
pub use storage::{AsyncCache, CacheLimits, spawn_sweeper};
