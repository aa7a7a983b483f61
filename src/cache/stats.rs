// =============================================================================
// Cache Statistics: counters and a serialisable snapshot
// =============================================================================

use serde::{Deserialize, Serialize};

/// Raw counters, mutated only under the cache lock.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    /// Misses that joined an in-flight computation instead of starting one.
    pub coalesced: u64,
    pub timeouts: u64,
    pub failures: u64,
}

impl CacheCounters {
    pub fn snapshot(&self, entries: usize, in_flight: usize) -> CacheStats {
        let lookups = self.hits + self.misses;
        let hit_rate = if lookups > 0 {
            self.hits as f64 / lookups as f64
        } else {
            0.0
        };

        CacheStats {
            hits: self.hits,
            misses: self.misses,
            sets: self.sets,
            evictions: self.evictions,
            coalesced: self.coalesced,
            timeouts: self.timeouts,
            failures: self.failures,
            hit_rate,
            entries,
            in_flight,
        }
    }
}

/// Point-in-time view of the cache for dashboards and logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub coalesced: u64,
    pub timeouts: u64,
    pub failures: u64,
    /// hits / (hits + misses), 0 before the first lookup.
    pub hit_rate: f64,
    pub entries: usize,
    pub in_flight: usize,
}
