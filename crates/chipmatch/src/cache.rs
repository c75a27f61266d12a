//! Injected in-memory caches for built indices and finished query results.
//!
//! Both caches are bounded `moka` caches owned by a [`QueryCache`] value that
//! callers pass into the pipeline; there is no process-wide state. Concurrent
//! callers may compute the same entry twice; results are idempotent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use moka::sync::Cache;
use xxhash_rust::xxh3::Xxh3;

use crate::index::DescriptorIndex;
use crate::pipeline::QueryResults;
use crate::types::ChipId;

/// `(chip-set hash, feature uid, index params uid)`.
pub type IndexKey = (u64, String, String);

const DEFAULT_INDEX_CAPACITY: u64 = 8;
const DEFAULT_RESULT_CAPACITY: u64 = 256;

/// Hit/miss counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    index_hits: AtomicU64,
    index_misses: AtomicU64,
    result_hits: AtomicU64,
    result_misses: AtomicU64,
}

impl CacheStats {
    pub fn index_hits(&self) -> u64 {
        self.index_hits.load(Ordering::Relaxed)
    }

    pub fn index_misses(&self) -> u64 {
        self.index_misses.load(Ordering::Relaxed)
    }

    pub fn result_hits(&self) -> u64 {
        self.result_hits.load(Ordering::Relaxed)
    }

    pub fn result_misses(&self) -> u64 {
        self.result_misses.load(Ordering::Relaxed)
    }
}

fn record(hit: &AtomicU64, miss: &AtomicU64, found: bool) {
    if found { hit } else { miss }.fetch_add(1, Ordering::Relaxed);
}

#[derive(Clone)]
pub struct QueryCache {
    indices: Cache<IndexKey, Arc<DescriptorIndex>>,
    results: Cache<u64, Arc<QueryResults>>,
    stats: Arc<CacheStats>,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("indices", &self.indices.entry_count())
            .field("results", &self.results.entry_count())
            .finish()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_INDEX_CAPACITY, DEFAULT_RESULT_CAPACITY)
    }
}

impl QueryCache {
    /// Caches holding at most `index_capacity` indices and
    /// `result_capacity` query results.
    pub fn new(index_capacity: u64, result_capacity: u64) -> Self {
        tracing::debug!(index_capacity, result_capacity, "query cache initialized");
        Self {
            indices: Cache::builder().max_capacity(index_capacity).build(),
            results: Cache::builder().max_capacity(result_capacity).build(),
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn get_index(&self, key: &IndexKey) -> Option<Arc<DescriptorIndex>> {
        let hit = self.indices.get(key);
        record(&self.stats.index_hits, &self.stats.index_misses, hit.is_some());
        hit
    }

    pub fn insert_index(&self, key: IndexKey, index: Arc<DescriptorIndex>) {
        self.indices.insert(key, index);
    }

    pub fn get_result(&self, key: u64) -> Option<Arc<QueryResults>> {
        let hit = self.results.get(&key);
        record(&self.stats.result_hits, &self.stats.result_misses, hit.is_some());
        hit
    }

    pub fn insert_result(&self, key: u64, results: Arc<QueryResults>) {
        self.results.insert(key, results);
    }

    /// Drop every cached index and result.
    pub fn clear(&self) {
        self.indices.invalidate_all();
        self.results.invalidate_all();
    }
}

/// Key of a full query result.
pub(crate) fn result_key(queries: &[ChipId], database: &[ChipId], config_uid: &str, feature_uid: &str) -> u64 {
    let mut h = Xxh3::new();
    for part in [queries, database] {
        h.update(&(part.len() as u64).to_le_bytes());
        for c in part {
            h.update(&c.to_le_bytes());
        }
    }
    h.update(config_uid.as_bytes());
    h.update(b"|");
    h.update(feature_uid.as_bytes());
    h.digest()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_key_separates_query_and_database_lists() {
        let a = result_key(&[1, 2], &[3], "cfg", "feat");
        let b = result_key(&[1], &[2, 3], "cfg", "feat");
        assert_ne!(a, b);
        assert_eq!(a, result_key(&[1, 2], &[3], "cfg", "feat"));
        assert_ne!(a, result_key(&[1, 2], &[3], "cfg2", "feat"));
    }

    #[test]
    fn result_cache_counts_hits_and_misses() {
        let cache = QueryCache::new(1, 4);
        assert!(cache.get_result(9).is_none());
        cache.insert_result(9, Arc::new(QueryResults::default()));
        assert!(cache.get_result(9).is_some());
        assert_eq!(cache.stats().result_hits(), 1);
        assert_eq!(cache.stats().result_misses(), 1);
        cache.clear();
        assert!(cache.get_result(9).is_none());
    }
}
