//! Parsed-table cache keyed by source path.
//!
//! Avoids re-parsing a table that was already loaded from the same file
//! during the lifetime of the process.

use crate::lut::table::LookupTable;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default number of cached tables.
pub const DEFAULT_CAPACITY: usize = 5;

/// Cached table with metadata.
#[derive(Debug, Clone)]
struct CacheEntry {
    table: Arc<LookupTable>,
    parse_time: Duration,
    loaded_at: Instant,
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries evicted by capacity.
    pub evictions: u64,
    /// Total parse time saved by cache hits.
    pub time_saved: Duration,
}

impl CacheStats {
    /// Calculate hit ratio.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// Thread-safe LRU cache of parsed tables.
pub struct LutCache {
    cache: Mutex<LruCache<PathBuf, CacheEntry>>,
    stats: Mutex<CacheStats>,
}

/// Normalize a path so different spellings of the same file share an entry.
fn cache_key(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

impl LutCache {
    /// Create a new cache with the given capacity (at least one entry).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Get a cached table, marking it most recently used.
    pub fn get(&self, path: &Path) -> Option<Arc<LookupTable>> {
        let key = cache_key(path);
        let mut cache = self.cache.lock();
        let mut stats = self.stats.lock();
        match cache.get(&key) {
            Some(entry) => {
                stats.hits += 1;
                stats.time_saved += entry.parse_time;
                Some(Arc::clone(&entry.table))
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    /// Store a table, evicting the least recently used entry when full.
    pub fn put(&self, path: &Path, table: Arc<LookupTable>, parse_time: Duration) {
        let key = cache_key(path);
        let entry = CacheEntry {
            table,
            parse_time,
            loaded_at: Instant::now(),
        };
        let mut cache = self.cache.lock();
        if let Some((evicted, _)) = cache.push(key.clone(), entry) {
            if evicted != key {
                log::debug!("Evicted cached LUT {}", evicted.display());
                self.stats.lock().evictions += 1;
            }
        }
    }

    /// Return the cached table or parse it with `load` and cache the result.
    pub fn get_or_load<E>(
        &self,
        path: &Path,
        load: impl FnOnce(&Path) -> Result<LookupTable, E>,
    ) -> Result<Arc<LookupTable>, E> {
        if let Some(table) = self.get(path) {
            return Ok(table);
        }
        let started = Instant::now();
        let table = Arc::new(load(path)?);
        self.put(path, Arc::clone(&table), started.elapsed());
        Ok(table)
    }

    /// Drop the entry for one path.
    pub fn invalidate(&self, path: &Path) {
        self.cache.lock().pop(&cache_key(path));
    }

    /// Clear the entire cache, returning the number of entries dropped.
    pub fn clear(&self) -> usize {
        let mut cache = self.cache.lock();
        let dropped = cache.len();
        cache.clear();
        dropped
    }

    /// Age of the entry for a path, if cached.
    pub fn age(&self, path: &Path) -> Option<Duration> {
        self.cache
            .lock()
            .peek(&cache_key(path))
            .map(|entry| entry.loaded_at.elapsed())
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }

    /// Approximate memory held by cached tables in bytes.
    pub fn memory_usage(&self) -> usize {
        self.cache
            .lock()
            .iter()
            .map(|(_, entry)| entry.table.memory_size())
            .sum()
    }

    /// Get number of cached entries.
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.cache.lock().cap().get()
    }
}

impl Default for LutCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
