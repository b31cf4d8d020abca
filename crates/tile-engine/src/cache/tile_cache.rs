//! LRU cache for tiles, keyed by band and rectangle.

use lru::LruCache;
use raster_common::{BandId, Rect, Tile};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use super::CacheStats;

/// Cache key: exact band and rectangle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub band: BandId,
    pub rect: Rect,
}

impl TileKey {
    pub fn new(band: BandId, rect: Rect) -> Self {
        Self { band, rect }
    }
}

/// LRU tile cache with a byte budget.
///
/// Only tiles whose buffer is referenced by the cache alone are evicted. A
/// tile still held by a reader stays cached, so the budget can be exceeded
/// while every older tile is in use.
pub struct TileCache {
    cache: LruCache<TileKey, Tile>,
    /// Byte budget, 0 for unbounded.
    memory_limit: usize,
    current_memory: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl TileCache {
    /// Create a cache with the given budget in bytes (0 = unbounded).
    pub fn new(memory_limit: usize) -> Self {
        Self {
            cache: LruCache::unbounded(),
            memory_limit,
            current_memory: 0,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up a tile, updating LRU order and hit/miss counters.
    pub fn get(&mut self, key: &TileKey) -> Option<Tile> {
        if let Some(tile) = self.cache.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(tile.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Look up a tile without touching LRU order or statistics.
    pub fn peek(&self, key: &TileKey) -> Option<&Tile> {
        self.cache.peek(key)
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.cache.contains(key)
    }

    /// Insert a tile, evicting unreferenced least-recently-used tiles to
    /// make room. Returns false if the tile alone exceeds the budget.
    pub fn insert(&mut self, key: TileKey, tile: Tile) -> bool {
        let size = tile.size_in_bytes();

        if self.memory_limit > 0 && size > self.memory_limit {
            warn!(
                band = %key.band,
                rect = %key.rect,
                size_bytes = size,
                limit_bytes = self.memory_limit,
                "Tile exceeds cache budget, not caching"
            );
            return false;
        }

        if let Some(previous) = self.cache.pop(&key) {
            self.current_memory = self.current_memory.saturating_sub(previous.size_in_bytes());
        }

        if self.memory_limit > 0 {
            self.make_room(size);
        }

        self.cache.put(key, tile);
        self.current_memory += size;
        true
    }

    fn make_room(&mut self, incoming: usize) {
        let mut excess = (self.current_memory + incoming).saturating_sub(self.memory_limit);
        if excess == 0 {
            return;
        }

        // One pass from the least-recently used end, skipping tiles with readers.
        let mut victims = Vec::new();
        for (key, tile) in self.cache.iter().rev() {
            if excess == 0 {
                break;
            }
            if tile.buffer_refs() == 1 {
                excess = excess.saturating_sub(tile.size_in_bytes());
                victims.push(key.clone());
            }
        }

        if excess > 0 {
            debug!(
                current_bytes = self.current_memory,
                incoming_bytes = incoming,
                "No evictable tiles left, cache over budget"
            );
        }

        for victim in victims {
            if let Some(evicted) = self.cache.pop(&victim) {
                self.current_memory = self.current_memory.saturating_sub(evicted.size_in_bytes());
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.len(),
            memory_bytes: self.current_memory as u64,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Clear all entries from the cache.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.current_memory = 0;
    }

    /// Get the current memory usage in bytes.
    pub fn memory_usage(&self) -> usize {
        self.current_memory
    }

    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
