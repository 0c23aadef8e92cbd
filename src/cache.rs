//! Thread-safe LRU residency cache using DashMap.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::provider::{BrickAtlas, Volume};

/// Residency key: one decoded volume, or one brick atlas at a scale level.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub layer_key: String,
    pub timepoint: u32,
    /// `None` for a full volume, `Some(level)` for a brick atlas.
    pub scale_level: Option<u32>,
}

impl CacheKey {
    pub fn volume(layer_key: impl Into<String>, timepoint: u32) -> Self {
        Self {
            layer_key: layer_key.into(),
            timepoint,
            scale_level: None,
        }
    }

    pub fn atlas(layer_key: impl Into<String>, timepoint: u32, scale_level: u32) -> Self {
        Self {
            layer_key: layer_key.into(),
            timepoint,
            scale_level: Some(scale_level),
        }
    }

    pub fn is_atlas(&self) -> bool {
        self.scale_level.is_some()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scale_level {
            Some(level) => write!(f, "{}@t{}/s{}", self.layer_key, self.timepoint, level),
            None => write!(f, "{}@t{}", self.layer_key, self.timepoint),
        }
    }
}

/// A resident payload.
#[derive(Debug, Clone)]
pub enum Resident {
    Volume(Arc<Volume>),
    Atlas(Arc<BrickAtlas>),
}

/// Cache statistics for one payload kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub num_entries: usize,
}

impl CacheStats {
    /// Fraction of lookups that missed (0.0 when nothing was looked up).
    pub fn miss_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.misses as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Thread-safe LRU residency cache bounded by entry count.
///
/// Uses DashMap for lock-free concurrent reads and a separate
/// LRU list (mutex-protected) for eviction ordering. The entry cap can be
/// changed at runtime; shrinking it evicts immediately.
pub struct ResidencyCache {
    /// Main data store - lock-free concurrent access.
    entries: DashMap<CacheKey, Resident>,
    /// LRU order tracking - protected by mutex.
    lru_order: Mutex<VecDeque<CacheKey>>,
    /// Maximum number of resident entries.
    max_entries: AtomicUsize,
    volume_counters: Counters,
    atlas_counters: Counters,
}

impl ResidencyCache {
    /// Create a new cache holding at most `max_entries` entries.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            lru_order: Mutex::new(VecDeque::new()),
            max_entries: AtomicUsize::new(max_entries),
            volume_counters: Counters::default(),
            atlas_counters: Counters::default(),
        }
    }

    fn counters(&self, key: &CacheKey) -> &Counters {
        if key.is_atlas() {
            &self.atlas_counters
        } else {
            &self.volume_counters
        }
    }

    /// Get an entry, updating LRU order and hit/miss counters.
    pub fn get(&self, key: &CacheKey) -> Option<Resident> {
        let found = self.entries.get(key).map(|entry| entry.value().clone());
        let counters = self.counters(key);

        if found.is_some() {
            counters.hits.fetch_add(1, Ordering::Relaxed);

            // Move to back = most recently used
            let mut lru = self.lru_order.lock();
            if let Some(pos) = lru.iter().position(|k| k == key) {
                if let Some(k) = lru.remove(pos) {
                    lru.push_back(k);
                }
            }
        } else {
            counters.misses.fetch_add(1, Ordering::Relaxed);
        }

        found
    }

    /// Insert an entry, evicting least recently used entries to stay in budget.
    pub fn insert(&self, key: CacheKey, value: Resident) {
        let max = self.max_entries.load(Ordering::Relaxed);
        if max == 0 {
            return;
        }
        // Another thread may have loaded the same key
        if self.entries.contains_key(&key) {
            return;
        }
        self.evict_to(max - 1);

        // Push while the shard guard is held so a racing insert or remove of
        // the same key sees the map and the LRU agree.
        if let Entry::Vacant(slot) = self.entries.entry(key.clone()) {
            let _guard = slot.insert(value);
            self.lru_order.lock().push_back(key);
        }
    }

    /// Evict from the LRU front until at most `target` entries remain.
    fn evict_to(&self, target: usize) {
        while self.entries.len() > target {
            let key_to_evict = {
                let mut lru = self.lru_order.lock();
                lru.pop_front()
            };

            match key_to_evict {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Remove an entry. Returns whether it was resident.
    pub fn remove(&self, key: &CacheKey) -> bool {
        if self.entries.remove(key).is_none() {
            return false;
        }
        let mut lru = self.lru_order.lock();
        if let Some(pos) = lru.iter().position(|k| k == key) {
            lru.remove(pos);
        }
        true
    }

    /// Residency check. Does not touch LRU order or counters.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Change the entry cap, evicting down to it at once.
    pub fn set_max_entries(&self, max_entries: usize) {
        self.max_entries.store(max_entries, Ordering::Relaxed);
        self.evict_to(max_entries);
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries.load(Ordering::Relaxed)
    }

    /// Clear the cache.
    pub fn clear(&self) {
        self.entries.clear();
        self.lru_order.lock().clear();
        // Don't reset stats - keep for diagnostics
    }

    /// Statistics for full volumes.
    pub fn volume_stats(&self) -> CacheStats {
        self.stats_for(&self.volume_counters, false)
    }

    /// Statistics for brick atlases.
    pub fn atlas_stats(&self) -> CacheStats {
        self.stats_for(&self.atlas_counters, true)
    }

    fn stats_for(&self, counters: &Counters, atlas: bool) -> CacheStats {
        CacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            num_entries: self
                .entries
                .iter()
                .filter(|entry| entry.key().is_atlas() == atlas)
                .count(),
        }
    }

    /// Reset hit/miss counters to zero.
    pub fn reset_stats(&self) {
        for counters in [&self.volume_counters, &self.atlas_counters] {
            counters.hits.store(0, Ordering::Relaxed);
            counters.misses.store(0, Ordering::Relaxed);
        }
    }

    /// Get the number of resident entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
