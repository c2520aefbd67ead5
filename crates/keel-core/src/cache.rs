//! Shared block cache
//!
//! A byte-capacity LRU of decoded values. One cache can serve many open
//! stores, so entries are keyed by (store instance id, key). The charge of an
//! entry is its key length plus its value length.
//!
//! The `LruCache` itself is unbounded; capacity is enforced here in bytes by
//! popping least recently used entries until the charge fits.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;

type CacheKey = (u64, Vec<u8>);

struct LruState {
    entries: LruCache<CacheKey, Vec<u8>>,
    charge: usize,
}

impl LruState {
    fn remove(&mut self, key: &CacheKey) {
        if let Some(value) = self.entries.pop(key) {
            self.charge -= key.1.len() + value.len();
        }
    }

    fn evict_to(&mut self, capacity: usize) {
        while self.charge > capacity {
            let Some((key, value)) = self.entries.pop_lru() else { break };
            self.charge -= key.1.len() + value.len();
        }
    }
}

/// Fixed-capacity LRU cache shared between stores.
pub struct BlockCache {
    capacity: usize,
    state: Mutex<LruState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(LruState { entries: LruCache::unbounded(), charge: 0 }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached value for `key` in store `db`, marking it most recently used.
    pub fn lookup(&self, db: u64, key: &[u8]) -> Option<Vec<u8>> {
        let cache_key = (db, key.to_vec());
        let mut state = self.state.lock();
        match state.entries.get(&cache_key) {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or replace an entry, evicting least recently used entries
    /// until the cache fits its capacity. Entries larger than the whole
    /// cache are not stored.
    pub fn insert(&self, db: u64, key: &[u8], value: &[u8]) {
        let charge = key.len() + value.len();
        let cache_key = (db, key.to_vec());
        let mut state = self.state.lock();
        state.remove(&cache_key);
        if charge > self.capacity {
            return;
        }

        state.entries.put(cache_key, value.to_vec());
        state.charge += charge;
        state.evict_to(self.capacity);
    }

    pub fn invalidate(&self, db: u64, key: &[u8]) {
        self.state.lock().remove(&(db, key.to_vec()));
    }

    /// Drop every entry that belongs to store `db`.
    pub fn purge(&self, db: u64) {
        let mut state = self.state.lock();
        let owned: Vec<CacheKey> = state.entries.iter().map(|(key, _)| key).filter(|(owner, _)| *owner == db).cloned().collect();
        for key in &owned {
            state.remove(key);
        }
    }

    /// Bytes currently charged against the capacity.
    pub fn total_charge(&self) -> usize {
        self.state.lock().charge
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCache")
            .field("capacity", &self.capacity)
            .field("charge", &self.total_charge())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}
