//! Shared block cache handle.

use std::fmt;
use std::sync::Arc;

use keel_core::capi;

use crate::error::Result;
use crate::handle::Guarded;

/// Fixed-capacity LRU block cache.
///
/// Clones share one native cache. It stays alive while any clone, any
/// [`Options`](crate::Options) it is attached to, or any database opened
/// with such options is alive.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<Guarded<capi::keel_cache_t>>,
}

impl Cache {
    /// New LRU cache holding up to `capacity` bytes of keys and values.
    pub fn new(capacity: usize) -> Self {
        Self { inner: Arc::new(Guarded::new(capi::keel_cache_create_lru(capacity))) }
    }

    /// Bytes currently held.
    pub fn total_charge(&self) -> usize {
        // SAFETY: the guard hands out a live cache handle.
        self.inner.with(|cache| unsafe { capi::keel_cache_total_charge(cache) }).unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        // SAFETY: the guard hands out a live cache handle.
        self.inner.with(|cache| unsafe { capi::keel_cache_capacity(cache) }).unwrap_or(0)
    }

    pub(crate) fn with_handle<R>(&self, f: impl FnOnce(*mut capi::keel_cache_t) -> R) -> Result<R> {
        self.inner.with(f)
    }

    /// Number of `Cache` values sharing this native cache.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("capacity", &self.capacity())
            .field("total_charge", &self.total_charge())
            .finish()
    }
}
