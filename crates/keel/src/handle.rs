//! Guarded ownership of engine handles.
//!
//! Every engine object the client owns sits in a `Guarded<T>` slot. Calls
//! take the shared side of the slot's lock for the length of the engine call;
//! release takes the exclusive side and swaps the pointer for null. A release
//! racing with in-flight calls waits for them, and a second release finds
//! null and does nothing.

use std::fmt;

use keel_core::capi;
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// An engine object type and the call that destroys it.
pub(crate) trait NativeResource {
    /// Name reported in `Error::Disposed`.
    const KIND: &'static str;

    /// # Safety
    /// `ptr` must be a live handle of this type, released at most once.
    unsafe fn release(ptr: *mut Self);
}

impl NativeResource for capi::keel_t {
    const KIND: &'static str = "Database";
    unsafe fn release(ptr: *mut Self) {
        capi::keel_close(ptr)
    }
}

impl NativeResource for capi::keel_options_t {
    const KIND: &'static str = "Options";
    unsafe fn release(ptr: *mut Self) {
        capi::keel_options_destroy(ptr)
    }
}

impl NativeResource for capi::keel_readoptions_t {
    const KIND: &'static str = "ReadOptions";
    unsafe fn release(ptr: *mut Self) {
        capi::keel_readoptions_destroy(ptr)
    }
}

impl NativeResource for capi::keel_writeoptions_t {
    const KIND: &'static str = "WriteOptions";
    unsafe fn release(ptr: *mut Self) {
        capi::keel_writeoptions_destroy(ptr)
    }
}

impl NativeResource for capi::keel_writebatch_t {
    const KIND: &'static str = "WriteBatch";
    unsafe fn release(ptr: *mut Self) {
        capi::keel_writebatch_destroy(ptr)
    }
}

impl NativeResource for capi::keel_iterator_t {
    const KIND: &'static str = "DbIterator";
    unsafe fn release(ptr: *mut Self) {
        capi::keel_iter_destroy(ptr)
    }
}

impl NativeResource for capi::keel_snapshot_t {
    const KIND: &'static str = "Snapshot";
    unsafe fn release(ptr: *mut Self) {
        capi::keel_release_snapshot(ptr)
    }
}

impl NativeResource for capi::keel_cache_t {
    const KIND: &'static str = "Cache";
    unsafe fn release(ptr: *mut Self) {
        capi::keel_cache_destroy(ptr)
    }
}

/// A slot holding one engine handle, released exactly once.
pub(crate) struct Guarded<T: NativeResource> {
    slot: RwLock<*mut T>,
}

// SAFETY: the engine objects behind these handles are thread-safe, and the
// slot lock serializes release against every use.
unsafe impl<T: NativeResource> Send for Guarded<T> {}
unsafe impl<T: NativeResource> Sync for Guarded<T> {}

impl<T: NativeResource> Guarded<T> {
    /// Take ownership of a handle fresh from the engine. A null handle
    /// starts out released.
    pub(crate) fn new(ptr: *mut T) -> Self {
        Self { slot: RwLock::new(ptr) }
    }

    /// Run `f` with the live handle, or fail with `Disposed`.
    pub(crate) fn with<R>(&self, f: impl FnOnce(*mut T) -> R) -> Result<R> {
        let slot = self.slot.read();
        if slot.is_null() {
            return Err(Error::Disposed(T::KIND));
        }
        Ok(f(*slot))
    }

    /// Destroy the handle if still live. Returns whether this call did it.
    pub(crate) fn release(&self) -> bool {
        let ptr = std::mem::replace(&mut *self.slot.write(), std::ptr::null_mut());
        if ptr.is_null() {
            return false;
        }
        // SAFETY: the swap above handed this pointer to exactly one caller.
        unsafe { T::release(ptr) };
        true
    }

    pub(crate) fn is_released(&self) -> bool {
        self.slot.read().is_null()
    }
}

impl<T: NativeResource> Drop for Guarded<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T: NativeResource> fmt::Debug for Guarded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guarded")
            .field("kind", &T::KIND)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_happens_once() {
        let batch = Guarded::new(capi::keel_writebatch_create());
        assert!(batch.with(|_| ()).is_ok());
        assert!(batch.release());
        assert!(!batch.release());
        assert!(batch.is_released());
        assert_eq!(batch.with(|_| ()).unwrap_err(), Error::Disposed("WriteBatch"));
    }

    #[test]
    fn test_null_handle_starts_released() {
        let db = Guarded::<capi::keel_t>::new(std::ptr::null_mut());
        assert!(db.is_released());
        assert!(!db.release());
        assert_eq!(db.with(|_| ()).unwrap_err(), Error::Disposed("Database"));
    }

    #[test]
    fn test_concurrent_release_is_single() {
        let options = std::sync::Arc::new(Guarded::new(capi::keel_options_create()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let options = std::sync::Arc::clone(&options);
                std::thread::spawn(move || options.release())
            })
            .collect();
        let released = handles.into_iter().map(|h| h.join().unwrap()).filter(|r| *r).count();
        assert_eq!(released, 1);
    }
}
