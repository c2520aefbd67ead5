//! Atomic write batches.

use std::ffi::c_char;
use std::fmt;

use keel_core::capi;

use crate::handle::Guarded;

/// Ordered list of pending puts and deletes, applied all-or-nothing by
/// [`Database::write`](crate::Database::write). Independent of any
/// database and reusable after [`clear`](Self::clear).
pub struct WriteBatch {
    handle: Guarded<capi::keel_writebatch_t>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self { handle: Guarded::new(capi::keel_writebatch_create()) }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> &mut Self {
        // A WriteBatch owns its handle until drop, so the guard never reports Disposed here
        // SAFETY: live batch handle; key and value outlive the call, which copies them.
        let _ = self.handle.with(|b| unsafe {
            capi::keel_writebatch_put(
                b,
                key.as_ptr() as *const c_char,
                key.len(),
                value.as_ptr() as *const c_char,
                value.len(),
            )
        });
        self
    }

    pub fn delete(&mut self, key: &[u8]) -> &mut Self {
        // Owned handle, never Disposed
        // SAFETY: live batch handle; the call copies the key.
        let _ = self
            .handle
            .with(|b| unsafe { capi::keel_writebatch_delete(b, key.as_ptr() as *const c_char, key.len()) });
        self
    }

    /// Drop every pending operation; the batch stays usable.
    pub fn clear(&mut self) {
        // Owned handle, never Disposed
        // SAFETY: live batch handle.
        let _ = self.handle.with(|b| unsafe { capi::keel_writebatch_clear(b) });
    }

    /// Number of pending operations.
    pub fn len(&self) -> usize {
        // SAFETY: live batch handle.
        self.handle.with(|b| unsafe { capi::keel_writebatch_count(b) }).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn with_handle<R>(&self, f: impl FnOnce(*mut capi::keel_writebatch_t) -> R) -> crate::Result<R> {
        self.handle.with(f)
    }
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WriteBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteBatch").field("len", &self.len()).finish()
    }
}
