//! Ordered cursors over a database or snapshot.

use std::ffi::c_char;
use std::fmt;

use keel_core::capi;
use tracing::trace;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::ffi::{copy_borrowed, ErrorSlot};
use crate::handle::Guarded;

/// Yields `(key, value)` pairs in ascending bytewise key order, each copied
/// out of the engine. The view is fixed when the iterator is created.
///
/// Iteration stops at the end of the data or at the first failure; check
/// [`status`](Self::status) to tell the two apart.
pub struct DbIterator<'a> {
    handle: Guarded<capi::keel_iterator_t>,
    db: &'a Database,
    error: Option<Error>,
}

impl<'a> DbIterator<'a> {
    pub(crate) fn new(handle: Guarded<capi::keel_iterator_t>, db: &'a Database) -> Self {
        Self { handle, db, error: None }
    }

    /// Runs `f` with the iterator handle while the database is known open.
    fn call<R>(&self, f: impl FnOnce(*mut capi::keel_iterator_t) -> R) -> Result<R> {
        self.db.with_handle(|_| self.handle.with(f))?
    }

    pub fn seek_to_first(&mut self) {
        // SAFETY: live iterator handle.
        let moved = self.call(|it| unsafe { capi::keel_iter_seek_to_first(it) });
        self.error = moved.err();
    }

    /// Position at the first key `>= key`.
    pub fn seek(&mut self, key: &[u8]) {
        // SAFETY: live iterator handle; the key outlives the call.
        let moved = self.call(|it| unsafe { capi::keel_iter_seek(it, key.as_ptr() as *const c_char, key.len()) });
        self.error = moved.err();
    }

    /// `Ok` if iteration ended cleanly (or has not ended).
    pub fn status(&self) -> Result<()> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        self.engine_status()
    }

    fn engine_status(&self) -> Result<()> {
        self.call(|it| {
            let mut err = ErrorSlot::new();
            // SAFETY: live iterator handle and an error slot we own.
            unsafe { capi::keel_iter_get_error(it, err.as_mut_ptr()) };
            err.check(Error::Read)
        })?
    }

    /// Release the engine iterator now rather than at drop.
    pub fn close(self) {
        self.handle.release();
    }

    fn step(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.call(|it| unsafe {
            // SAFETY: live iterator handle. Key and value views stay valid
            // until the next move, and are copied before it.
            if capi::keel_iter_valid(it) == 0 {
                return None;
            }
            let mut klen = 0usize;
            let key = copy_borrowed(capi::keel_iter_key(it, &mut klen), klen);
            let mut vlen = 0usize;
            let value = copy_borrowed(capi::keel_iter_value(it, &mut vlen), vlen);
            capi::keel_iter_next(it);
            Some((key, value))
        })
    }
}

impl Iterator for DbIterator<'_> {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.error.is_some() {
            return None;
        }
        match self.step() {
            Ok(Some(entry)) => Some(entry),
            Ok(None) => {
                self.error = self.engine_status().err();
                None
            }
            Err(err) => {
                self.error = Some(err);
                None
            }
        }
    }
}

impl Drop for DbIterator<'_> {
    fn drop(&mut self) {
        if self.handle.release() {
            trace!("iterator released on drop");
        }
    }
}

impl fmt::Debug for DbIterator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbIterator")
            .field("db", &self.db.path())
            .field("error", &self.error)
            .finish()
    }
}
