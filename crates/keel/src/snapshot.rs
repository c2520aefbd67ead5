//! Point-in-time read views.

use std::fmt;

use keel_core::capi;
use tracing::trace;

use crate::db::Database;
use crate::error::Result;
use crate::handle::Guarded;
use crate::iterator::DbIterator;
use crate::options::ReadOptions;

/// Committed state as of [`Database::snapshot`]. Reads through it ignore
/// every later write. Borrowing the database keeps the snapshot from
/// outliving it; closing the database makes further reads fail with
/// `Disposed`.
pub struct Snapshot<'a> {
    handle: Guarded<capi::keel_snapshot_t>,
    db: &'a Database,
}

impl<'a> Snapshot<'a> {
    pub(crate) fn new(handle: Guarded<capi::keel_snapshot_t>, db: &'a Database) -> Self {
        Self { handle, db }
    }

    /// Read options pinned to this snapshot.
    pub fn read_options(&self) -> ReadOptions<'_> {
        let mut read = ReadOptions::new();
        read.set_snapshot(Some(self));
        read
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db.get_with(&self.read_options(), key)
    }

    /// Iterate the snapshot's state from the first key.
    pub fn iter(&self) -> Result<DbIterator<'a>> {
        self.db.iter_with(&self.read_options())
    }

    /// Release the engine snapshot now rather than at drop.
    pub fn release(self) {
        self.handle.release();
    }

    pub(crate) fn with_handle<R>(&self, f: impl FnOnce(*mut capi::keel_snapshot_t) -> R) -> Result<R> {
        self.handle.with(f)
    }
}

impl Drop for Snapshot<'_> {
    fn drop(&mut self) {
        if self.handle.release() {
            trace!("snapshot released on drop");
        }
    }
}

impl fmt::Debug for Snapshot<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("db", &self.db.path())
            .field("released", &self.handle.is_released())
            .finish()
    }
}
