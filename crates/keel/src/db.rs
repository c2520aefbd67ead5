//! Database handle.

use std::ffi::{c_char, CString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;

use keel_core::capi;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::batch::WriteBatch;
use crate::error::{Error, Result};
use crate::ffi::{path_to_cstring, take_buffer, take_string, ErrorSlot};
use crate::handle::Guarded;
use crate::iterator::DbIterator;
use crate::options::{Options, ReadOptions, WriteOptions};
use crate::snapshot::Snapshot;

type MaintenanceCall = unsafe extern "C" fn(*const capi::keel_options_t, *const c_char, *mut *mut c_char);

/// An open store.
///
/// Shareable across threads; the engine serializes writers itself. Closing
/// is terminal: after [`close`](Self::close) every operation fails with
/// [`Error::Disposed`].
pub struct Database {
    handle: Guarded<capi::keel_t>,
    /// Keeps an attached cache alive for as long as the handle
    options: Mutex<Option<Arc<Options>>>,
    path: PathBuf,
}

impl Database {
    /// Open the store at `path`. `None` uses default options, which do not
    /// create a missing store.
    pub fn open<P: AsRef<Path>>(options: Option<Arc<Options>>, path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let c_path = path_to_cstring(&path)?;
        let options = options.unwrap_or_else(|| Arc::new(Options::new()));

        let mut err = ErrorSlot::new();
        // SAFETY: live options handle, NUL-terminated path, and an error slot we own.
        let raw = options.with_handle(|o| unsafe { capi::keel_open(o, c_path.as_ptr(), err.as_mut_ptr()) })?;
        err.check(Error::Open)?;
        if raw.is_null() {
            return Err(Error::Open(format!("{}: engine returned no handle", path.display())));
        }

        debug!(path = %path.display(), "opened database");
        Ok(Self { handle: Guarded::new(raw), options: Mutex::new(Some(options)), path })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_with(&ReadOptions::new(), key)
    }

    /// `Ok(None)` when the key is absent; a stored empty value is `Ok(Some(vec![]))`.
    pub fn get_with(&self, read: &ReadOptions<'_>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.handle.with(|db| {
            read.with_handle(|ro| -> Result<Option<Vec<u8>>> {
                let mut len = 0usize;
                let mut err = ErrorSlot::new();
                // SAFETY: live handles; the key outlives the call.
                let value = unsafe {
                    capi::keel_get(db, ro, key.as_ptr() as *const c_char, key.len(), &mut len, err.as_mut_ptr())
                };
                err.check(Error::Read)?;
                // SAFETY: a non-null result is a malloc'd buffer of `len` bytes.
                Ok(unsafe { take_buffer(value, len) })
            })?
        })?
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with(&WriteOptions::new(), key, value)
    }

    pub fn put_with(&self, write: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        self.write_call(write, |db, wo, err| unsafe {
            capi::keel_put(
                db,
                wo,
                key.as_ptr() as *const c_char,
                key.len(),
                value.as_ptr() as *const c_char,
                value.len(),
                err,
            )
        })
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.delete_with(&WriteOptions::new(), key)
    }

    pub fn delete_with(&self, write: &WriteOptions, key: &[u8]) -> Result<()> {
        self.write_call(write, |db, wo, err| unsafe {
            capi::keel_delete(db, wo, key.as_ptr() as *const c_char, key.len(), err)
        })
    }

    /// Apply every operation in `batch`, in order, as one atomic unit.
    pub fn write(&self, batch: &WriteBatch) -> Result<()> {
        self.write_with(&WriteOptions::new(), batch)
    }

    pub fn write_with(&self, write: &WriteOptions, batch: &WriteBatch) -> Result<()> {
        batch.with_handle(|b| self.write_call(write, |db, wo, err| unsafe { capi::keel_write(db, wo, b, err) }))?
    }

    /// Holds the database and write options guards across one engine write call.
    fn write_call(
        &self,
        write: &WriteOptions,
        call: impl FnOnce(*mut capi::keel_t, *mut capi::keel_writeoptions_t, *mut *mut c_char),
    ) -> Result<()> {
        self.handle.with(|db| {
            write.with_handle(|wo| {
                let mut err = ErrorSlot::new();
                call(db, wo, err.as_mut_ptr());
                err.check(Error::Write)
            })
        })??
    }

    /// Iterate the whole store in ascending key order.
    pub fn iter(&self) -> Result<DbIterator<'_>> {
        self.iter_with(&ReadOptions::new())
    }

    pub fn iter_with(&self, read: &ReadOptions<'_>) -> Result<DbIterator<'_>> {
        let mut iter = self.raw_iter(read)?;
        iter.seek_to_first();
        Ok(iter)
    }

    /// Iterate from the first key `>= start`.
    pub fn iter_from(&self, read: &ReadOptions<'_>, start: &[u8]) -> Result<DbIterator<'_>> {
        let mut iter = self.raw_iter(read)?;
        iter.seek(start);
        Ok(iter)
    }

    fn raw_iter(&self, read: &ReadOptions<'_>) -> Result<DbIterator<'_>> {
        let mut err = ErrorSlot::new();
        // SAFETY: live handles for the duration of the call and an owned error slot.
        let raw = self
            .handle
            .with(|db| read.with_handle(|ro| unsafe { capi::keel_create_iterator(db, ro, err.as_mut_ptr()) }))??;
        err.check(Error::Read)?;
        if raw.is_null() {
            return Err(Error::Read("engine could not create an iterator".to_string()));
        }
        Ok(DbIterator::new(Guarded::new(raw), self))
    }

    /// Capture the current committed state.
    pub fn snapshot(&self) -> Result<Snapshot<'_>> {
        let mut err = ErrorSlot::new();
        // SAFETY: live database handle and an owned error slot.
        let raw = self.handle.with(|db| unsafe { capi::keel_create_snapshot(db, err.as_mut_ptr()) })?;
        err.check(Error::Read)?;
        if raw.is_null() {
            return Err(Error::Read("engine could not create a snapshot".to_string()));
        }
        Ok(Snapshot::new(Guarded::new(raw), self))
    }

    /// Compact keys in `[start, limit)`; `None` leaves that end open.
    pub fn compact_range(&self, start: Option<&[u8]>, limit: Option<&[u8]>) -> Result<()> {
        let (start_ptr, start_len) = start.map_or((ptr::null(), 0), |k| (k.as_ptr() as *const c_char, k.len()));
        let (limit_ptr, limit_len) = limit.map_or((ptr::null(), 0), |k| (k.as_ptr() as *const c_char, k.len()));
        // SAFETY: live handle; the bounds outlive the call.
        self.handle.with(|db| unsafe { capi::keel_compact_range(db, start_ptr, start_len, limit_ptr, limit_len) })
    }

    /// Compact the entire key range.
    pub fn compact(&self) -> Result<()> {
        self.compact_range(None, None)
    }

    /// Engine diagnostic property such as `keel.stats`; `None` for unknown names.
    pub fn property(&self, name: &str) -> Result<Option<String>> {
        let c_name = CString::new(name)
            .map_err(|_| Error::ContractViolation(format!("property name {:?} contains a NUL byte", name)))?;
        // SAFETY: live handle; a non-null result is a malloc'd C string.
        self.handle.with(|db| unsafe { take_string(capi::keel_property_value(db, c_name.as_ptr())) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_released()
    }

    /// Release the engine handle. Waits for in-flight calls; later calls
    /// (including further closes) do nothing.
    pub fn close(&self) {
        if self.handle.release() {
            debug!(path = %self.path.display(), "closed database");
        }
        // Options go only after the handle, so an attached cache outlives it
        self.options.lock().take();
    }

    /// Salvage what is readable from a damaged store. Needs no open handle.
    pub fn repair<P: AsRef<Path>>(options: Option<&Options>, path: P) -> Result<()> {
        Self::maintenance(options, path.as_ref(), capi::keel_repair_db)?;
        info!(path = %path.as_ref().display(), "repaired database");
        Ok(())
    }

    /// Delete the store at `path`. Fails while another handle has it open.
    pub fn destroy<P: AsRef<Path>>(options: Option<&Options>, path: P) -> Result<()> {
        Self::maintenance(options, path.as_ref(), capi::keel_destroy_db)?;
        info!(path = %path.as_ref().display(), "destroyed database");
        Ok(())
    }

    fn maintenance(options: Option<&Options>, path: &Path, call: MaintenanceCall) -> Result<()> {
        let c_path = path_to_cstring(path)?;
        let mut err = ErrorSlot::new();
        // SAFETY: options handle live (or null), NUL-terminated path, owned error slot.
        match options {
            Some(options) => options.with_handle(|o| unsafe { call(o, c_path.as_ptr(), err.as_mut_ptr()) })?,
            None => unsafe { call(ptr::null(), c_path.as_ptr(), err.as_mut_ptr()) },
        }
        err.check(Error::Maintenance)
    }

    pub(crate) fn with_handle<R>(&self, f: impl FnOnce(*mut capi::keel_t) -> R) -> Result<R> {
        self.handle.with(f)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}
