//! Store, read and write options.
//!
//! Every setter writes straight through to the engine's options object;
//! there is no read-back.

use std::fmt;
use std::marker::PhantomData;

use keel_core::capi;

use crate::cache::Cache;
use crate::handle::Guarded;
use crate::snapshot::Snapshot;

/// Value compression for table files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    #[default]
    Snappy,
}

impl Compression {
    fn code(self) -> i32 {
        match self {
            Compression::None => 0,
            Compression::Snappy => 1,
        }
    }
}

/// Settings for opening a store.
///
/// Wrap in an `Arc` to open several databases from one set of options.
/// An attached [`Cache`] is retained here so it outlives every database
/// opened with these options.
pub struct Options {
    handle: Guarded<capi::keel_options_t>,
    cache: Option<Cache>,
}

impl Options {
    pub fn new() -> Self {
        Self { handle: Guarded::new(capi::keel_options_create()), cache: None }
    }

    fn apply(&mut self, f: impl FnOnce(*mut capi::keel_options_t)) -> &mut Self {
        // An Options value owns its handle until drop, so this never sees a released slot
        let _ = self.handle.with(f);
        self
    }

    pub fn set_create_if_missing(&mut self, value: bool) -> &mut Self {
        // SAFETY (all setters): the guard hands out a live options handle.
        self.apply(|o| unsafe { capi::keel_options_set_create_if_missing(o, u8::from(value)) })
    }

    pub fn set_error_if_exists(&mut self, value: bool) -> &mut Self {
        self.apply(|o| unsafe { capi::keel_options_set_error_if_exists(o, u8::from(value)) })
    }

    /// Fail the open on any damaged record instead of skipping it.
    pub fn set_paranoid_checks(&mut self, value: bool) -> &mut Self {
        self.apply(|o| unsafe { capi::keel_options_set_paranoid_checks(o, u8::from(value)) })
    }

    pub fn set_max_open_files(&mut self, value: i32) -> &mut Self {
        self.apply(|o| unsafe { capi::keel_options_set_max_open_files(o, value) })
    }

    pub fn set_compression(&mut self, value: Compression) -> &mut Self {
        self.apply(|o| unsafe { capi::keel_options_set_compression(o, value.code()) })
    }

    /// WAL size at which the engine checkpoints into a table file.
    pub fn set_write_buffer_size(&mut self, bytes: usize) -> &mut Self {
        self.apply(|o| unsafe { capi::keel_options_set_write_buffer_size(o, bytes) })
    }

    /// Attach a block cache, or detach with `None`.
    pub fn set_cache(&mut self, cache: Option<&Cache>) -> &mut Self {
        let native = cache.and_then(|c| c.with_handle(|ptr| ptr).ok()).unwrap_or(std::ptr::null_mut());
        self.cache = cache.cloned();
        self.apply(|o| unsafe { capi::keel_options_set_cache(o, native) })
    }

    pub fn cache(&self) -> Option<&Cache> {
        self.cache.as_ref()
    }

    pub(crate) fn with_handle<R>(&self, f: impl FnOnce(*mut capi::keel_options_t) -> R) -> crate::Result<R> {
        self.handle.with(f)
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options").field("cache", &self.cache).finish_non_exhaustive()
    }
}

/// Per-read settings. The lifetime ties these options to the snapshot they
/// are pinned to, so the snapshot cannot be released first.
pub struct ReadOptions<'s> {
    handle: Guarded<capi::keel_readoptions_t>,
    _snapshot: PhantomData<&'s ()>,
}

impl<'s> ReadOptions<'s> {
    pub fn new() -> Self {
        Self { handle: Guarded::new(capi::keel_readoptions_create()), _snapshot: PhantomData }
    }

    fn apply(&mut self, f: impl FnOnce(*mut capi::keel_readoptions_t)) -> &mut Self {
        // Owned handle, never Disposed
        let _ = self.handle.with(f);
        self
    }

    /// Verify each value's checksum before returning it.
    pub fn set_verify_checksums(&mut self, value: bool) -> &mut Self {
        self.apply(|o| unsafe { capi::keel_readoptions_set_verify_checksums(o, u8::from(value)) })
    }

    /// Whether values read should populate the block cache.
    pub fn set_fill_cache(&mut self, value: bool) -> &mut Self {
        self.apply(|o| unsafe { capi::keel_readoptions_set_fill_cache(o, u8::from(value)) })
    }

    /// Read as of `snapshot`, or the latest state with `None`.
    pub fn set_snapshot(&mut self, snapshot: Option<&'s Snapshot<'_>>) -> &mut Self {
        let native = snapshot.and_then(|s| s.with_handle(|ptr| ptr).ok()).unwrap_or(std::ptr::null_mut());
        self.apply(|o| unsafe { capi::keel_readoptions_set_snapshot(o, native) })
    }

    pub(crate) fn with_handle<R>(&self, f: impl FnOnce(*mut capi::keel_readoptions_t) -> R) -> crate::Result<R> {
        self.handle.with(f)
    }
}

impl Default for ReadOptions<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReadOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadOptions").finish_non_exhaustive()
    }
}

/// Per-write settings.
pub struct WriteOptions {
    handle: Guarded<capi::keel_writeoptions_t>,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self { handle: Guarded::new(capi::keel_writeoptions_create()) }
    }

    /// durable_sync the log before the write returns.
    pub fn set_sync(&mut self, value: bool) -> &mut Self {
        // Owned handle, never Disposed
        // SAFETY: the guard hands out a live write options handle.
        let _ = self.handle.with(|o| unsafe { capi::keel_writeoptions_set_sync(o, u8::from(value)) });
        self
    }

    pub(crate) fn with_handle<R>(&self, f: impl FnOnce(*mut capi::keel_writeoptions_t) -> R) -> crate::Result<R> {
        self.handle.with(f)
    }
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WriteOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteOptions").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setters_chain() {
        let mut options = Options::new();
        options
            .set_create_if_missing(true)
            .set_error_if_exists(false)
            .set_paranoid_checks(true)
            .set_max_open_files(500)
            .set_compression(Compression::None)
            .set_write_buffer_size(1 << 20);
        assert!(options.cache().is_none());
    }

    #[test]
    fn test_options_retain_cache() {
        let cache = Cache::new(1 << 20);
        let mut options = Options::new();
        options.set_cache(Some(&cache));
        assert_eq!(cache.handle_count(), 2);

        options.set_cache(None);
        assert_eq!(cache.handle_count(), 1);
        assert!(options.cache().is_none());
    }

    #[test]
    fn test_read_and_write_options_build() {
        let mut read = ReadOptions::new();
        read.set_verify_checksums(true).set_fill_cache(false).set_snapshot(None);
        let mut write = WriteOptions::default();
        write.set_sync(true);
        assert!(write.with_handle(|ptr| !ptr.is_null()).unwrap());
    }
}
