//! C-style interface to the engine
//!
//! Every engine object crosses the boundary as an opaque heap pointer created
//! here and destroyed by the matching `*_destroy` / `*_close` / `*_release`
//! call. Keys and values travel as (pointer, length) pairs. Buffers returned
//! to the caller (`keel_get`, `keel_property_value`, error strings) come
//! from `malloc` and must be released with `keel_free`.
//!
//! Fallible calls take `errptr`: on failure `*errptr` receives a message
//! (any message already there is freed first); on success it is untouched.

#![allow(non_camel_case_types)]
#![allow(clippy::missing_safety_doc)]

use std::ffi::{c_char, c_void, CStr};
use std::path::PathBuf;
use std::ptr;
use std::sync::Arc;

use crate::batch::WriteBatch;
use crate::cache::BlockCache;
use crate::config::{Compression, Config, ReadOptions, WriteOptions};
use crate::engine::{EngineIterator, EngineSnapshot, KeelEngine};
use crate::error::{KeelError, KeelResult};

pub const KEEL_MAJOR_VERSION: i32 = 1;
pub const KEEL_MINOR_VERSION: i32 = 3;

pub struct keel_t {
    pub(crate) engine: KeelEngine,
}

pub struct keel_options_t {
    pub(crate) config: Config,
}

pub struct keel_readoptions_t {
    pub(crate) options: ReadOptions,
}

pub struct keel_writeoptions_t {
    pub(crate) options: WriteOptions,
}

pub struct keel_writebatch_t {
    pub(crate) batch: WriteBatch,
}

pub struct keel_iterator_t {
    pub(crate) iter: EngineIterator,
}

pub struct keel_snapshot_t {
    pub(crate) snapshot: EngineSnapshot,
}

pub struct keel_cache_t {
    pub(crate) cache: Arc<BlockCache>,
}

/// Copy `data` into a fresh malloc'd buffer. Never null for a successful
/// allocation, even when `data` is empty.
fn malloc_copy(data: &[u8], nul_terminate: bool) -> *mut c_char {
    let len = data.len() + usize::from(nul_terminate);
    // SAFETY: malloc of at least one byte; the copy stays inside the allocation.
    unsafe {
        let buf = libc::malloc(len.max(1)) as *mut u8;
        if buf.is_null() {
            return ptr::null_mut();
        }
        ptr::copy_nonoverlapping(data.as_ptr(), buf, data.len());
        if nul_terminate {
            *buf.add(data.len()) = 0;
        }
        buf as *mut c_char
    }
}

unsafe fn save_error(errptr: *mut *mut c_char, err: &KeelError) {
    if errptr.is_null() {
        return;
    }
    if !(*errptr).is_null() {
        libc::free(*errptr as *mut c_void);
    }
    *errptr = malloc_copy(err.to_string().as_bytes(), true);
}

unsafe fn report<T>(errptr: *mut *mut c_char, result: KeelResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            save_error(errptr, &e);
            None
        }
    }
}

unsafe fn bytes<'a>(data: *const c_char, len: usize) -> &'a [u8] {
    if data.is_null() || len == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(data as *const u8, len)
    }
}

unsafe fn require<'a, T>(handle: *const T, name: &str) -> KeelResult<&'a T> {
    handle.as_ref().ok_or_else(|| KeelError::InvalidArgument(format!("{} must not be null", name)))
}

unsafe fn path_from(name: *const c_char) -> KeelResult<PathBuf> {
    if name.is_null() {
        return Err(KeelError::InvalidArgument("name must not be null".to_string()));
    }
    let raw = CStr::from_ptr(name);
    if raw.to_bytes().is_empty() {
        return Err(KeelError::InvalidArgument("name must not be empty".to_string()));
    }
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        Ok(PathBuf::from(std::ffi::OsStr::from_bytes(raw.to_bytes())))
    }
    #[cfg(not(unix))]
    {
        raw.to_str()
            .map(PathBuf::from)
            .map_err(|e| KeelError::InvalidArgument(format!("name is not valid UTF-8: {}", e)))
    }
}

unsafe fn config_of(options: *const keel_options_t) -> Config {
    options.as_ref().map(|o| o.config.clone()).unwrap_or_default()
}

unsafe fn read_options_of(options: *const keel_readoptions_t) -> ReadOptions {
    options.as_ref().map(|o| o.options).unwrap_or_default()
}

unsafe fn write_options_of(options: *const keel_writeoptions_t) -> WriteOptions {
    options.as_ref().map(|o| o.options).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn keel_open(
    options: *const keel_options_t,
    name: *const c_char,
    errptr: *mut *mut c_char,
) -> *mut keel_t {
    let opened = path_from(name).and_then(|path| KeelEngine::open(path, config_of(options)));
    match report(errptr, opened) {
        Some(engine) => Box::into_raw(Box::new(keel_t { engine })),
        None => ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn keel_close(db: *mut keel_t) {
    if !db.is_null() {
        drop(Box::from_raw(db));
    }
}

#[no_mangle]
pub unsafe extern "C" fn keel_put(
    db: *mut keel_t,
    options: *const keel_writeoptions_t,
    key: *const c_char,
    keylen: usize,
    val: *const c_char,
    vallen: usize,
    errptr: *mut *mut c_char,
) {
    let result = require(db, "db")
        .and_then(|db| db.engine.put(&write_options_of(options), bytes(key, keylen), bytes(val, vallen)));
    report(errptr, result);
}

#[no_mangle]
pub unsafe extern "C" fn keel_delete(
    db: *mut keel_t,
    options: *const keel_writeoptions_t,
    key: *const c_char,
    keylen: usize,
    errptr: *mut *mut c_char,
) {
    let result = require(db, "db").and_then(|db| db.engine.delete(&write_options_of(options), bytes(key, keylen)));
    report(errptr, result);
}

#[no_mangle]
pub unsafe extern "C" fn keel_write(
    db: *mut keel_t,
    options: *const keel_writeoptions_t,
    batch: *const keel_writebatch_t,
    errptr: *mut *mut c_char,
) {
    let result = require(db, "db").and_then(|db| {
        let batch = require(batch, "batch")?;
        db.engine.write(&write_options_of(options), &batch.batch)
    });
    report(errptr, result);
}

/// Returns null when the key is absent (or on error, with `*errptr` set).
/// A present value, even an empty one, is a non-null malloc'd buffer.
#[no_mangle]
pub unsafe extern "C" fn keel_get(
    db: *mut keel_t,
    options: *const keel_readoptions_t,
    key: *const c_char,
    keylen: usize,
    vallen: *mut usize,
    errptr: *mut *mut c_char,
) -> *mut c_char {
    let result = require(db, "db").and_then(|db| db.engine.get(&read_options_of(options), bytes(key, keylen)));
    let found = report(errptr, result).flatten();
    if !vallen.is_null() {
        *vallen = found.as_ref().map_or(0, Vec::len);
    }
    match found {
        Some(value) => malloc_copy(&value, false),
        None => ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn keel_create_iterator(
    db: *mut keel_t,
    options: *const keel_readoptions_t,
    errptr: *mut *mut c_char,
) -> *mut keel_iterator_t {
    let result = require(db, "db").and_then(|db| db.engine.iter(&read_options_of(options)));
    match report(errptr, result) {
        Some(iter) => Box::into_raw(Box::new(keel_iterator_t { iter })),
        None => ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn keel_create_snapshot(db: *mut keel_t, errptr: *mut *mut c_char) -> *mut keel_snapshot_t {
    let result = require(db, "db").and_then(|db| db.engine.snapshot());
    match report(errptr, result) {
        Some(snapshot) => Box::into_raw(Box::new(keel_snapshot_t { snapshot })),
        None => ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn keel_release_snapshot(snapshot: *mut keel_snapshot_t) {
    if !snapshot.is_null() {
        drop(Box::from_raw(snapshot));
    }
}

/// Null for unknown property names or a closed database.
#[no_mangle]
pub unsafe extern "C" fn keel_property_value(db: *mut keel_t, propname: *const c_char) -> *mut c_char {
    let Some(db) = db.as_ref() else { return ptr::null_mut() };
    if propname.is_null() {
        return ptr::null_mut();
    }
    let Ok(name) = CStr::from_ptr(propname).to_str() else { return ptr::null_mut() };
    match db.engine.property(name) {
        Ok(Some(value)) => malloc_copy(value.as_bytes(), true),
        _ => ptr::null_mut(),
    }
}

/// A null `start_key` or `limit_key` leaves that end of the range open.
#[no_mangle]
pub unsafe extern "C" fn keel_compact_range(
    db: *mut keel_t,
    start_key: *const c_char,
    start_key_len: usize,
    limit_key: *const c_char,
    limit_key_len: usize,
) {
    let Some(db) = db.as_ref() else { return };
    let start = (!start_key.is_null()).then(|| bytes(start_key, start_key_len));
    let limit = (!limit_key.is_null()).then(|| bytes(limit_key, limit_key_len));
    if let Err(e) = db.engine.compact_range(start, limit) {
        tracing::warn!(error = %e, "compact_range failed");
    }
}

// ---------------------------------------------------------------------------
// Management
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn keel_repair_db(
    options: *const keel_options_t,
    name: *const c_char,
    errptr: *mut *mut c_char,
) {
    let result = path_from(name).and_then(|path| KeelEngine::repair(path, &config_of(options)));
    report(errptr, result);
}

#[no_mangle]
pub unsafe extern "C" fn keel_destroy_db(
    options: *const keel_options_t,
    name: *const c_char,
    errptr: *mut *mut c_char,
) {
    let _ = options;
    let result = path_from(name).and_then(KeelEngine::destroy);
    report(errptr, result);
}

// ---------------------------------------------------------------------------
// Iterator
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn keel_iter_destroy(iter: *mut keel_iterator_t) {
    if !iter.is_null() {
        drop(Box::from_raw(iter));
    }
}

#[no_mangle]
pub unsafe extern "C" fn keel_iter_valid(iter: *const keel_iterator_t) -> u8 {
    iter.as_ref().map_or(0, |it| u8::from(it.iter.valid()))
}

#[no_mangle]
pub unsafe extern "C" fn keel_iter_seek_to_first(iter: *mut keel_iterator_t) {
    if let Some(it) = iter.as_mut() {
        it.iter.seek_to_first();
    }
}

#[no_mangle]
pub unsafe extern "C" fn keel_iter_seek(iter: *mut keel_iterator_t, k: *const c_char, klen: usize) {
    if let Some(it) = iter.as_mut() {
        it.iter.seek(bytes(k, klen));
    }
}

#[no_mangle]
pub unsafe extern "C" fn keel_iter_next(iter: *mut keel_iterator_t) {
    if let Some(it) = iter.as_mut() {
        it.iter.next();
    }
}

/// Borrowed pointer into the iterator, valid until it moves or is destroyed.
#[no_mangle]
pub unsafe extern "C" fn keel_iter_key(iter: *const keel_iterator_t, klen: *mut usize) -> *const c_char {
    borrowed(iter.as_ref().and_then(|it| it.iter.key()), klen)
}

/// Borrowed pointer into the iterator, valid until it moves or is destroyed.
#[no_mangle]
pub unsafe extern "C" fn keel_iter_value(iter: *const keel_iterator_t, vlen: *mut usize) -> *const c_char {
    borrowed(iter.as_ref().and_then(|it| it.iter.value()), vlen)
}

unsafe fn borrowed(data: Option<&[u8]>, len: *mut usize) -> *const c_char {
    if !len.is_null() {
        *len = data.map_or(0, <[u8]>::len);
    }
    data.map_or(ptr::null(), |d| d.as_ptr() as *const c_char)
}

#[no_mangle]
pub unsafe extern "C" fn keel_iter_get_error(iter: *const keel_iterator_t, errptr: *mut *mut c_char) {
    if let Some(err) = iter.as_ref().and_then(|it| it.iter.status()) {
        save_error(errptr, err);
    }
}

// ---------------------------------------------------------------------------
// Write batch
// ---------------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn keel_writebatch_create() -> *mut keel_writebatch_t {
    Box::into_raw(Box::new(keel_writebatch_t { batch: WriteBatch::new() }))
}

#[no_mangle]
pub unsafe extern "C" fn keel_writebatch_destroy(batch: *mut keel_writebatch_t) {
    if !batch.is_null() {
        drop(Box::from_raw(batch));
    }
}

#[no_mangle]
pub unsafe extern "C" fn keel_writebatch_clear(batch: *mut keel_writebatch_t) {
    if let Some(b) = batch.as_mut() {
        b.batch.clear();
    }
}

#[no_mangle]
pub unsafe extern "C" fn keel_writebatch_put(
    batch: *mut keel_writebatch_t,
    key: *const c_char,
    klen: usize,
    val: *const c_char,
    vlen: usize,
) {
    if let Some(b) = batch.as_mut() {
        b.batch.put(bytes(key, klen), bytes(val, vlen));
    }
}

#[no_mangle]
pub unsafe extern "C" fn keel_writebatch_delete(batch: *mut keel_writebatch_t, key: *const c_char, klen: usize) {
    if let Some(b) = batch.as_mut() {
        b.batch.delete(bytes(key, klen));
    }
}

#[no_mangle]
pub unsafe extern "C" fn keel_writebatch_count(batch: *const keel_writebatch_t) -> usize {
    batch.as_ref().map_or(0, |b| b.batch.len())
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn keel_options_create() -> *mut keel_options_t {
    Box::into_raw(Box::new(keel_options_t { config: Config::default() }))
}

#[no_mangle]
pub unsafe extern "C" fn keel_options_destroy(options: *mut keel_options_t) {
    if !options.is_null() {
        drop(Box::from_raw(options));
    }
}

#[no_mangle]
pub unsafe extern "C" fn keel_options_set_create_if_missing(options: *mut keel_options_t, v: u8) {
    if let Some(o) = options.as_mut() {
        o.config.create_if_missing = v != 0;
    }
}

#[no_mangle]
pub unsafe extern "C" fn keel_options_set_error_if_exists(options: *mut keel_options_t, v: u8) {
    if let Some(o) = options.as_mut() {
        o.config.error_if_exists = v != 0;
    }
}

#[no_mangle]
pub unsafe extern "C" fn keel_options_set_paranoid_checks(options: *mut keel_options_t, v: u8) {
    if let Some(o) = options.as_mut() {
        o.config.paranoid_checks = v != 0;
    }
}

#[no_mangle]
pub unsafe extern "C" fn keel_options_set_max_open_files(options: *mut keel_options_t, n: i32) {
    if let Some(o) = options.as_mut() {
        o.config.max_open_files = n;
    }
}

/// Unknown codes leave the setting unchanged.
#[no_mangle]
pub unsafe extern "C" fn keel_options_set_compression(options: *mut keel_options_t, code: i32) {
    if let (Some(o), Some(compression)) = (options.as_mut(), Compression::from_raw(code)) {
        o.config.compression = compression;
    }
}

#[no_mangle]
pub unsafe extern "C" fn keel_options_set_write_buffer_size(options: *mut keel_options_t, size: usize) {
    if let Some(o) = options.as_mut() {
        o.config.write_buffer_size = size;
    }
}

/// The options object takes its own reference to the cache; a null cache
/// detaches. The caller may destroy its cache handle afterwards.
#[no_mangle]
pub unsafe extern "C" fn keel_options_set_cache(options: *mut keel_options_t, cache: *const keel_cache_t) {
    if let Some(o) = options.as_mut() {
        o.config.block_cache = cache.as_ref().map(|c| Arc::clone(&c.cache));
    }
}

#[no_mangle]
pub extern "C" fn keel_readoptions_create() -> *mut keel_readoptions_t {
    Box::into_raw(Box::new(keel_readoptions_t { options: ReadOptions::default() }))
}

#[no_mangle]
pub unsafe extern "C" fn keel_readoptions_destroy(options: *mut keel_readoptions_t) {
    if !options.is_null() {
        drop(Box::from_raw(options));
    }
}

#[no_mangle]
pub unsafe extern "C" fn keel_readoptions_set_verify_checksums(options: *mut keel_readoptions_t, v: u8) {
    if let Some(o) = options.as_mut() {
        o.options.verify_checksums = v != 0;
    }
}

#[no_mangle]
pub unsafe extern "C" fn keel_readoptions_set_fill_cache(options: *mut keel_readoptions_t, v: u8) {
    if let Some(o) = options.as_mut() {
        o.options.fill_cache = v != 0;
    }
}

/// Null clears the snapshot. The snapshot's sequence is copied, so the
/// caller keeps ownership of the snapshot handle.
#[no_mangle]
pub unsafe extern "C" fn keel_readoptions_set_snapshot(
    options: *mut keel_readoptions_t,
    snapshot: *const keel_snapshot_t,
) {
    if let Some(o) = options.as_mut() {
        o.options.snapshot = snapshot.as_ref().map(|s| s.snapshot.sequence());
    }
}

#[no_mangle]
pub extern "C" fn keel_writeoptions_create() -> *mut keel_writeoptions_t {
    Box::into_raw(Box::new(keel_writeoptions_t { options: WriteOptions::default() }))
}

#[no_mangle]
pub unsafe extern "C" fn keel_writeoptions_destroy(options: *mut keel_writeoptions_t) {
    if !options.is_null() {
        drop(Box::from_raw(options));
    }
}

#[no_mangle]
pub unsafe extern "C" fn keel_writeoptions_set_sync(options: *mut keel_writeoptions_t, v: u8) {
    if let Some(o) = options.as_mut() {
        o.options.sync = v != 0;
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn keel_cache_create_lru(capacity: usize) -> *mut keel_cache_t {
    Box::into_raw(Box::new(keel_cache_t { cache: Arc::new(BlockCache::new(capacity)) }))
}

/// Drops this handle's reference; options and databases using the cache
/// keep it alive.
#[no_mangle]
pub unsafe extern "C" fn keel_cache_destroy(cache: *mut keel_cache_t) {
    if !cache.is_null() {
        drop(Box::from_raw(cache));
    }
}

#[no_mangle]
pub unsafe extern "C" fn keel_cache_total_charge(cache: *const keel_cache_t) -> usize {
    cache.as_ref().map_or(0, |c| c.cache.total_charge())
}

#[no_mangle]
pub unsafe extern "C" fn keel_cache_capacity(cache: *const keel_cache_t) -> usize {
    cache.as_ref().map_or(0, |c| c.cache.capacity())
}

// ---------------------------------------------------------------------------
// Utility
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn keel_free(ptr: *mut c_void) {
    libc::free(ptr);
}

#[no_mangle]
pub extern "C" fn keel_major_version() -> i32 {
    KEEL_MAJOR_VERSION
}

#[no_mangle]
pub extern "C" fn keel_minor_version() -> i32 {
    KEEL_MINOR_VERSION
}
