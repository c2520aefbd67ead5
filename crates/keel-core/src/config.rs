//! Configuration for opening a Keel store
//!
//! `Config` is what the C options object (`keel_options_t`) accumulates through
//! its setters. The engine never trusts the raw values: `sanitized()` clamps
//! them into the ranges the engine can work with before a store is opened.

use std::sync::Arc;

use crate::cache::BlockCache;

/// Smallest accepted WAL size before a checkpoint is forced (64KB)
pub const MIN_WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Largest accepted WAL size before a checkpoint is forced (1GB)
pub const MAX_WRITE_BUFFER_SIZE: usize = 1024 * 1024 * 1024;

/// Bounds applied to `max_open_files`
pub const MIN_OPEN_FILES: i32 = 74;
pub const MAX_OPEN_FILES: i32 = 50_000;

/// Value compression used when writing table files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Compression {
    /// Store values as-is
    None = 0,
    /// Raw Snappy block format
    #[default]
    Snappy = 1,
}

impl Compression {
    /// Map the integer passed across the C interface. Unknown codes are rejected.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Compression::None),
            1 => Some(Compression::Snappy),
            _ => None,
        }
    }
}

/// Keel store configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Create the store if the path holds none
    pub create_if_missing: bool,
    /// Fail the open if a store already exists at the path
    pub error_if_exists: bool,
    /// Treat any damaged record found during recovery as fatal
    pub paranoid_checks: bool,
    /// Upper bound on table files the engine keeps open
    pub max_open_files: i32,
    /// Compression for values written to table files
    pub compression: Compression,
    /// WAL size that triggers a checkpoint into a table file
    pub write_buffer_size: usize,
    /// Shared block cache; None disables caching
    pub block_cache: Option<Arc<BlockCache>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            error_if_exists: false,
            paranoid_checks: false,
            max_open_files: 1000,
            compression: Compression::Snappy,
            write_buffer_size: 4 * 1024 * 1024,
            block_cache: None,
        }
    }
}

impl Config {
    /// Clamp numeric settings into their supported ranges.
    pub fn sanitized(&self) -> Self {
        let mut config = self.clone();
        config.max_open_files = config.max_open_files.clamp(MIN_OPEN_FILES, MAX_OPEN_FILES);
        config.write_buffer_size = config
            .write_buffer_size
            .clamp(MIN_WRITE_BUFFER_SIZE, MAX_WRITE_BUFFER_SIZE);
        config
    }
}

/// Per-read settings
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    /// Recompute each value's CRC32C before returning it
    pub verify_checksums: bool,
    /// Populate the block cache with values this read loads
    pub fill_cache: bool,
    /// Read as of this sequence number instead of the latest state
    pub snapshot: Option<u64>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self { verify_checksums: false, fill_cache: true, snapshot: None }
    }
}

/// Per-write settings
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// durable_sync the WAL before the write returns
    pub sync: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(!config.create_if_missing);
        assert!(!config.error_if_exists);
        assert!(!config.paranoid_checks);
        assert_eq!(config.compression, Compression::Snappy);
        assert!(config.block_cache.is_none());

        let read = ReadOptions::default();
        assert!(read.fill_cache && !read.verify_checksums && read.snapshot.is_none());
        assert!(!WriteOptions::default().sync);
    }

    #[test]
    fn test_sanitize_clamps() {
        let mut config = Config::default();
        config.max_open_files = 3;
        config.write_buffer_size = 10;
        let clean = config.sanitized();
        assert_eq!(clean.max_open_files, MIN_OPEN_FILES);
        assert_eq!(clean.write_buffer_size, MIN_WRITE_BUFFER_SIZE);

        config.max_open_files = i32::MAX;
        assert_eq!(config.sanitized().max_open_files, MAX_OPEN_FILES);
    }

    #[test]
    fn test_compression_codes() {
        assert_eq!(Compression::from_raw(0), Some(Compression::None));
        assert_eq!(Compression::from_raw(1), Some(Compression::Snappy));
        assert_eq!(Compression::from_raw(7), None);
    }
}
