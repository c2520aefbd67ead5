//! Keel Core: embedded ordered key-value engine
//!
//! A key-value engine where RAM holds the working set in bytewise key order
//! and an SSD-backed write-ahead log provides crash safety.
//!
//! # Architecture
//!
//! - **Read path**: multi-version memtable, optionally through a shared LRU block cache
//! - **Write path**: WAL-first, then memtable; one batch is one WAL record
//! - **Checkpoint**: live state written to a table file, old WAL segments retired
//!
//! # Boundary
//!
//! Applications reach the engine through the C-style handle interface in
//! [`capi`]. The Rust types behind it are public for tests and tooling, but
//! the client crate (`keel`) only ever talks to the `keel_*` functions.

pub mod batch;
pub mod cache;
pub mod capi;
pub mod config;
pub mod durability;
pub mod engine;
pub mod error;
pub mod format;
pub mod lock;
pub mod memtable;
pub mod table;
pub mod wal;

// Re-export key types for convenience
pub use batch::{BatchOp, WriteBatch};
pub use cache::BlockCache;
pub use config::{Compression, Config, ReadOptions, WriteOptions};
pub use engine::{EngineIterator, EngineSnapshot, KeelEngine};
pub use error::{KeelError, KeelResult};
pub use wal::{RecoveryMode, WalReader, WalWriter};
