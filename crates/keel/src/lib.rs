//! Keel: safe client for the Keel embedded key-value engine
//!
//! The engine lives in `keel-core` and is reached only through its C-style
//! handle interface. This crate owns those handles: every engine object is
//! released exactly once, in an order that keeps borrowed views valid.
//!
//! # Ownership
//!
//! - [`Database`] owns its store handle and the [`Options`] it was opened with
//! - [`Snapshot`] and [`DbIterator`] borrow the database they came from
//! - [`Cache`] is shared; options and databases holding it keep it alive
//!
//! Closing a database while views are still alive is allowed; the views then
//! report [`Error::Disposed`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use keel::{Database, Options, WriteBatch};
//!
//! # fn main() -> keel::Result<()> {
//! let mut options = Options::new();
//! options.set_create_if_missing(true);
//! let db = Database::open(Some(Arc::new(options)), "/tmp/keel-demo")?;
//!
//! let mut batch = WriteBatch::new();
//! batch.put(b"key1", b"value1").put(b"key2", b"value2");
//! db.write(&batch)?;
//!
//! for (key, value) in db.iter()? {
//!     println!("{:?} = {:?}", key, value);
//! }
//! # Ok(())
//! # }
//! ```

mod batch;
mod cache;
mod db;
mod error;
mod ffi;
mod handle;
mod iterator;
mod options;
mod snapshot;

pub use batch::WriteBatch;
pub use cache::Cache;
pub use db::Database;
pub use error::{Error, Result};
pub use iterator::DbIterator;
pub use options::{Compression, Options, ReadOptions, WriteOptions};
pub use snapshot::Snapshot;

/// Engine version as `(major, minor)`.
pub fn version() -> (i32, i32) {
    (keel_core::capi::keel_major_version(), keel_core::capi::keel_minor_version())
}
