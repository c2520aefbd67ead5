//! Client error type.
//!
//! Engine failures arrive as message strings through the C interface; they
//! are carried verbatim in the variant for the operation that produced them.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The caller passed an argument the engine cannot accept.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// The engine refused to open the store.
    #[error("open failed: {0}")]
    Open(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("read failed: {0}")]
    Read(String),

    /// Repair or destroy failed.
    #[error("maintenance failed: {0}")]
    Maintenance(String),

    /// The resource was already released; names what kind it was.
    #[error("{0} has been disposed")]
    Disposed(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
