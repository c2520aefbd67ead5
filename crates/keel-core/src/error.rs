//! Error types for Keel engine operations
//!
//! Every engine failure is a `KeelError`. The C interface flattens it into a
//! message string with `to_string()`, so the `Display` text is what callers on
//! the other side of the boundary actually see.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// Keel engine error types with enough context to diagnose from the message alone
#[derive(Debug, Clone)]
pub enum KeelError {
    /// I/O operation failed
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// A log record or table entry is damaged beyond the point of a torn tail
    Corruption {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    /// Checksum verification failed
    ChecksumMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
        offset: u64,
    },

    /// Partial record at the end of a file
    TornWrite {
        path: PathBuf,
        expected_size: u32,
        available_bytes: u64,
        offset: u64,
    },

    /// Key or value exceeds the size the record format can carry
    OversizedEntry {
        entry_size: u64,
        max_size: u64,
        component: &'static str,
    },

    /// Magic bytes not found at expected location
    NoMagicFound {
        path: PathBuf,
        offset: u64,
        found_bytes: [u8; 4],
    },

    /// Caller passed something the engine cannot accept
    InvalidArgument(String),

    /// Store does not exist and `create_if_missing` is off
    NotFound(PathBuf),

    /// Store exists and `error_if_exists` is on
    AlreadyExists(PathBuf),

    /// Another handle holds the store's lock file
    Locked {
        path: PathBuf,
        message: String,
    },

    /// The database handle was closed
    Closed,
}

impl fmt::Display for KeelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeelError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "IO error: {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "IO error: {} ({})", message, kind)
                }
            }

            KeelError::Corruption { path, offset, reason } => {
                write!(f, "Corruption: {} at offset {}: {}", path.display(), offset, reason)
            }

            KeelError::ChecksumMismatch { path, expected, actual, offset } => {
                write!(f, "Corruption: checksum mismatch in {} at offset {}: expected 0x{:08x}, got 0x{:08x}",
                       path.display(), offset, expected, actual)
            }

            KeelError::TornWrite { path, expected_size, available_bytes, offset } => {
                write!(f, "Corruption: truncated record in {} at offset {}: expected {} bytes, only {} available",
                       path.display(), offset, expected_size, available_bytes)
            }

            KeelError::OversizedEntry { entry_size, max_size, component } => {
                write!(f, "Invalid argument: {} too large: {} bytes exceeds limit of {} bytes",
                       component, entry_size, max_size)
            }

            KeelError::NoMagicFound { path, offset, found_bytes } => {
                write!(f, "Corruption: bad magic in {} at offset {}: found {:02x}{:02x}{:02x}{:02x}",
                       path.display(), offset, found_bytes[0], found_bytes[1], found_bytes[2], found_bytes[3])
            }

            KeelError::InvalidArgument(reason) => write!(f, "Invalid argument: {}", reason),

            KeelError::NotFound(path) => {
                write!(f, "Invalid argument: {}: does not exist (create_if_missing is false)", path.display())
            }

            KeelError::AlreadyExists(path) => {
                write!(f, "Invalid argument: {}: exists (error_if_exists is true)", path.display())
            }

            KeelError::Locked { path, message } => {
                write!(f, "IO error: lock {}: {}", path.display(), message)
            }

            KeelError::Closed => write!(f, "Invalid argument: database is closed"),
        }
    }
}

impl Error for KeelError {}

/// Convert std::io::Error to KeelError::Io
impl From<std::io::Error> for KeelError {
    fn from(err: std::io::Error) -> Self {
        KeelError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl KeelError {
    /// Wrap an I/O error with the path it happened on.
    pub(crate) fn io_at(path: &std::path::Path, context: &str, err: std::io::Error) -> Self {
        KeelError::Io {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("{}: {}", context, err),
        }
    }

    /// True for every variant that describes damaged on-disk data.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            KeelError::Corruption { .. }
                | KeelError::ChecksumMismatch { .. }
                | KeelError::TornWrite { .. }
                | KeelError::NoMagicFound { .. }
        )
    }
}

/// Result type alias for Keel engine operations
pub type KeelResult<T> = Result<T, KeelError>;
