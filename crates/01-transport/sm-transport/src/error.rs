//! Error handling helpers for the shared-memory transport primitives.
//!
//! The primitives keep their error surface small: naming limits, mapping and
//! sizing of the shared region, malformed packed headers, and raw OS call
//! failures. The plugin layer folds these into its own return codes.

use std::fmt;
use std::io;

/// Convenience result alias for fallible transport operations.
pub type TransportResult<T, E = TransportError> = Result<T, E>;

#[derive(Debug)]
/// Errors surfaced by low-level transport helpers.
pub enum TransportError {
    /// A generated shm name or socket path exceeds its length limit.
    NameTooLong { name: String, limit: usize },
    /// An existing shared region does not have the expected size.
    RegionSize { expected: usize, actual: usize },
    /// Opening or mapping a named shared region failed.
    Map { name: String, source: io::Error },
    /// A packed 64-bit header carries an unknown type field.
    InvalidHeader { raw: u64 },
    /// A system call failed.
    Os {
        op: &'static str,
        source: io::Error,
    },
}

impl TransportError {
    /// Captures `errno` right after a failed libc call.
    pub(crate) fn last_os_error(op: &'static str) -> Self {
        TransportError::Os {
            op,
            source: io::Error::last_os_error(),
        }
    }

    pub(crate) fn os(op: &'static str, source: io::Error) -> Self {
        TransportError::Os { op, source }
    }

    /// Raw errno carried by the error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            TransportError::Map { source, .. } | TransportError::Os { source, .. } => {
                source.raw_os_error()
            }
            _ => None,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NameTooLong { name, limit } => {
                write!(f, "generated name `{name}` exceeds {limit} bytes")
            }
            TransportError::RegionSize { expected, actual } => {
                write!(
                    f,
                    "shared region is {actual} bytes, expected {expected} bytes"
                )
            }
            TransportError::Map { name, source } => {
                write!(f, "could not map shared region `{name}`: {source}")
            }
            TransportError::InvalidHeader { raw } => {
                write!(f, "invalid packed header {raw:#018x}")
            }
            TransportError::Os { op, source } => write!(f, "{op}() failed: {source}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Map { source, .. } | TransportError::Os { source, .. } => Some(source),
            _ => None,
        }
    }
}
