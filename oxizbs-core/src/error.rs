//! Error types for OxiZBS operations.
//!
//! One error enum covers both build-time and load-time failures across the
//! codec and store crates. Decode paths report malformed input as
//! [`Error::Corruption`]; checksum mismatches are kept separate because they
//! are recoverable at file granularity (the caller can re-read the file).

use std::io;
use thiserror::Error;

/// The main error type for OxiZBS operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller passed an out-of-range id, a bad fd, or inconsistent options.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the rejected argument.
        message: String,
    },

    /// A CRC-16C, CRC-32C or XXH64 check failed.
    #[error("checksum mismatch ({kind}): expected {expected:#x}, computed {computed:#x}")]
    BadChecksum {
        /// Which checksum failed ("crc32c", "crc16c", "xxh64", ...).
        kind: &'static str,
        /// Value recorded in the file.
        expected: u64,
        /// Value computed over the data.
        computed: u64,
    },

    /// Structurally malformed data: bad magic, impossible sizes, codes
    /// running past the end of a bit stream, varint overflow.
    #[error("corrupted data at offset {offset}: {message}")]
    Corruption {
        /// Byte offset where the corruption was detected, when known.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// A hard resource cap was hit: dictionary over 2 GiB, every cache page
    /// pinned, allocation failure in a codec.
    #[error("resource exhausted: {message}")]
    ResourceExhausted {
        /// Description of the exhausted resource.
        message: String,
    },

    /// I/O error from the underlying file or mapping.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The store type declined to implement the requested operation.
    #[error("not implemented: {message}")]
    NotImplemented {
        /// Description of the declined operation.
        message: String,
    },
}

/// Result type alias for OxiZBS operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a checksum mismatch error.
    pub fn bad_checksum(kind: &'static str, expected: u64, computed: u64) -> Self {
        Self::BadChecksum {
            kind,
            expected,
            computed,
        }
    }

    /// Create a corruption error.
    pub fn corrupted(offset: u64, message: impl Into<String>) -> Self {
        Self::Corruption {
            offset,
            message: message.into(),
        }
    }

    /// Create a corruption error with no meaningful offset.
    pub fn corrupted_at_unknown(message: impl Into<String>) -> Self {
        Self::Corruption {
            offset: 0,
            message: message.into(),
        }
    }

    /// Create a resource exhaustion error.
    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            message: message.into(),
        }
    }

    /// Create a not-implemented error.
    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::NotImplemented {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::bad_checksum("crc32c", 0x12345678, 0xDEADBEEF);
        assert!(err.to_string().contains("crc32c"));

        let err = Error::corrupted(128, "bad magic");
        assert!(err.to_string().contains("bad magic"));

        let err = Error::not_implemented("per-record compressed bodies");
        assert!(err.to_string().contains("per-record"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
