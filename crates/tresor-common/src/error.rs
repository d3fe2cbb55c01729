//! Error types for Tresor
//!
//! This module defines the common error types used throughout the system.

use thiserror::Error;

/// Common result type for Tresor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Tresor
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("offset {offset} is beyond the end of the store ({size} bytes)")]
    OutOfBounds { offset: u64, size: u64 },

    #[error("block store is read-only")]
    ReadOnly,

    // Tree errors
    #[error("invalid tree geometry: {0}")]
    InvalidGeometry(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an invalid geometry error
    pub fn invalid_geometry(msg: impl Into<String>) -> Self {
        Self::InvalidGeometry(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Check whether the error originates from the backing store rather
    /// than from a caller mistake
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Storage(_) | Self::OutOfBounds { .. } | Self::ReadOnly
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_io() {
        assert!(Error::storage("boom").is_io());
        assert!(Error::ReadOnly.is_io());
        assert!(Error::OutOfBounds { offset: 1, size: 0 }.is_io());
        assert!(!Error::invalid_geometry("edges").is_io());
        assert!(!Error::Configuration("bad".into()).is_io());
    }

    #[test]
    fn test_error_display() {
        let err = Error::OutOfBounds {
            offset: 8192,
            size: 4096,
        };
        assert_eq!(
            err.to_string(),
            "offset 8192 is beyond the end of the store (4096 bytes)"
        );
    }
}
