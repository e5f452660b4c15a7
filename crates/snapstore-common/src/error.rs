//! Error types for snapstore
//!
//! This module defines the common error type used throughout the system.

use thiserror::Error;

/// Common result type for snapstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for snapstore
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("snapshot store is full")]
    StoreFull,

    #[error("metadata corrupt: {0}")]
    Corrupt(String),

    // Snapshot registry errors
    #[error("snapshot {0} already exists")]
    SnapshotExists(u32),

    #[error("snapshot {0} not found")]
    SnapshotNotFound(u32),

    #[error("snapshot table is full")]
    SnapshotTableFull,

    // Protocol errors
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("message body too large: {0} bytes")]
    BodyTooLarge(usize),

    #[error("unknown message code: {0}")]
    UnknownMessage(u32),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a corruption error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// A fatal error means the backing store can no longer be trusted
    /// and the server must stop. Everything else is reported to the
    /// offending client and the server keeps running.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Storage(_) | Self::Corrupt(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_fatal() {
        assert!(Error::storage("bad disk").is_fatal());
        assert!(Error::corrupt("bad magic").is_fatal());
        assert!(!Error::StoreFull.is_fatal());
        assert!(!Error::SnapshotExists(3).is_fatal());
        assert!(!Error::protocol("short body").is_fatal());
    }
}
