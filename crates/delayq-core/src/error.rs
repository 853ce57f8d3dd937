//! Error types for delayq engine operations.

use thiserror::Error;

/// A specialized `Result` type for delayq operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while operating the delayed-queue engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The engine has begun shutdown; all mutators reject.
    #[error("engine is exiting")]
    Exiting,

    /// A malformed message, out-of-range length or otherwise bad argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A replica attempted a write at an offset other than the current
    /// write end; the caller must reconcile before retrying.
    #[error("write offset mismatch: expected {expected}, got {got}")]
    WriteOffsetMismatch {
        /// The current write-end virtual offset.
        expected: u64,
        /// The offset the caller attempted to write at.
        got: u64,
    },

    /// A rollback or reset target lies outside the valid log range, or
    /// crosses a file boundary in the restricted rollback entrypoint.
    #[error("invalid offset {offset}: {reason}")]
    InvalidOffset {
        /// The rejected target offset.
        offset: u64,
        /// Why the offset was rejected.
        reason: String,
    },

    /// The requested key is absent from the index store.
    #[error("key not found")]
    KeyNotFound,

    /// The consistency check found errors beyond the tolerated benign class.
    #[error("store corrupt: {0}")]
    Corrupt(String),

    /// Queue-start reconstruction failed on open; the engine is readable but
    /// flagged until a restore from the leader repairs it.
    #[error("queue start could not be reconstructed, restore from leader required")]
    NeedsFix,

    /// A message could not be encoded or decoded.
    #[error("message codec error: {0}")]
    Codec(String),

    /// Store compaction did not finish within its deadline.
    #[error("compaction exceeded deadline of {deadline_ms}ms")]
    CompactTimeout {
        /// The configured deadline in milliseconds.
        deadline_ms: u64,
    },

    /// I/O error from the filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the embedded index store.
    #[error("store error: {0}")]
    Store(String),
}

impl Error {
    /// Creates an invalid-argument error.
    #[must_use]
    pub fn invalid_arg(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Creates an invalid-offset error.
    #[must_use]
    pub fn invalid_offset(offset: u64, reason: impl Into<String>) -> Self {
        Self::InvalidOffset { offset, reason: reason.into() }
    }

    /// Converts any displayable store error into [`Error::Store`].
    #[must_use]
    pub fn store(e: impl std::fmt::Display) -> Self {
        Self::Store(e.to_string())
    }

    /// Returns true if this error reports a missing key.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::WriteOffsetMismatch { expected: 100, got: 150 };
        assert_eq!(err.to_string(), "write offset mismatch: expected 100, got 150");

        let err = Error::invalid_offset(7, "below queue start");
        assert_eq!(err.to_string(), "invalid offset 7: below queue start");
    }

    #[test]
    fn test_not_found_predicate() {
        assert!(Error::KeyNotFound.is_not_found());
        assert!(!Error::Exiting.is_not_found());
    }
}
