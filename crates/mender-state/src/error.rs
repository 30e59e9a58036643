//! Error types for mender-state

use thiserror::Error;

/// Errors raised by the storage traits and their backends.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No blob stored under the digest
    #[error("content not found: {digest}")]
    NotFound { digest: String },

    /// A digest string that is not 64 lowercase hex chars
    #[error("invalid content digest: {digest}")]
    InvalidDigest { digest: String },

    /// A journal line that could not be decoded
    #[error("corrupt journal entry at line {line}: {reason}")]
    CorruptJournal { line: usize, reason: String },

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
