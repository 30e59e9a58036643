//! Blob and journal seams the engine persists through.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StorageError;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

const DIGEST_HEX_LEN: usize = 64;

/// Lowercase hex SHA-256 of a blob. Only `from_bytes` and validated parsing
/// build one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Twelve-character prefix for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }

    fn parse(raw: String) -> StorageResult<Self> {
        let valid = raw.len() == DIGEST_HEX_LEN && raw.bytes().all(|b| b.is_ascii_hexdigit());
        if valid {
            Ok(Self(raw.to_ascii_lowercase()))
        } else {
            Err(StorageError::InvalidDigest { digest: raw })
        }
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(raw: String) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

impl From<ContentDigest> for String {
    fn from(digest: ContentDigest) -> Self {
        digest.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Blobs keyed by the digest of their bytes. Storing identical bytes twice
/// yields one blob.
#[async_trait]
pub trait CasStore: Send + Sync {
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest>;

    /// `StorageError::NotFound` when nothing is stored under `digest`.
    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>>;

    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool>;

    /// Deleting a missing blob succeeds.
    async fn delete(&self, digest: &ContentDigest) -> StorageResult<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Producer-assigned, increasing.
    pub seq: u64,
    /// e.g. `fix_recorded`, `rollback_recorded`
    pub kind: String,
    pub payload: serde_json::Value,
    #[serde(rename = "at")]
    pub timestamp: DateTime<Utc>,
}

impl JournalEntry {
    pub fn new(seq: u64, kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            seq,
            kind: kind.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Append-only entry log. `entries` returns append order and nothing
/// appended is ever rewritten.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Append an entry, returning its 0-based position in the journal.
    async fn append(&self, entry: JournalEntry) -> StorageResult<u64>;

    async fn entries(&self) -> StorageResult<Vec<JournalEntry>>;

    async fn len(&self) -> StorageResult<u64>;

    async fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len().await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_deterministic() {
        let a = ContentDigest::from_bytes(b"same bytes");
        let b = ContentDigest::from_bytes(b"same bytes");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_eq!(a.short().len(), 12);
    }

    #[test]
    fn test_digest_rejects_non_hex() {
        let err = ContentDigest::try_from("xyz".to_string()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidDigest { .. }));
    }

    #[test]
    fn test_digest_accepts_uppercase_and_normalises() {
        let d = ContentDigest::from_bytes(b"x");
        let upper = d.as_str().to_ascii_uppercase();
        let parsed = ContentDigest::try_from(upper).unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn test_digest_serde_validates() {
        let d = ContentDigest::from_bytes(b"payload");
        let json = serde_json::to_string(&d).unwrap();
        let back: ContentDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);

        let bad: std::result::Result<ContentDigest, _> = serde_json::from_str("\"nothex\"");
        assert!(bad.is_err());
    }
}
