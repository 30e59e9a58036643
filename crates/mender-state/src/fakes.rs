//! In-memory `CasStore` and `Journal` for tests and dry runs.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

fn guard<T>(lock: &Mutex<T>) -> StorageResult<MutexGuard<'_, T>> {
    lock.lock().map_err(|_| {
        StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "in-memory store lock poisoned",
        ))
    })
}

#[derive(Debug, Default)]
pub struct MemoryCasStore {
    blobs: Mutex<HashMap<ContentDigest, Vec<u8>>>,
}

impl MemoryCasStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blob_count(&self) -> usize {
        guard(&self.blobs).map(|b| b.len()).unwrap_or_default()
    }
}

#[async_trait]
impl CasStore for MemoryCasStore {
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest> {
        let digest = ContentDigest::from_bytes(data);
        guard(&self.blobs)?
            .entry(digest.clone())
            .or_insert_with(|| data.to_vec());
        Ok(digest)
    }

    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        guard(&self.blobs)?
            .get(digest)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                digest: digest.to_string(),
            })
    }

    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool> {
        Ok(guard(&self.blobs)?.contains_key(digest))
    }

    async fn delete(&self, digest: &ContentDigest) -> StorageResult<()> {
        guard(&self.blobs)?.remove(digest);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryJournal {
    entries: Mutex<Vec<JournalEntry>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn append(&self, entry: JournalEntry) -> StorageResult<u64> {
        let mut entries = guard(&self.entries)?;
        let position = entries.len() as u64;
        entries.push(entry);
        Ok(position)
    }

    async fn entries(&self) -> StorageResult<Vec<JournalEntry>> {
        Ok(guard(&self.entries)?.clone())
    }

    async fn len(&self) -> StorageResult<u64> {
        Ok(guard(&self.entries)?.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_cas_roundtrip_and_delete() {
        let cas = MemoryCasStore::new();
        let digest = cas.put(b"backup body").await.unwrap();
        assert!(cas.contains(&digest).await.unwrap());
        assert_eq!(cas.get(&digest).await.unwrap(), b"backup body");

        cas.delete(&digest).await.unwrap();
        assert!(!cas.contains(&digest).await.unwrap());
        assert!(matches!(
            cas.get(&digest).await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_memory_cas_dedupes() {
        let cas = MemoryCasStore::new();
        let a = cas.put(b"dup").await.unwrap();
        let b = cas.put(b"dup").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(cas.blob_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_journal_preserves_order() {
        let journal = MemoryJournal::new();
        assert!(journal.is_empty().await.unwrap());
        for seq in 0..3 {
            let pos = journal
                .append(JournalEntry::new(seq, "tick", serde_json::json!({ "n": seq })))
                .await
                .unwrap();
            assert_eq!(pos, seq);
        }
        let entries = journal.entries().await.unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(journal.len().await.unwrap(), 3);
    }
}
