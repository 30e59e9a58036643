//! Filesystem backends for the storage traits.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StorageError;
use crate::storage_traits::*;

fn not_found_as(digest: &ContentDigest) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| match e.kind() {
        ErrorKind::NotFound => StorageError::NotFound {
            digest: digest.to_string(),
        },
        _ => StorageError::Io(e),
    }
}

/// Blobs under `<root>/blobs/<2 hex>/<62 hex>`.
pub struct FsCasStore {
    blobs: PathBuf,
}

impl FsCasStore {
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let blobs = root.as_ref().join("blobs");
        fs::create_dir_all(&blobs)?;
        Ok(Self { blobs })
    }

    /// Shard directory and file path for `digest`.
    fn locate(&self, digest: &ContentDigest) -> (PathBuf, PathBuf) {
        let (shard, rest) = digest.as_str().split_at(2);
        let dir = self.blobs.join(shard);
        let file = dir.join(rest);
        (dir, file)
    }
}

#[async_trait]
impl CasStore for FsCasStore {
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest> {
        let digest = ContentDigest::from_bytes(data);
        let (dir, file) = self.locate(&digest);
        if file.is_file() {
            return Ok(digest);
        }

        fs::create_dir_all(&dir)?;
        // Readers never see a partial blob.
        let mut staged = NamedTempFile::new_in(&dir)?;
        staged.write_all(data)?;
        staged.persist(&file).map_err(|e| StorageError::Io(e.error))?;

        debug!(digest = %digest.short(), bytes = data.len(), "blob stored");
        Ok(digest)
    }

    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        let (_, file) = self.locate(digest);
        tokio::fs::read(&file).await.map_err(not_found_as(digest))
    }

    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool> {
        Ok(self.locate(digest).1.is_file())
    }

    async fn delete(&self, digest: &ContentDigest) -> StorageResult<()> {
        let (_, file) = self.locate(digest);
        match tokio::fs::remove_file(&file).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(StorageError::Io(e)),
            _ => Ok(()),
        }
    }
}

/// Append-only journal stored as newline-delimited JSON.
///
/// Appends are serialised through an async mutex so concurrent writers never
/// interleave partial lines.
pub struct JsonlJournal {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlJournal {
    /// Open (or create) the journal file at `path`.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Journal for JsonlJournal {
    async fn append(&self, entry: JournalEntry) -> StorageResult<u64> {
        let _guard = self.write_lock.lock().await;
        let position = self.len().await?;

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(position)
    }

    async fn entries(&self) -> StorageResult<Vec<JournalEntry>> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        raw.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).map_err(|e| StorageError::CorruptJournal {
                    line: idx + 1,
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    async fn len(&self) -> StorageResult<u64> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        Ok(raw.lines().filter(|l| !l.trim().is_empty()).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cas() -> (TempDir, FsCasStore) {
        let dir = tempfile::tempdir().unwrap();
        let cas = FsCasStore::new(dir.path()).unwrap();
        (dir, cas)
    }

    #[tokio::test]
    async fn test_backup_blob_survives_reopen() {
        let (dir, cas) = cas();
        let digest = cas.put(b"export const a = 1;\n").await.unwrap();
        drop(cas);

        let reopened = FsCasStore::new(dir.path()).unwrap();
        assert_eq!(reopened.get(&digest).await.unwrap(), b"export const a = 1;\n");
    }

    #[tokio::test]
    async fn test_identical_files_share_one_blob() {
        let (dir, cas) = cas();
        let first = cas.put(b"<img alt=\"\">").await.unwrap();
        let second = cas.put(b"<img alt=\"\">").await.unwrap();
        assert_eq!(first, second);

        let shard = dir.path().join("blobs").join(&first.as_str()[..2]);
        assert_eq!(std::fs::read_dir(shard).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_released_blob_is_gone() {
        let (_dir, cas) = cas();
        let digest = cas.put(b"old contents").await.unwrap();
        cas.delete(&digest).await.unwrap();
        cas.delete(&digest).await.unwrap();

        assert!(!cas.contains(&digest).await.unwrap());
        assert!(matches!(
            cas.get(&digest).await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_journal_lines_keep_append_order() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JsonlJournal::open(dir.path().join("runs").join("r1").join("audit.jsonl")).unwrap();

        for (seq, kind) in [(1, "issue_submitted"), (2, "issue_claimed"), (3, "fix_recorded")] {
            let pos = journal
                .append(JournalEntry::new(seq, kind, serde_json::json!({ "issue": "A" })))
                .await
                .unwrap();
            assert_eq!(pos, seq - 1);
        }

        let kinds: Vec<String> = journal.entries().await.unwrap().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, ["issue_submitted", "issue_claimed", "fix_recorded"]);
    }

    #[tokio::test]
    async fn test_garbled_journal_line_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        std::fs::write(&path, "{\"seq\":1}\n").unwrap();

        let journal = JsonlJournal::open(&path).unwrap();
        let err = journal.entries().await.unwrap_err();
        assert!(matches!(err, StorageError::CorruptJournal { line: 1, .. }));
    }
}
