//! Every storage backend must pass the same contract.

use std::sync::Arc;

use mender_state::storage_traits::*;
use mender_state::{FsCasStore, JsonlJournal, MemoryCasStore, MemoryJournal, StorageError};

async fn cas_contract(store: &dyn CasStore) {
    let data = b"pre-fix contents of src/app.tsx";
    let digest = store.put(data).await.unwrap();
    assert_eq!(digest, ContentDigest::from_bytes(data));
    assert_eq!(store.get(&digest).await.unwrap(), data);
    assert!(store.contains(&digest).await.unwrap());

    let other = store.put(b"different").await.unwrap();
    assert_ne!(digest, other);

    store.delete(&digest).await.unwrap();
    assert!(!store.contains(&digest).await.unwrap());
    let err = store.get(&digest).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));

    store.delete(&digest).await.unwrap();
}

#[tokio::test]
async fn memory_cas_satisfies_contract() {
    cas_contract(&MemoryCasStore::new()).await;
}

#[tokio::test]
async fn fs_cas_satisfies_contract() {
    let dir = tempfile::tempdir().unwrap();
    cas_contract(&FsCasStore::new(dir.path()).unwrap()).await;
}

async fn collect_positions(tasks: Vec<tokio::task::JoinHandle<u64>>) -> Vec<u64> {
    let mut positions = Vec::with_capacity(tasks.len());
    for task in tasks {
        positions.push(task.await.unwrap());
    }
    positions
}

async fn journal_contract(journal: Arc<dyn Journal>) {
    assert!(journal.is_empty().await.unwrap());

    let mut tasks = Vec::new();
    for seq in 0..16u64 {
        let journal = Arc::clone(&journal);
        tasks.push(tokio::spawn(async move {
            journal
                .append(JournalEntry::new(
                    seq,
                    "tick",
                    serde_json::json!({ "seq": seq }),
                ))
                .await
                .unwrap()
        }));
    }
    let mut positions = collect_positions(tasks).await;
    positions.sort_unstable();
    assert_eq!(positions, (0..16).collect::<Vec<u64>>(), "every append gets its own slot");

    let mut seqs: Vec<u64> = journal.entries().await.unwrap().iter().map(|e| e.seq).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, (0..16).collect::<Vec<u64>>());
    assert_eq!(journal.len().await.unwrap(), 16);
}

#[tokio::test]
async fn memory_journal_satisfies_contract() {
    journal_contract(Arc::new(MemoryJournal::new())).await;
}

#[tokio::test]
async fn jsonl_journal_satisfies_contract() {
    let dir = tempfile::tempdir().unwrap();
    let journal = JsonlJournal::open(dir.path().join("audit.jsonl")).unwrap();
    journal_contract(Arc::new(journal)).await;
}

#[tokio::test]
async fn jsonl_journal_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    {
        let journal = JsonlJournal::open(&path).unwrap();
        journal
            .append(JournalEntry::new(0, "first", serde_json::json!({})))
            .await
            .unwrap();
    }
    let reopened = JsonlJournal::open(&path).unwrap();
    reopened
        .append(JournalEntry::new(1, "second", serde_json::json!({})))
        .await
        .unwrap();
    let kinds: Vec<String> = reopened
        .entries()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds, vec!["first", "second"]);
}
