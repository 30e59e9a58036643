//! Pre-fix file snapshots.
//!
//! Contents are stored whole in a [`CasStore`]; this module only keeps the
//! metadata linking a snapshot to the attempt that took it. A file that did
//! not exist is recorded as absent, and restoring that backup removes it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use mender_state::{CasStore, ContentDigest, StorageError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{AgentId, IssueId, RestoredBackup};
use crate::error::EngineResult;
use crate::worktree::WorkTree;

/// Attempt a backup belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupOwner {
    pub issue: IssueId,
    pub attempt: u32,
    pub agent: AgentId,
    pub phase: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    /// Monotonic; a higher id was taken later.
    pub id: u64,
    pub issue: IssueId,
    pub attempt: u32,
    pub agent: AgentId,
    pub phase: String,
    pub path: PathBuf,
    pub content: Option<ContentDigest>,
    pub taken_at: DateTime<Utc>,
}

pub struct BackupStore {
    cas: Arc<dyn CasStore>,
    records: Mutex<BTreeMap<u64, Backup>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for BackupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupStore")
            .field("backups", &self.len())
            .finish_non_exhaustive()
    }
}

impl BackupStore {
    pub fn new(cas: Arc<dyn CasStore>) -> Self {
        Self {
            cas,
            records: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<u64, Backup>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot every path before `owner`'s agent touches it.
    pub async fn snapshot(
        &self,
        worktree: &dyn WorkTree,
        owner: &BackupOwner,
        paths: impl IntoIterator<Item = &Path>,
    ) -> EngineResult<Vec<Backup>> {
        let mut taken = Vec::new();
        for path in paths {
            let content = match worktree.read(path).await? {
                Some(data) => Some(self.cas.put(&data).await?),
                None => None,
            };
            let backup = Backup {
                id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
                issue: owner.issue.clone(),
                attempt: owner.attempt,
                agent: owner.agent.clone(),
                phase: owner.phase.clone(),
                path: path.to_path_buf(),
                content,
                taken_at: Utc::now(),
            };
            debug!(
                backup = backup.id,
                issue = %backup.issue,
                path = %backup.path.display(),
                absent = backup.content.is_none(),
                "backup taken"
            );
            self.records().insert(backup.id, backup.clone());
            taken.push(backup);
        }
        Ok(taken)
    }

    /// Write a backup's content back to the tree.
    pub async fn restore(&self, worktree: &dyn WorkTree, backup: &Backup) -> EngineResult<RestoredBackup> {
        match &backup.content {
            Some(digest) => {
                let data = self.cas.get(digest).await?;
                worktree.write(&backup.path, &data).await?;
            }
            None => worktree.remove(&backup.path).await?,
        }
        Ok(RestoredBackup {
            backup_id: backup.id,
            issue: backup.issue.clone(),
            path: backup.path.clone(),
            content: backup.content.clone(),
        })
    }

    pub fn get(&self, id: u64) -> Option<Backup> {
        self.records().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Backup> {
        self.records().values().cloned().collect()
    }

    pub fn for_attempt(&self, issue: &IssueId, attempt: u32) -> Vec<Backup> {
        self.filter(|b| &b.issue == issue && b.attempt == attempt)
    }

    pub fn for_phase(&self, phase: &str) -> Vec<Backup> {
        self.filter(|b| b.phase == phase)
    }

    pub fn for_agent(&self, agent: &AgentId, phase: &str) -> Vec<Backup> {
        self.filter(|b| &b.agent == agent && b.phase == phase)
    }

    /// Backups taken after `after` on any of `paths`.
    pub fn touching_after(&self, paths: &BTreeSet<PathBuf>, after: u64) -> Vec<Backup> {
        self.filter(|b| b.id > after && paths.contains(&b.path))
    }

    fn filter(&self, pred: impl Fn(&Backup) -> bool) -> Vec<Backup> {
        self.records().values().filter(|b| pred(b)).cloned().collect()
    }

    /// Forget backups and delete blobs nothing references any more.
    pub async fn release(&self, ids: &[u64]) -> EngineResult<usize> {
        let orphaned: Vec<ContentDigest> = {
            let mut records = self.records();
            let removed: Vec<Backup> = ids.iter().filter_map(|id| records.remove(id)).collect();
            let live: BTreeSet<&ContentDigest> =
                records.values().filter_map(|b| b.content.as_ref()).collect();
            let orphaned: BTreeSet<ContentDigest> = removed
                .iter()
                .filter_map(|b| b.content.clone())
                .filter(|d| !live.contains(d))
                .collect();
            orphaned.into_iter().collect()
        };

        for digest in &orphaned {
            match self.cas.delete(digest).await {
                Ok(()) | Err(StorageError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(orphaned.len())
    }

    /// Drop every backup of a validated phase.
    pub async fn evict_phase(&self, phase: &str) -> EngineResult<usize> {
        let ids: Vec<u64> = self.for_phase(phase).iter().map(|b| b.id).collect();
        self.release(&ids).await?;
        Ok(ids.len())
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
