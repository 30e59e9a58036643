//! Rollback levels, scopes and events.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use mender_state::ContentDigest;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::agent::AgentId;
use super::issue::IssueId;

/// Rollback granularity, finest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackLevel {
    Fix,
    Agent,
    Phase,
    Complete,
}

impl RollbackLevel {
    /// Phase and complete rollbacks stop the engine until it is resumed.
    pub fn halts_engine(&self) -> bool {
        matches!(self, Self::Phase | Self::Complete)
    }
}

impl fmt::Display for RollbackLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fix => "fix",
            Self::Agent => "agent",
            Self::Phase => "phase",
            Self::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// The slice of work a rollback applies to.
///
/// Scopes are the idempotency key: a scope that was rolled back once is never
/// rolled back again. `attempt` and `round` keep retries distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RollbackScope {
    Fix { issue: IssueId, attempt: u32 },
    Agent { agent: AgentId, phase: String },
    Phase { phase: String, round: u32 },
    Complete,
}

impl RollbackScope {
    pub fn level(&self) -> RollbackLevel {
        match self {
            Self::Fix { .. } => RollbackLevel::Fix,
            Self::Agent { .. } => RollbackLevel::Agent,
            Self::Phase { .. } => RollbackLevel::Phase,
            Self::Complete => RollbackLevel::Complete,
        }
    }
}

impl fmt::Display for RollbackScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fix { issue, attempt } => write!(f, "fix:{issue}#{attempt}"),
            Self::Agent { agent, phase } => write!(f, "agent:{agent}@{phase}"),
            Self::Phase { phase, round } => write!(f, "phase:{phase}#{round}"),
            Self::Complete => f.write_str("complete"),
        }
    }
}

/// One backup written back to the work tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoredBackup {
    pub backup_id: u64,
    pub issue: IssueId,
    pub path: PathBuf,
    /// `None` when the file did not exist before the fix and was removed.
    pub content: Option<ContentDigest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackEvent {
    pub id: Uuid,
    pub level: RollbackLevel,
    pub scope: RollbackScope,
    pub reason: String,
    /// Issues whose status moved to RolledBack.
    pub issues: Vec<IssueId>,
    /// Restored backups, most recent first.
    pub restored: Vec<RestoredBackup>,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_coarse_levels_halt() {
        assert!(!RollbackLevel::Fix.halts_engine());
        assert!(!RollbackLevel::Agent.halts_engine());
        assert!(RollbackLevel::Phase.halts_engine());
        assert!(RollbackLevel::Complete.halts_engine());
    }

    #[test]
    fn test_scope_level_and_display() {
        let scope = RollbackScope::Fix {
            issue: IssueId::from("C"),
            attempt: 2,
        };
        assert_eq!(scope.level(), RollbackLevel::Fix);
        assert_eq!(scope.to_string(), "fix:C#2");
        assert_eq!(RollbackScope::Complete.level(), RollbackLevel::Complete);
    }
}
