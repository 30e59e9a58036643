//! Error taxonomy for the fix orchestration engine.
//!
//! [`FixError`] covers failures of a single fix. They are recoverable: the
//! engine absorbs them into the audit log and the final report.
//! [`EngineError`] covers phase-level and fatal errors, which `run()` surfaces
//! to its caller.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{AgentId, Category, IssueId, ValidationLevel};

/// Recoverable per-fix failures.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FixError {
    #[error("lock on {path:?} not acquired within {waited_ms}ms (held by {holder:?})")]
    LockTimeout {
        path: PathBuf,
        holder: Option<String>,
        waited_ms: u64,
    },

    #[error("agent {agent} did not finish within {timeout_ms}ms")]
    AgentTimeout { agent: AgentId, timeout_ms: u64 },

    #[error("{level} validation failed: {detail}")]
    ValidationFailure {
        level: ValidationLevel,
        detail: String,
    },

    #[error("no registered agent can fix category {category}")]
    NoCapableAgent { category: Category },

    #[error("agent reported failure: {diagnostic}")]
    AgentReported { diagnostic: String },

    #[error("agent touched files outside its lock set: {paths:?}")]
    UndeclaredFiles { paths: Vec<PathBuf> },

    #[error("backup failed: {detail}")]
    Backup { detail: String },

    #[error("dependency {dependency} was excluded")]
    DependencyExcluded { dependency: IssueId },
}

impl FixError {
    /// Failures that count towards agent-level escalation.
    pub fn is_validation_failure(&self) -> bool {
        matches!(self, Self::ValidationFailure { .. })
    }
}

/// Phase-level and fatal engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("dependency cycle detected involving issues: {issues:?}")]
    Cycle { issues: Vec<IssueId> },

    #[error("issue {issue} depends on unknown issue {dependency}")]
    UnknownDependency { issue: IssueId, dependency: IssueId },

    #[error("duplicate issue id in catalog: {issue}")]
    DuplicateIssue { issue: IssueId },

    #[error("unknown issue: {issue}")]
    UnknownIssue { issue: IssueId },

    #[error("issue {issue} declares {path:?}: {reason}")]
    InvalidPath {
        issue: IssueId,
        path: PathBuf,
        reason: &'static str,
    },

    #[error("no phase targets category {category} of issue {issue}")]
    NoPhaseForCategory { issue: IssueId, category: Category },

    #[error("issue {issue} depends on {dependency}, which is scheduled in a later phase")]
    DependencyOrder { issue: IssueId, dependency: IssueId },

    #[error("no issues submitted; call submit_issues first")]
    NotSubmitted,

    #[error("issues were already submitted to this engine")]
    AlreadySubmitted,

    #[error("phase {phase} rolled back: {reason}")]
    PhaseRolledBack { phase: String, reason: String },

    #[error("phase {phase} blocked by unresolved issues: {unresolved:?}")]
    PhaseBlocked {
        phase: String,
        unresolved: Vec<IssueId>,
    },

    #[error("rollback of {scope} failed: {detail}")]
    RollbackFailure { scope: String, detail: String },

    #[error("engine halted: {reason}")]
    Halted { reason: String },

    #[error("engine cannot be resumed: {reason}")]
    NotResumable { reason: String },

    #[error("invalid resume directive: {detail}")]
    InvalidResume { detail: String },

    #[error("invalid {subject} transition: {from} -> {to}")]
    InvalidTransition {
        subject: String,
        from: String,
        to: String,
    },

    #[error("agent registry error: {0}")]
    Registry(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("storage error: {0}")]
    Storage(#[from] mender_state::StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Errors after which `run()` may be called again following a resume.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::PhaseRolledBack { .. } | Self::PhaseBlocked { .. })
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
