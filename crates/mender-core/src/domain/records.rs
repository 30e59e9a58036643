//! Fix records and agent outcomes.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::agent::AgentId;
use super::issue::IssueId;
use super::validation::ValidationResult;

/// Written only when an issue reaches Fixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixRecord {
    pub issue: IssueId,
    pub attempt: u32,
    pub agent: AgentId,
    pub phase: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files_modified: Vec<PathBuf>,
    /// Backup ids taken before the agent ran.
    pub backups: Vec<u64>,
    pub validation: Vec<ValidationResult>,
}

/// What an agent reports back from `attempt_fix`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixOutcome {
    pub success: bool,
    pub files_touched: Vec<PathBuf>,
    pub diagnostic: String,
}

impl FixOutcome {
    pub fn success<I, P>(files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            success: true,
            files_touched: files.into_iter().map(Into::into).collect(),
            diagnostic: String::new(),
        }
    }

    pub fn failure(diagnostic: impl Into<String>) -> Self {
        Self {
            success: false,
            files_touched: Vec::new(),
            diagnostic: diagnostic.into(),
        }
    }

    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = diagnostic.into();
        self
    }
}
