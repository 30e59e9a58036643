//! Validation levels, requirements and results.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::agent::AgentId;
use super::issue::IssueId;

/// Validation levels in escalating strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Syntax,
    Build,
    Runtime,
    Integration,
    Regression,
}

impl ValidationLevel {
    pub const ALL: [ValidationLevel; 5] = [
        Self::Syntax,
        Self::Build,
        Self::Runtime,
        Self::Integration,
        Self::Regression,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Build => "build",
            Self::Runtime => "runtime",
            Self::Integration => "integration",
            Self::Regression => "regression",
        }
    }
}

impl fmt::Display for ValidationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where in the run a validation is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStage {
    /// After each fix.
    Fix,
    /// After an agent's batch within a phase.
    Batch,
    /// After every issue of a phase is terminal.
    Phase,
}

impl ValidationStage {
    /// Levels run at this stage, in escalating order.
    pub fn levels(&self) -> &'static [ValidationLevel] {
        match self {
            Self::Fix => &[ValidationLevel::Syntax, ValidationLevel::Build],
            Self::Batch => &[ValidationLevel::Runtime],
            Self::Phase => &[ValidationLevel::Integration, ValidationLevel::Regression],
        }
    }
}

/// Whether a failing level blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    MustPass,
    ShouldPass,
}

/// What a validation run is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationScope {
    Fix {
        issue: IssueId,
        attempt: u32,
        files: Vec<PathBuf>,
    },
    Batch {
        agent: AgentId,
        phase: String,
        issues: Vec<IssueId>,
    },
    Phase {
        phase: String,
        issues: Vec<IssueId>,
    },
}

impl ValidationScope {
    pub fn label(&self) -> String {
        match self {
            Self::Fix { issue, attempt, .. } => format!("fix:{issue}#{attempt}"),
            Self::Batch { agent, phase, .. } => format!("batch:{agent}@{phase}"),
            Self::Phase { phase, .. } => format!("phase:{phase}"),
        }
    }
}

/// Outcome of one level run against one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub level: ValidationLevel,
    pub scope: ValidationScope,
    pub requirement: Requirement,
    pub passed: bool,
    pub detail: String,
    pub duration_ms: u64,
    pub checked_at: DateTime<Utc>,
}

impl ValidationResult {
    /// A failed must-pass level.
    pub fn is_blocking(&self) -> bool {
        !self.passed && self.requirement == Requirement::MustPass
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_levels_escalate() {
        let all: Vec<ValidationLevel> = [
            ValidationStage::Fix,
            ValidationStage::Batch,
            ValidationStage::Phase,
        ]
        .iter()
        .flat_map(|s| s.levels().iter().copied())
        .collect();
        assert_eq!(all, ValidationLevel::ALL.to_vec());
    }

    #[test]
    fn test_should_pass_failure_is_not_blocking() {
        let result = ValidationResult {
            level: ValidationLevel::Regression,
            scope: ValidationScope::Phase {
                phase: "p1".into(),
                issues: vec![],
            },
            requirement: Requirement::ShouldPass,
            passed: false,
            detail: "2 snapshots changed".into(),
            duration_ms: 4,
            checked_at: Utc::now(),
        };
        assert!(!result.is_blocking());
    }
}
