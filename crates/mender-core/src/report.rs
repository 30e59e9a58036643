//! Fix execution report and its on-disk artifact.
//!
//! A [`FixExecutionReport`] is built from the derived state view: per-issue
//! terminal status, phase, timestamps and validation outcomes, plus the full
//! rollback log. Rendering it for humans is left to the caller.
//!
//! Reports are written to `<dir>/<run_id>/report.json` with a companion
//! `<dir>/<run_id>/report.digest` holding the SHA-256 of the canonical JSON.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use mender_state::ContentDigest;
use serde::{Deserialize, Serialize};

use crate::domain::{
    AgentId, Category, IssueId, IssueStatus, PhaseSpec, PhaseStatus, RollbackEvent, Severity,
    ValidationResult, ValidationScope,
};
use crate::error::{EngineError, EngineResult, FixError};
use crate::state::StateView;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    NotStarted,
    /// Started or resumed, not yet finished.
    InProgress,
    /// Every phase reached Completed.
    Completed,
    Halted { reason: String, resumable: bool },
    /// A complete rollback undid the run.
    RolledBack { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub name: String,
    pub ordinal: u32,
    pub status: PhaseStatus,
    pub issues: Vec<IssueId>,
    /// Batch and phase-level results.
    pub validation: Vec<ValidationResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueReport {
    pub id: IssueId,
    pub category: Category,
    pub severity: Severity,
    pub phase: String,
    pub status: IssueStatus,
    pub attempts: u32,
    pub agent: Option<AgentId>,
    pub excluded: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub validation: Vec<ValidationResult>,
    pub failure: Option<FixError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub fixed: usize,
    pub failed: usize,
    pub rolled_back: usize,
    pub pending: usize,
    pub excluded: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixExecutionReport {
    pub run_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,
    pub summary: ReportSummary,
    pub phases: Vec<PhaseReport>,
    pub issues: Vec<IssueReport>,
    pub rollbacks: Vec<RollbackEvent>,
}

impl FixExecutionReport {
    pub fn build(
        run_id: &str,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
        outcome: RunOutcome,
        phases: &[PhaseSpec],
        view: &StateView,
    ) -> Self {
        let issues: Vec<IssueReport> = view
            .issues
            .values()
            .map(|v| IssueReport {
                id: v.issue.id.clone(),
                category: v.issue.category.clone(),
                severity: v.issue.severity,
                phase: v.phase.clone(),
                status: v.status,
                attempts: v.attempt,
                agent: v.agent.clone(),
                excluded: v.excluded,
                started_at: v.started_at(),
                finished_at: v.finished_at(),
                validation: v.validation.clone(),
                failure: v.failure.clone(),
            })
            .collect();

        let phases = phases
            .iter()
            .map(|p| PhaseReport {
                name: p.name.clone(),
                ordinal: p.ordinal,
                status: view.phase_status(&p.name),
                issues: issues
                    .iter()
                    .filter(|i| i.phase == p.name)
                    .map(|i| i.id.clone())
                    .collect(),
                validation: view
                    .validations
                    .iter()
                    .filter(|r| match &r.scope {
                        ValidationScope::Batch { phase, .. } | ValidationScope::Phase { phase, .. } => {
                            phase == &p.name
                        }
                        ValidationScope::Fix { .. } => false,
                    })
                    .cloned()
                    .collect(),
            })
            .collect();

        let mut summary = ReportSummary {
            total: issues.len(),
            ..ReportSummary::default()
        };
        for issue in &issues {
            match issue.status {
                IssueStatus::Fixed => summary.fixed += 1,
                IssueStatus::Failed => summary.failed += 1,
                IssueStatus::RolledBack => summary.rolled_back += 1,
                IssueStatus::Pending | IssueStatus::InProgress => summary.pending += 1,
            }
            if issue.excluded {
                summary.excluded += 1;
            }
        }

        Self {
            run_id: run_id.to_string(),
            started_at,
            finished_at,
            outcome,
            summary,
            phases,
            issues,
            rollbacks: view.rollbacks.clone(),
        }
    }

    pub fn issue(&self, id: &IssueId) -> Option<&IssueReport> {
        self.issues.iter().find(|i| &i.id == id)
    }

    /// SHA-256 of the compact JSON encoding.
    pub fn digest(&self) -> EngineResult<ContentDigest> {
        Ok(ContentDigest::from_bytes(&serde_json::to_vec(self)?))
    }
}

/// Write `report` to `<dir>/<run_id>/report.json` plus `report.digest`.
///
/// Returns the path to `report.json`.
pub fn write_report(report: &FixExecutionReport, dir: &Path) -> EngineResult<PathBuf> {
    let run_dir = dir.join(&report.run_id);
    std::fs::create_dir_all(&run_dir)?;

    let report_path = run_dir.join("report.json");
    std::fs::write(&report_path, serde_json::to_vec_pretty(report)?)?;
    std::fs::write(run_dir.join("report.digest"), report.digest()?.as_str())?;
    Ok(report_path)
}

/// Read `<dir>/<run_id>/report.json` and verify it against `report.digest`.
pub fn read_report(run_id: &str, dir: &Path) -> EngineResult<FixExecutionReport> {
    let run_dir = dir.join(run_id);
    let report: FixExecutionReport = serde_json::from_slice(&std::fs::read(run_dir.join("report.json"))?)?;
    let expected = std::fs::read_to_string(run_dir.join("report.digest"))?
        .trim()
        .to_string();

    let actual = report.digest()?;
    if actual.as_str() != expected {
        return Err(EngineError::DigestMismatch {
            expected,
            actual: actual.to_string(),
        });
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Issue;
    use crate::state::SharedState;
    use tempfile::tempdir;

    async fn sample() -> FixExecutionReport {
        let state = SharedState::new();
        state
            .submit(Issue::new("A", "a11y", Severity::High).with_file("f1"), "quality")
            .await
            .unwrap();
        state
            .submit(Issue::new("B", "a11y", Severity::Low), "quality")
            .await
            .unwrap();
        state.exclude(&IssueId::from("B"), "operator").await.unwrap();
        let phases = vec![PhaseSpec::new("quality", 0, ["a11y"])];
        FixExecutionReport::build(
            "run-1",
            Some(Utc::now()),
            None,
            RunOutcome::NotStarted,
            &phases,
            &state.snapshot().await,
        )
    }

    #[tokio::test]
    async fn test_build_summarises_view() {
        let report = sample().await;
        assert_eq!(report.summary.total, 2);
        assert_eq!(report.summary.pending, 2);
        assert_eq!(report.summary.excluded, 1);
        assert_eq!(report.phases[0].issues.len(), 2);
        assert_eq!(report.phases[0].status, PhaseStatus::NotStarted);
        assert!(report.issue(&IssueId::from("B")).unwrap().excluded);
    }

    #[tokio::test]
    async fn test_write_then_read_verifies_digest() {
        let dir = tempdir().unwrap();
        let report = sample().await;
        let path = write_report(&report, dir.path()).unwrap();
        assert!(path.ends_with("run-1/report.json"));

        let loaded = read_report("run-1", dir.path()).unwrap();
        assert_eq!(loaded, report);
    }

    #[tokio::test]
    async fn test_tampered_report_is_rejected() {
        let dir = tempdir().unwrap();
        let report = sample().await;
        let path = write_report(&report, dir.path()).unwrap();

        let tampered = std::fs::read_to_string(&path)
            .unwrap()
            .replace("\"excluded\": true", "\"excluded\": false");
        std::fs::write(&path, tampered).unwrap();

        assert!(matches!(
            read_report("run-1", dir.path()),
            Err(EngineError::DigestMismatch { .. })
        ));
    }
}
