//! Shared engine state: an append-only audit log and the view derived from it.
//!
//! Every mutation is an [`AuditEvent`] appended to the log. The current view
//! is folded from the log on each append, under the same write lock, so
//! readers never observe a view that disagrees with the log. Events that
//! would make an illegal status transition are rejected before anything is
//! appended. [`SharedState::replay`] rebuilds the view from log entries alone.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mender_state::{Journal, JournalEntry};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{
    AgentId, FixRecord, Issue, IssueId, IssueStatus, PhaseStatus, RollbackEvent, ValidationResult,
    ValidationScope,
};
use crate::error::{EngineError, EngineResult, FixError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    IssueSubmitted {
        issue: Issue,
        phase: String,
    },
    IssueClaimed {
        issue: IssueId,
        attempt: u32,
        agent: AgentId,
    },
    FixRecorded {
        record: FixRecord,
    },
    FixFailed {
        issue: IssueId,
        attempt: u32,
        agent: Option<AgentId>,
        error: FixError,
        #[serde(default)]
        validation: Vec<ValidationResult>,
    },
    IssueRolledBack {
        issue: IssueId,
        attempt: u32,
        rollback: Uuid,
    },
    IssueRequeued {
        issue: IssueId,
        attempt: u32,
    },
    IssueExcluded {
        issue: IssueId,
        reason: String,
    },
    PhaseTransition {
        phase: String,
        from: PhaseStatus,
        to: PhaseStatus,
    },
    ValidationRecorded {
        result: ValidationResult,
    },
    RollbackRecorded {
        event: RollbackEvent,
    },
    Artifact {
        key: String,
        value: serde_json::Value,
    },
    EngineHalted {
        reason: String,
    },
    EngineResumed {
        directive: String,
    },
}

impl AuditEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IssueSubmitted { .. } => "issue_submitted",
            Self::IssueClaimed { .. } => "issue_claimed",
            Self::FixRecorded { .. } => "fix_recorded",
            Self::FixFailed { .. } => "fix_failed",
            Self::IssueRolledBack { .. } => "issue_rolled_back",
            Self::IssueRequeued { .. } => "issue_requeued",
            Self::IssueExcluded { .. } => "issue_excluded",
            Self::PhaseTransition { .. } => "phase_transition",
            Self::ValidationRecorded { .. } => "validation_recorded",
            Self::RollbackRecorded { .. } => "rollback_recorded",
            Self::Artifact { .. } => "artifact",
            Self::EngineHalted { .. } => "engine_halted",
            Self::EngineResumed { .. } => "engine_resumed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub event: AuditEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub attempt: u32,
    pub status: IssueStatus,
    /// Audit log position of the change.
    pub seq: u64,
    pub at: DateTime<Utc>,
}

/// Derived per-issue state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueView {
    pub issue: Issue,
    pub phase: String,
    pub status: IssueStatus,
    pub attempt: u32,
    pub agent: Option<AgentId>,
    pub excluded: bool,
    pub failure: Option<FixError>,
    pub record: Option<FixRecord>,
    pub validation: Vec<ValidationResult>,
    pub history: Vec<StatusChange>,
}

impl IssueView {
    /// Neither Fixed nor excluded.
    pub fn is_unresolved(&self) -> bool {
        self.status != IssueStatus::Fixed && !self.excluded
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.history
            .iter()
            .find(|c| c.status == IssueStatus::InProgress)
            .map(|c| c.at)
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.history
            .last()
            .filter(|c| c.status.is_terminal())
            .map(|c| c.at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentFailure {
    pub issue: IssueId,
    pub attempt: u32,
    pub error: FixError,
}

/// Everything one agent did, in log order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResults {
    pub fixes: Vec<FixRecord>,
    pub failures: Vec<AgentFailure>,
    pub rolled_back: Vec<IssueId>,
}

/// The current state, derived from the audit log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateView {
    pub issues: BTreeMap<IssueId, IssueView>,
    pub phases: BTreeMap<String, PhaseStatus>,
    pub agents: BTreeMap<AgentId, AgentResults>,
    pub artifacts: BTreeMap<String, serde_json::Value>,
    /// Batch and phase validations; fix validations live on the issue.
    pub validations: Vec<ValidationResult>,
    pub rollbacks: Vec<RollbackEvent>,
    pub halted: Option<String>,
}

fn invalid(subject: impl Into<String>, from: impl ToString, to: impl ToString) -> EngineError {
    EngineError::InvalidTransition {
        subject: subject.into(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

impl StateView {
    pub fn phase_status(&self, phase: &str) -> PhaseStatus {
        self.phases.get(phase).copied().unwrap_or(PhaseStatus::NotStarted)
    }

    fn issue_mut(&mut self, id: &IssueId) -> EngineResult<&mut IssueView> {
        self.issues
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownIssue { issue: id.clone() })
    }

    fn check_issue(&self, id: &IssueId, attempt: u32, next: IssueStatus) -> EngineResult<&IssueView> {
        let view = self
            .issues
            .get(id)
            .ok_or_else(|| EngineError::UnknownIssue { issue: id.clone() })?;
        if view.attempt != attempt || !view.status.can_transition_to(next) {
            return Err(invalid(
                format!("issue {id}"),
                format!("{}#{}", view.status, view.attempt),
                format!("{next}#{attempt}"),
            ));
        }
        Ok(view)
    }

    fn set_status(&mut self, id: &IssueId, status: IssueStatus, seq: u64, at: DateTime<Utc>) -> EngineResult<()> {
        let view = self.issue_mut(id)?;
        view.status = status;
        view.history.push(StatusChange {
            attempt: view.attempt,
            status,
            seq,
            at,
        });
        Ok(())
    }

    /// Validate then apply one entry. Nothing is mutated on error.
    fn apply(&mut self, entry: &AuditEntry) -> EngineResult<()> {
        let (seq, at) = (entry.seq, entry.at);
        match &entry.event {
            AuditEvent::IssueSubmitted { issue, phase } => {
                if self.issues.contains_key(&issue.id) {
                    return Err(EngineError::DuplicateIssue {
                        issue: issue.id.clone(),
                    });
                }
                self.issues.insert(
                    issue.id.clone(),
                    IssueView {
                        issue: issue.clone(),
                        phase: phase.clone(),
                        status: IssueStatus::Pending,
                        attempt: 1,
                        agent: None,
                        excluded: false,
                        failure: None,
                        record: None,
                        validation: Vec::new(),
                        history: vec![StatusChange {
                            attempt: 1,
                            status: IssueStatus::Pending,
                            seq,
                            at,
                        }],
                    },
                );
            }
            AuditEvent::IssueClaimed { issue, attempt, agent } => {
                self.check_issue(issue, *attempt, IssueStatus::InProgress)?;
                self.set_status(issue, IssueStatus::InProgress, seq, at)?;
                self.issue_mut(issue)?.agent = Some(agent.clone());
            }
            AuditEvent::FixRecorded { record } => {
                let view = self.check_issue(&record.issue, record.attempt, IssueStatus::Fixed)?;
                if view.agent.as_ref() != Some(&record.agent) {
                    return Err(invalid(
                        format!("issue {} owner", record.issue),
                        view.agent.as_ref().map_or("none".to_string(), ToString::to_string),
                        &record.agent,
                    ));
                }
                self.set_status(&record.issue, IssueStatus::Fixed, seq, at)?;
                let view = self.issue_mut(&record.issue)?;
                view.failure = None;
                view.record = Some(record.clone());
                view.validation.extend(record.validation.iter().cloned());
                self.agents
                    .entry(record.agent.clone())
                    .or_default()
                    .fixes
                    .push(record.clone());
            }
            AuditEvent::FixFailed {
                issue,
                attempt,
                agent,
                error,
                validation,
            } => {
                self.check_issue(issue, *attempt, IssueStatus::Failed)?;
                self.set_status(issue, IssueStatus::Failed, seq, at)?;
                let view = self.issue_mut(issue)?;
                view.failure = Some(error.clone());
                view.validation.extend(validation.iter().cloned());
                if let Some(agent) = agent {
                    self.agents
                        .entry(agent.clone())
                        .or_default()
                        .failures
                        .push(AgentFailure {
                            issue: issue.clone(),
                            attempt: *attempt,
                            error: error.clone(),
                        });
                }
            }
            AuditEvent::IssueRolledBack { issue, attempt, .. } => {
                let agent = self
                    .check_issue(issue, *attempt, IssueStatus::RolledBack)?
                    .agent
                    .clone();
                self.set_status(issue, IssueStatus::RolledBack, seq, at)?;
                if let Some(agent) = agent {
                    self.agents
                        .entry(agent)
                        .or_default()
                        .rolled_back
                        .push(issue.clone());
                }
            }
            AuditEvent::IssueRequeued { issue, attempt } => {
                let view = self
                    .issues
                    .get(issue)
                    .ok_or_else(|| EngineError::UnknownIssue { issue: issue.clone() })?;
                let retryable = matches!(view.status, IssueStatus::Failed | IssueStatus::RolledBack);
                if !retryable || *attempt != view.attempt + 1 || view.excluded {
                    return Err(invalid(
                        format!("issue {issue}"),
                        format!("{}#{}", view.status, view.attempt),
                        format!("pending#{attempt}"),
                    ));
                }
                let view = self.issue_mut(issue)?;
                view.attempt = *attempt;
                view.agent = None;
                view.failure = None;
                view.record = None;
                self.set_status(issue, IssueStatus::Pending, seq, at)?;
            }
            AuditEvent::IssueExcluded { issue, .. } => {
                let view = self
                    .issues
                    .get(issue)
                    .ok_or_else(|| EngineError::UnknownIssue { issue: issue.clone() })?;
                if matches!(view.status, IssueStatus::Fixed | IssueStatus::InProgress) {
                    return Err(invalid(format!("issue {issue}"), view.status, "excluded"));
                }
                self.issue_mut(issue)?.excluded = true;
            }
            AuditEvent::PhaseTransition { phase, from, to } => {
                let current = self.phase_status(phase);
                if current != *from || !from.can_transition_to(*to) {
                    return Err(invalid(format!("phase {phase}"), current, to));
                }
                self.phases.insert(phase.clone(), *to);
            }
            AuditEvent::ValidationRecorded { result } => match &result.scope {
                ValidationScope::Fix { issue, .. } => {
                    self.issue_mut(issue)?.validation.push(result.clone());
                }
                _ => self.validations.push(result.clone()),
            },
            AuditEvent::RollbackRecorded { event } => self.rollbacks.push(event.clone()),
            AuditEvent::Artifact { key, value } => {
                self.artifacts.insert(key.clone(), value.clone());
            }
            AuditEvent::EngineHalted { reason } => self.halted = Some(reason.clone()),
            AuditEvent::EngineResumed { .. } => self.halted = None,
        }
        Ok(())
    }
}

#[derive(Default)]
struct StateInner {
    log: Vec<AuditEntry>,
    view: StateView,
}

/// Concurrency-safe audit log plus derived view.
#[derive(Default)]
pub struct SharedState {
    inner: RwLock<StateInner>,
    journal: Option<Arc<dyn Journal>>,
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState")
            .field("journaled", &self.journal.is_some())
            .finish_non_exhaustive()
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror every appended entry to `journal`.
    pub fn with_journal(journal: Arc<dyn Journal>) -> Self {
        Self {
            inner: RwLock::default(),
            journal: Some(journal),
        }
    }

    /// Append one event. Returns its sequence number.
    pub async fn append(&self, event: AuditEvent) -> EngineResult<u64> {
        let mut inner = self.inner.write().await;
        let entry = AuditEntry {
            seq: inner.log.len() as u64 + 1,
            at: Utc::now(),
            event,
        };
        inner.view.apply(&entry)?;
        debug!(seq = entry.seq, kind = entry.event.kind(), "audit entry appended");
        let seq = entry.seq;
        let mirrored = match &self.journal {
            Some(_) => Some((entry.event.kind(), serde_json::to_value(&entry)?)),
            None => None,
        };
        inner.log.push(entry);

        // The in-memory log is authoritative; a failed mirror write is
        // reported but leaves the log and view consistent.
        if let (Some(journal), Some((kind, payload))) = (&self.journal, mirrored) {
            journal.append(JournalEntry::new(seq, kind, payload)).await?;
        }
        Ok(seq)
    }

    pub async fn submit(&self, issue: Issue, phase: &str) -> EngineResult<u64> {
        self.append(AuditEvent::IssueSubmitted {
            issue,
            phase: phase.to_string(),
        })
        .await
    }

    /// Pending → InProgress for `attempt`, owned by `agent`.
    pub async fn claim(&self, issue: &IssueId, attempt: u32, agent: &AgentId) -> EngineResult<u64> {
        self.append(AuditEvent::IssueClaimed {
            issue: issue.clone(),
            attempt,
            agent: agent.clone(),
        })
        .await
    }

    /// InProgress → Fixed.
    pub async fn record_fix(&self, record: FixRecord) -> EngineResult<u64> {
        self.append(AuditEvent::FixRecorded { record }).await
    }

    /// Pending|InProgress → Failed.
    pub async fn record_failure(
        &self,
        issue: &IssueId,
        attempt: u32,
        agent: Option<&AgentId>,
        error: FixError,
        validation: Vec<ValidationResult>,
    ) -> EngineResult<u64> {
        self.append(AuditEvent::FixFailed {
            issue: issue.clone(),
            attempt,
            agent: agent.cloned(),
            error,
            validation,
        })
        .await
    }

    pub async fn mark_rolled_back(&self, issue: &IssueId, attempt: u32, rollback: Uuid) -> EngineResult<u64> {
        self.append(AuditEvent::IssueRolledBack {
            issue: issue.clone(),
            attempt,
            rollback,
        })
        .await
    }

    /// Open the next attempt. Returns its number.
    pub async fn requeue(&self, issue: &IssueId) -> EngineResult<u32> {
        let attempt = self
            .get_issue(issue)
            .await
            .ok_or_else(|| EngineError::UnknownIssue { issue: issue.clone() })?
            .attempt
            + 1;
        self.append(AuditEvent::IssueRequeued {
            issue: issue.clone(),
            attempt,
        })
        .await?;
        Ok(attempt)
    }

    pub async fn exclude(&self, issue: &IssueId, reason: impl Into<String>) -> EngineResult<u64> {
        self.append(AuditEvent::IssueExcluded {
            issue: issue.clone(),
            reason: reason.into(),
        })
        .await
    }

    pub async fn record_phase(&self, phase: &str, from: PhaseStatus, to: PhaseStatus) -> EngineResult<u64> {
        self.append(AuditEvent::PhaseTransition {
            phase: phase.to_string(),
            from,
            to,
        })
        .await
    }

    pub async fn record_validation(&self, result: ValidationResult) -> EngineResult<u64> {
        self.append(AuditEvent::ValidationRecorded { result }).await
    }

    pub async fn record_rollback(&self, event: RollbackEvent) -> EngineResult<u64> {
        self.append(AuditEvent::RollbackRecorded { event }).await
    }

    pub async fn put_artifact(&self, key: impl Into<String>, value: serde_json::Value) -> EngineResult<u64> {
        self.append(AuditEvent::Artifact {
            key: key.into(),
            value,
        })
        .await
    }

    pub async fn get_issue(&self, id: &IssueId) -> Option<IssueView> {
        self.inner.read().await.view.issues.get(id).cloned()
    }

    pub async fn get_agent_results(&self, agent: &AgentId) -> AgentResults {
        self.inner
            .read()
            .await
            .view
            .agents
            .get(agent)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get_artifact(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.read().await.view.artifacts.get(key).cloned()
    }

    pub async fn phase_status(&self, phase: &str) -> PhaseStatus {
        self.inner.read().await.view.phase_status(phase)
    }

    pub async fn snapshot(&self) -> StateView {
        self.inner.read().await.view.clone()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.inner.read().await.log.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.log.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Fold `entries` into a fresh view.
    pub fn replay<'a>(entries: impl IntoIterator<Item = &'a AuditEntry>) -> EngineResult<StateView> {
        let mut view = StateView::default();
        for entry in entries {
            view.apply(entry)?;
        }
        Ok(view)
    }

    /// Decode audit entries mirrored to a journal.
    pub async fn load_journal(journal: &dyn Journal) -> EngineResult<Vec<AuditEntry>> {
        journal
            .entries()
            .await?
            .into_iter()
            .map(|e| serde_json::from_value(e.payload).map_err(EngineError::from))
            .collect()
    }
}
