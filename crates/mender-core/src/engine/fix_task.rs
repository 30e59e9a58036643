//! One fix attempt, from lock acquisition to commit or fix-level rollback.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, instrument, warn};

use crate::agents::RegisteredAgent;
use crate::backup::BackupOwner;
use crate::bus::BusEvent;
use crate::domain::{
    normalize_path, AgentId, Category, FixRecord, Issue, IssueId, RollbackScope, ValidationResult,
    ValidationScope, ValidationStage,
};
use crate::error::{EngineResult, FixError};
use crate::metrics::METRICS;
use crate::obs;
use crate::rollback::FlightGuard;

use super::EngineContext;

#[derive(Debug)]
pub(crate) enum TaskOutcome {
    Fixed,
    Failed(FixError),
    /// Cancelled or suspended before the agent started; the issue is still
    /// Pending on the same attempt.
    Withdrawn,
    Fatal(crate::error::EngineError),
}

#[derive(Debug)]
pub(crate) struct FixTaskReport {
    pub issue: IssueId,
    pub category: Category,
    pub agent: AgentId,
    pub outcome: TaskOutcome,
}

/// Owns everything one attempt needs. The agent slot and in-flight
/// registration are released when the task is dropped.
pub(crate) struct FixTask {
    pub ctx: Arc<EngineContext>,
    pub issue: Issue,
    pub attempt: u32,
    pub agent: RegisteredAgent,
    pub phase: String,
    pub _flight: FlightGuard,
    pub _permit: OwnedSemaphorePermit,
}

/// What the agent did, once it ran.
struct Attempt {
    backups: Vec<u64>,
    validation: Vec<ValidationResult>,
    result: Result<Vec<PathBuf>, FixError>,
}

impl FixTask {
    pub async fn run(self) -> FixTaskReport {
        let outcome = match self.execute().await {
            Ok(outcome) => outcome,
            Err(e) => TaskOutcome::Fatal(e),
        };
        FixTaskReport {
            issue: self.issue.id.clone(),
            category: self.issue.category.clone(),
            agent: self.agent.id().clone(),
            outcome,
        }
    }

    fn scope(&self) -> RollbackScope {
        RollbackScope::Fix {
            issue: self.issue.id.clone(),
            attempt: self.attempt,
        }
    }

    #[instrument(skip(self), fields(issue = %self.issue.id, attempt = self.attempt, agent = %self.agent.id()))]
    async fn execute(&self) -> EngineResult<TaskOutcome> {
        let ctx = &self.ctx;
        let id = &self.issue.id;
        let agent_id = self.agent.id();

        ctx.bus.publish(BusEvent::FixRequested {
            issue: id.clone(),
            agent: agent_id.clone(),
            attempt: self.attempt,
        });

        let mut abort = ctx.abort.subscribe();
        let acquired = tokio::select! {
            biased;
            _ = abort.wait_for(Option::is_some) => {
                debug!("abort requested while waiting for locks");
                return Ok(TaskOutcome::Withdrawn);
            }
            acquired = ctx.locks.acquire(
                id.as_str(),
                self.issue.files.iter().cloned(),
                ctx.settings.lock_timeout(),
            ) => acquired,
        };

        let guard = match acquired {
            Ok(guard) => guard,
            Err(timeout) => {
                let err = FixError::from(timeout);
                warn!(error = %err, "lock wait expired; refusing fix");
                ctx.state
                    .record_failure(id, self.attempt, None, err.clone(), Vec::new())
                    .await?;
                METRICS.inc_fixes_failed();
                ctx.rollback.rollback(self.scope(), &err.to_string()).await?;
                self.publish_completed(false);
                return Ok(TaskOutcome::Failed(err));
            }
        };

        if abort.borrow().is_some() || ctx.rollback.is_suspended(agent_id, &self.phase) {
            debug!("scope suspended before the agent started");
            return Ok(TaskOutcome::Withdrawn);
        }

        ctx.state.claim(id, self.attempt, agent_id).await?;
        obs::emit_fix_claimed(id, agent_id.as_str(), self.attempt);
        METRICS.inc_fixes_attempted();

        let started_at = Utc::now();
        let clock = Instant::now();
        let attempt = self.attempt_fix().await;

        let outcome = match attempt.result {
            Ok(files_modified) => {
                ctx.state
                    .record_fix(FixRecord {
                        issue: id.clone(),
                        attempt: self.attempt,
                        agent: agent_id.clone(),
                        phase: self.phase.clone(),
                        started_at,
                        finished_at: Utc::now(),
                        files_modified,
                        backups: attempt.backups,
                        validation: attempt.validation,
                    })
                    .await?;
                METRICS.inc_fixes_succeeded();
                TaskOutcome::Fixed
            }
            Err(err) => {
                ctx.state
                    .record_failure(id, self.attempt, Some(agent_id), err.clone(), attempt.validation)
                    .await?;
                METRICS.inc_fixes_failed();
                // Locks are still held, so nothing else has touched the files.
                ctx.rollback.rollback(self.scope(), &err.to_string()).await?;
                TaskOutcome::Failed(err)
            }
        };

        guard.release();
        let success = matches!(outcome, TaskOutcome::Fixed);
        self.publish_completed(success);
        obs::emit_fix_finished(id, self.attempt, success, clock.elapsed().as_millis() as u64);
        Ok(outcome)
    }

    /// Back up, run the agent under its timeout, then the fix-level checks.
    async fn attempt_fix(&self) -> Attempt {
        let ctx = &self.ctx;
        let owner = BackupOwner {
            issue: self.issue.id.clone(),
            attempt: self.attempt,
            agent: self.agent.id().clone(),
            phase: self.phase.clone(),
        };
        let mut attempt = Attempt {
            backups: Vec::new(),
            validation: Vec::new(),
            result: Ok(Vec::new()),
        };

        match ctx
            .backups
            .snapshot(ctx.worktree.as_ref(), &owner, self.issue.files.iter().map(PathBuf::as_path))
            .await
        {
            Ok(taken) => attempt.backups = taken.iter().map(|b| b.id).collect(),
            Err(e) => {
                attempt.result = Err(FixError::Backup { detail: e.to_string() });
                return attempt;
            }
        }

        let timeout = ctx.settings.fix_timeout();
        let outcome = match tokio::time::timeout(timeout, self.agent.agent().attempt_fix(&self.issue)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                attempt.result = Err(FixError::AgentTimeout {
                    agent: self.agent.id().clone(),
                    timeout_ms: timeout.as_millis() as u64,
                });
                return attempt;
            }
        };
        if !outcome.success {
            attempt.result = Err(FixError::AgentReported {
                diagnostic: outcome.diagnostic,
            });
            return attempt;
        }

        let touched: BTreeSet<PathBuf> = outcome
            .files_touched
            .into_iter()
            .map(|p| normalize_path(&p).unwrap_or(p))
            .collect();
        let undeclared: Vec<PathBuf> = touched
            .iter()
            .filter(|p| !self.issue.files.contains(*p))
            .cloned()
            .collect();
        if !undeclared.is_empty() {
            attempt.result = Err(FixError::UndeclaredFiles { paths: undeclared });
            return attempt;
        }

        let scope = ValidationScope::Fix {
            issue: self.issue.id.clone(),
            attempt: self.attempt,
            files: self.issue.files.iter().cloned().collect(),
        };
        let verdict = ctx.gate.run_stage(ValidationStage::Fix, &scope).await;
        let blocking = verdict
            .blocking_failure()
            .map(|r| FixError::ValidationFailure {
                level: r.level,
                detail: r.detail.clone(),
            });
        attempt.validation = verdict.results;

        attempt.result = match blocking {
            Some(err) => Err(err),
            None => Ok(touched.into_iter().collect()),
        };
        attempt
    }

    fn publish_completed(&self, success: bool) {
        self.ctx.bus.publish(BusEvent::FixCompleted {
            issue: self.issue.id.clone(),
            agent: self.agent.id().clone(),
            attempt: self.attempt,
            success,
        });
    }
}
