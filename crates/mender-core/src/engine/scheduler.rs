//! Phase state machine and dispatch loop.
//!
//! The scheduler is the only writer of phase status. Within a phase it
//! dispatches ready issues to capable agents, settles finished fixes,
//! validates each agent's batch, requeues rolled-back attempts and finally
//! runs phase-level validation. Phases run strictly in ordinal order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::agents::{AgentRegistry, Selection};
use crate::bus::BusEvent;
use crate::config::{BackupRetention, PhaseFailurePolicy};
use crate::domain::{
    AgentId, Category, IssueId, IssueStatus, PhaseSpec, PhaseStatus, RollbackScope, ValidationScope,
    ValidationStage,
};
use crate::error::{EngineError, EngineResult, FixError};
use crate::graph::DependencyGraph;
use crate::metrics::METRICS;
use crate::obs;
use crate::rollback::{Flight, RollbackOutcome};
use crate::state::StateView;

use super::fix_task::{FixTask, FixTaskReport, TaskOutcome};
use super::EngineContext;

pub(crate) struct PhaseScheduler {
    ctx: Arc<EngineContext>,
    registry: AgentRegistry,
    graph: DependencyGraph,
    phases: Vec<PhaseSpec>,
    /// Index of the first phase not yet Completed.
    cursor: usize,
    /// Phase rollback rounds, so a retried phase can be rolled back again.
    rounds: HashMap<String, u32>,
    /// Must-pass validation failures per (agent, category) in the current phase.
    escalation: HashMap<(AgentId, Category), u32>,
    /// (issue, attempt) pairs already covered by a batch validation.
    batch_checked: HashSet<(IssueId, u32)>,
    rolled_back_all: bool,
}

impl PhaseScheduler {
    pub fn new(
        ctx: Arc<EngineContext>,
        registry: AgentRegistry,
        graph: DependencyGraph,
        phases: Vec<PhaseSpec>,
    ) -> Self {
        Self {
            ctx,
            registry,
            graph,
            phases,
            cursor: 0,
            rounds: HashMap::new(),
            escalation: HashMap::new(),
            batch_checked: HashSet::new(),
            rolled_back_all: false,
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn phases(&self) -> &[PhaseSpec] {
        &self.phases
    }

    pub fn current_phase(&self) -> Option<&PhaseSpec> {
        self.phases.get(self.cursor)
    }

    pub fn rolled_back_all(&self) -> bool {
        self.rolled_back_all
    }

    /// Run every remaining phase in order.
    pub async fn run(&mut self) -> EngineResult<()> {
        while self.cursor < self.phases.len() {
            self.run_phase(self.cursor).await?;
            self.cursor += 1;
        }
        Ok(())
    }

    async fn transition(&self, phase: &str, from: PhaseStatus, to: PhaseStatus) -> EngineResult<()> {
        self.ctx.state.record_phase(phase, from, to).await?;
        obs::emit_phase_transition(phase, from, to);
        Ok(())
    }

    fn phase_issues<'a>(view: &'a StateView, phase: &'a str) -> impl Iterator<Item = (&'a IssueId, &'a crate::state::IssueView)> {
        view.issues.iter().filter(move |(_, v)| v.phase == phase)
    }

    #[instrument(skip(self), fields(phase = %self.phases[idx].name))]
    async fn run_phase(&mut self, idx: usize) -> EngineResult<()> {
        let phase = self.phases[idx].clone();
        match self.ctx.state.phase_status(&phase.name).await {
            PhaseStatus::NotStarted => {
                if let Some(prev) = idx.checked_sub(1).map(|i| &self.phases[i]) {
                    let prev_status = self.ctx.state.phase_status(&prev.name).await;
                    if prev_status != PhaseStatus::Completed {
                        return Err(EngineError::InvalidTransition {
                            subject: format!("phase {}", phase.name),
                            from: format!("{} while {} is {prev_status}", PhaseStatus::NotStarted, prev.name),
                            to: PhaseStatus::Running.to_string(),
                        });
                    }
                }
                self.escalation.clear();
                self.transition(&phase.name, PhaseStatus::NotStarted, PhaseStatus::Running)
                    .await?;
            }
            PhaseStatus::Running => debug!("continuing phase"),
            PhaseStatus::Completed => return Ok(()),
            status => {
                return Err(EngineError::Halted {
                    reason: format!("phase {} is {status}; resume it first", phase.name),
                })
            }
        }

        loop {
            if let Some(reason) = self.drain(&phase.name).await? {
                return Err(self.abort_phase(&phase.name, &reason).await?);
            }
            let validated = self.validate_batches(&phase.name).await?;
            let requeued = self.requeue_rolled_back(&phase.name).await?;
            if !validated && requeued == 0 {
                break;
            }
        }

        let view = self.ctx.state.snapshot().await;
        let unresolved: Vec<IssueId> = Self::phase_issues(&view, &phase.name)
            .filter(|(_, v)| v.is_unresolved())
            .map(|(id, _)| id.clone())
            .collect();
        if !unresolved.is_empty() {
            if !self.ctx.settings.exclude_unresolved {
                return Err(EngineError::PhaseBlocked {
                    phase: phase.name.clone(),
                    unresolved,
                });
            }
            for id in &unresolved {
                self.exclude_with_cascade(id, "unresolved when the phase drained")
                    .await?;
            }
        }

        self.validate_phase(&phase.name).await
    }

    /// Dispatch until nothing is running and nothing more can start.
    /// Returns the abort reason if the phase was aborted.
    async fn drain(&mut self, phase: &str) -> EngineResult<Option<String>> {
        let mut tasks: JoinSet<FixTaskReport> = JoinSet::new();
        let mut running: HashSet<IssueId> = HashSet::new();
        let mut abort = self.ctx.abort.subscribe();

        loop {
            let aborted = abort.borrow_and_update().clone();
            if let Some(reason) = aborted {
                info!(reason = %reason, in_flight = tasks.len(), "abort requested; draining in-flight fixes");
                while let Some(joined) = tasks.join_next().await {
                    let report = joined.map_err(|e| EngineError::Halted {
                        reason: format!("fix task failed: {e}"),
                    })?;
                    self.settle(phase, report).await?;
                }
                return Ok(Some(reason));
            }

            self.dispatch_ready(phase, &mut tasks, &mut running).await?;
            if tasks.is_empty() {
                return Ok(None);
            }

            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { continue };
                    let report = joined.map_err(|e| EngineError::Halted {
                        reason: format!("fix task failed: {e}"),
                    })?;
                    running.remove(&report.issue);
                    self.settle(phase, report).await?;
                }
                changed = abort.changed() => {
                    if changed.is_err() {
                        return Err(EngineError::Halted {
                            reason: "engine control handle dropped".into(),
                        });
                    }
                }
            }
        }
    }

    async fn dispatch_ready(
        &mut self,
        phase: &str,
        tasks: &mut JoinSet<FixTaskReport>,
        running: &mut HashSet<IssueId>,
    ) -> EngineResult<()> {
        let view = self.ctx.state.snapshot().await;
        for id in self.graph.ready(phase) {
            if running.contains(&id) {
                continue;
            }
            let Some(issue) = view.issues.get(&id) else {
                continue;
            };
            if issue.status != IssueStatus::Pending || issue.excluded {
                continue;
            }

            let rollback = &self.ctx.rollback;
            match self
                .registry
                .select(&issue.issue.category, |agent| rollback.is_suspended(agent, phase))
            {
                Selection::Assigned(agent, permit) => {
                    debug!(issue = %id, agent = %agent.id(), attempt = issue.attempt, "dispatching");
                    let flight = self.ctx.in_flight.begin(Flight {
                        issue: id.clone(),
                        attempt: issue.attempt,
                        agent: agent.id().clone(),
                        phase: phase.to_string(),
                        files: issue.issue.files.clone(),
                    });
                    let task = FixTask {
                        ctx: Arc::clone(&self.ctx),
                        issue: issue.issue.clone(),
                        attempt: issue.attempt,
                        agent,
                        phase: phase.to_string(),
                        _flight: flight,
                        _permit: permit,
                    };
                    running.insert(id);
                    tasks.spawn(task.run());
                }
                Selection::NoCapableAgent => {
                    let category = issue.issue.category.clone();
                    warn!(issue = %id, category = %category, "no capable agent; excluding issue");
                    self.ctx
                        .state
                        .record_failure(&id, issue.attempt, None, FixError::NoCapableAgent { category }, Vec::new())
                        .await?;
                    METRICS.inc_fixes_failed();
                    self.exclude_with_cascade(&id, "no capable agent").await?;
                }
                Selection::Busy | Selection::Suspended => {}
            }
        }
        Ok(())
    }

    async fn settle(&mut self, phase: &str, report: FixTaskReport) -> EngineResult<()> {
        match report.outcome {
            TaskOutcome::Fixed => {
                // A coarse rollback may have undone the fix before its report
                // was joined; it stays blocking until requeued.
                let current = self.ctx.state.get_issue(&report.issue).await;
                if current.is_some_and(|v| v.status != IssueStatus::Fixed) {
                    debug!(issue = %report.issue, "fix rolled back before it settled");
                    return Ok(());
                }
                let unlocked = self.graph.retire(&report.issue);
                if !unlocked.is_empty() {
                    debug!(issue = %report.issue, unlocked = ?unlocked, "dependents unlocked");
                }
                self.ctx.bus.publish(BusEvent::DependencyResolved {
                    issue: report.issue,
                    unlocked,
                });
            }
            TaskOutcome::Failed(err) if err.is_validation_failure() => {
                let count = self
                    .escalation
                    .entry((report.agent.clone(), report.category.clone()))
                    .or_insert(0);
                *count += 1;
                if *count >= self.ctx.settings.escalation_threshold {
                    let reason = format!(
                        "{count} must-pass validation failures for category {} (last: {err})",
                        report.category
                    );
                    self.rollback_agent(&report.agent, phase, &reason).await?;
                }
            }
            TaskOutcome::Failed(_) | TaskOutcome::Withdrawn => {}
            TaskOutcome::Fatal(e) => return Err(e),
        }
        Ok(())
    }

    async fn rollback_agent(&mut self, agent: &AgentId, phase: &str, reason: &str) -> EngineResult<()> {
        warn!(agent = %agent, phase = %phase, reason = %reason, "escalating to agent rollback");
        let scope = RollbackScope::Agent {
            agent: agent.clone(),
            phase: phase.to_string(),
        };
        let outcome = self.ctx.rollback.rollback(scope, reason).await?;
        self.unretire(&outcome);
        Ok(())
    }

    /// Make rolled-back issues block their dependents again.
    fn unretire(&mut self, outcome: &RollbackOutcome) {
        if let Some(event) = outcome.event() {
            for issue in &event.issues {
                self.graph.restore(issue);
            }
        }
    }

    /// Runtime-level validation of each agent's not-yet-checked Fixed issues.
    /// Returns whether any batch was validated.
    async fn validate_batches(&mut self, phase: &str) -> EngineResult<bool> {
        let view = self.ctx.state.snapshot().await;
        let mut batches: BTreeMap<AgentId, Vec<(IssueId, u32)>> = BTreeMap::new();
        for (id, v) in Self::phase_issues(&view, phase) {
            if v.status != IssueStatus::Fixed || self.batch_checked.contains(&(id.clone(), v.attempt)) {
                continue;
            }
            if let Some(agent) = &v.agent {
                batches.entry(agent.clone()).or_default().push((id.clone(), v.attempt));
            }
        }
        if batches.is_empty() {
            return Ok(false);
        }

        for (agent, members) in batches {
            let scope = ValidationScope::Batch {
                agent: agent.clone(),
                phase: phase.to_string(),
                issues: members.iter().map(|(id, _)| id.clone()).collect(),
            };
            let verdict = self.ctx.gate.run_stage(ValidationStage::Batch, &scope).await;
            for result in &verdict.results {
                self.ctx.state.record_validation(result.clone()).await?;
            }
            self.batch_checked.extend(members);
            if let Some(failure) = verdict.blocking_failure() {
                let reason = format!("batch {} validation failed: {}", failure.level, failure.detail);
                self.rollback_agent(&agent, phase, &reason).await?;
            }
        }
        Ok(true)
    }

    /// Open a new attempt for every rolled-back issue that may retry.
    /// Attempts that were rolled back after succeeding always retry.
    async fn requeue_rolled_back(&mut self, phase: &str) -> EngineResult<usize> {
        let view = self.ctx.state.snapshot().await;
        let max_attempts = self.ctx.settings.max_attempts;
        let mut requeued = 0;
        for (id, v) in Self::phase_issues(&view, phase) {
            let retryable = v.status == IssueStatus::RolledBack
                && !v.excluded
                && (v.attempt < max_attempts || v.failure.is_none());
            if !retryable {
                continue;
            }
            let attempt = self.ctx.state.requeue(id).await?;
            self.graph.restore(id);
            debug!(issue = %id, attempt, "requeued");
            requeued += 1;
        }
        Ok(requeued)
    }

    async fn validate_phase(&mut self, phase: &str) -> EngineResult<()> {
        self.transition(phase, PhaseStatus::Running, PhaseStatus::Validating)
            .await?;

        let view = self.ctx.state.snapshot().await;
        let scope = ValidationScope::Phase {
            phase: phase.to_string(),
            issues: Self::phase_issues(&view, phase)
                .filter(|(_, v)| v.status == IssueStatus::Fixed)
                .map(|(id, _)| id.clone())
                .collect(),
        };
        let verdict = self.ctx.gate.run_stage(ValidationStage::Phase, &scope).await;
        for result in &verdict.results {
            self.ctx.state.record_validation(result.clone()).await?;
        }

        if let Some(failure) = verdict.blocking_failure() {
            let reason = format!("phase {} validation failed: {}", failure.level, failure.detail);
            return Err(match self.ctx.settings.on_phase_failure {
                PhaseFailurePolicy::RollbackPhase => self.rollback_phase(phase, &reason).await?,
                PhaseFailurePolicy::RollbackAll => {
                    self.rollback_all(&reason).await?;
                    EngineError::PhaseRolledBack {
                        phase: phase.to_string(),
                        reason: format!("complete rollback: {reason}"),
                    }
                }
            });
        }

        self.transition(phase, PhaseStatus::Validating, PhaseStatus::Completed)
            .await?;
        if self.ctx.settings.backup_retention == BackupRetention::PhaseCompletion {
            let evicted = self.ctx.backups.evict_phase(phase).await?;
            debug!(phase = %phase, evicted, "phase backups released");
        }
        info!(phase = %phase, "phase completed");
        Ok(())
    }

    /// Roll the phase back. Returns the error that halts the run.
    async fn rollback_phase(&mut self, phase: &str, reason: &str) -> EngineResult<EngineError> {
        let round = *self.rounds.get(phase).unwrap_or(&0);
        let scope = RollbackScope::Phase {
            phase: phase.to_string(),
            round,
        };
        let outcome = self.ctx.rollback.rollback(scope, reason).await?;
        self.unretire(&outcome);
        self.rounds.insert(phase.to_string(), round + 1);

        let from = self.ctx.state.phase_status(phase).await;
        if from.can_transition_to(PhaseStatus::RolledBack) {
            self.transition(phase, from, PhaseStatus::RolledBack).await?;
        }
        Ok(EngineError::PhaseRolledBack {
            phase: phase.to_string(),
            reason: reason.to_string(),
        })
    }

    async fn abort_phase(&mut self, phase: &str, reason: &str) -> EngineResult<EngineError> {
        self.rollback_phase(phase, &format!("aborted: {reason}")).await
    }

    /// Restore every retained backup and close every attempt. The active
    /// phase moves to RolledBack.
    pub async fn rollback_all(&mut self, reason: &str) -> EngineResult<RollbackOutcome> {
        let outcome = self.ctx.rollback.rollback(RollbackScope::Complete, reason).await?;
        self.unretire(&outcome);
        self.rolled_back_all = true;

        if let Some(phase) = self.current_phase().map(|p| p.name.clone()) {
            let from = self.ctx.state.phase_status(&phase).await;
            if from.is_active() {
                self.transition(&phase, from, PhaseStatus::RolledBack).await?;
            }
        }
        Ok(outcome)
    }

    /// Exclude `id` and fail every Pending issue that transitively depends on it.
    async fn exclude_with_cascade(&mut self, id: &IssueId, reason: &str) -> EngineResult<()> {
        let view = self.ctx.state.snapshot().await;
        if view.issues.get(id).is_some_and(|v| !v.excluded) {
            self.ctx.state.exclude(id, reason).await?;
        }

        for dependent in self.graph.transitive_dependents_of(id) {
            let Some(v) = view.issues.get(&dependent) else {
                continue;
            };
            if v.excluded || matches!(v.status, IssueStatus::Fixed | IssueStatus::InProgress) {
                continue;
            }
            if v.status == IssueStatus::Pending {
                self.ctx
                    .state
                    .record_failure(
                        &dependent,
                        v.attempt,
                        None,
                        FixError::DependencyExcluded { dependency: id.clone() },
                        Vec::new(),
                    )
                    .await?;
            }
            self.ctx
                .state
                .exclude(&dependent, format!("depends on excluded issue {id}"))
                .await?;
        }
        Ok(())
    }

    fn check_unresolved(&self, view: &StateView, phase: &str, ids: &[IssueId]) -> EngineResult<()> {
        for id in ids {
            match view.issues.get(id) {
                Some(v) if v.phase == phase && v.is_unresolved() => {}
                Some(_) => {
                    return Err(EngineError::InvalidResume {
                        detail: format!("issue {id} is not unresolved in phase {phase}"),
                    })
                }
                None => return Err(EngineError::UnknownIssue { issue: id.clone() }),
            }
        }
        Ok(())
    }

    /// Give each listed unresolved issue another attempt.
    pub async fn retry_issues(&mut self, phase: &str, ids: &[IssueId]) -> EngineResult<()> {
        let view = self.ctx.state.snapshot().await;
        self.check_unresolved(&view, phase, ids)?;

        self.ctx.rollback.reopen_phase(phase);
        self.escalation.clear();
        for id in ids {
            let status = view.issues.get(id).map(|v| v.status);
            if matches!(status, Some(IssueStatus::Failed | IssueStatus::RolledBack)) {
                self.ctx.state.requeue(id).await?;
            }
            self.graph.restore(id);
        }
        Ok(())
    }

    /// Exclude the listed unresolved issues so the phase can complete without them.
    pub async fn exclude_issues(&mut self, phase: &str, ids: &[IssueId]) -> EngineResult<()> {
        let view = self.ctx.state.snapshot().await;
        self.check_unresolved(&view, phase, ids)?;
        for id in ids {
            self.exclude_with_cascade(id, "excluded by operator").await?;
        }
        Ok(())
    }

    /// Reopen a rolled-back phase; every issue that is neither Fixed nor
    /// excluded gets a new attempt.
    pub async fn retry_phase(&mut self, phase: &str) -> EngineResult<()> {
        self.transition(phase, PhaseStatus::RolledBack, PhaseStatus::Running)
            .await?;
        self.ctx.rollback.reopen_phase(phase);
        self.escalation.clear();
        self.batch_checked.clear();

        let view = self.ctx.state.snapshot().await;
        for (id, v) in Self::phase_issues(&view, phase) {
            if v.excluded || matches!(v.status, IssueStatus::Fixed | IssueStatus::Pending) {
                continue;
            }
            self.ctx.state.requeue(id).await?;
            self.graph.restore(id);
        }
        Ok(())
    }
}
