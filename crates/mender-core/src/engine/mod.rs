//! The fix orchestration engine.
//!
//! [`FixEngine`] owns one run: it builds the dependency graph at submit time,
//! drives phases through the scheduler, and turns halts into resumable or
//! terminal states. Collaborators (agents, validator, work tree, storage)
//! are injected; everything else is created here and shared with fix tasks
//! through an [`EngineContext`].

mod fix_task;
mod scheduler;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mender_state::{CasStore, Journal, MemoryCasStore};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::agents::AgentRegistry;
use crate::backup::BackupStore;
use crate::bus::MessageBus;
use crate::config::{EngineConfig, EngineSettings};
use crate::domain::{normalize_path, IssueCatalog, IssueId, PhaseSpec, PhaseStatus};
use crate::error::{EngineError, EngineResult};
use crate::graph::{DependencyGraph, ExecutionPlan};
use crate::locks::ConflictDetector;
use crate::metrics::METRICS;
use crate::obs;
use crate::report::{FixExecutionReport, RunOutcome};
use crate::rollback::{InFlight, RollbackManager, RollbackOutcome};
use crate::state::{AuditEvent, SharedState, StateView};
use crate::validation::{ValidationGate, Validator};
use crate::worktree::WorkTree;

use scheduler::PhaseScheduler;

/// Components shared by the scheduler and every fix task.
pub(crate) struct EngineContext {
    pub state: Arc<SharedState>,
    pub backups: Arc<BackupStore>,
    pub locks: ConflictDetector,
    pub gate: ValidationGate,
    pub rollback: RollbackManager,
    pub in_flight: Arc<InFlight>,
    pub worktree: Arc<dyn WorkTree>,
    pub bus: MessageBus,
    pub settings: EngineSettings,
    /// `Some(reason)` once an abort was requested.
    pub abort: Arc<watch::Sender<Option<String>>>,
}

/// How an operator continues a halted run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "directive", content = "issues", rename_all = "snake_case")]
pub enum ResumeDirective {
    /// Reopen a rolled-back phase, or retry every unresolved issue of a
    /// blocked one.
    RetryPhase,
    RetryIssues(Vec<IssueId>),
    ExcludeIssues(Vec<IssueId>),
}

impl fmt::Display for ResumeDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(ids: &[IssueId]) -> String {
            ids.iter().map(IssueId::as_str).collect::<Vec<_>>().join(",")
        }
        match self {
            Self::RetryPhase => f.write_str("retry_phase"),
            Self::RetryIssues(ids) => write!(f, "retry_issues:{}", join(ids)),
            Self::ExcludeIssues(ids) => write!(f, "exclude_issues:{}", join(ids)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Halt {
    PhaseRolledBack { phase: String, reason: String },
    PhaseBlocked { phase: String, unresolved: Vec<IssueId> },
    RolledBackAll { reason: String },
    Fatal { reason: String },
}

impl Halt {
    fn from_error(err: &EngineError, rolled_back_all: bool) -> Self {
        match err {
            _ if rolled_back_all => Self::RolledBackAll {
                reason: err.to_string(),
            },
            EngineError::PhaseRolledBack { phase, reason } => Self::PhaseRolledBack {
                phase: phase.clone(),
                reason: reason.clone(),
            },
            EngineError::PhaseBlocked { phase, unresolved } => Self::PhaseBlocked {
                phase: phase.clone(),
                unresolved: unresolved.clone(),
            },
            other => Self::Fatal {
                reason: other.to_string(),
            },
        }
    }

    fn reason(&self) -> String {
        match self {
            Self::PhaseRolledBack { phase, reason } => format!("phase {phase} rolled back: {reason}"),
            Self::PhaseBlocked { phase, unresolved } => {
                format!("phase {phase} blocked by unresolved issues: {unresolved:?}")
            }
            Self::RolledBackAll { reason } | Self::Fatal { reason } => reason.clone(),
        }
    }

    fn resumable(&self) -> bool {
        matches!(self, Self::PhaseRolledBack { .. } | Self::PhaseBlocked { .. })
    }
}

/// Cloneable control handle for a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    abort: Arc<watch::Sender<Option<String>>>,
}

impl EngineHandle {
    /// Cancel fixes that have not started, let running ones finish or time
    /// out, then roll back the running phase and halt.
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        info!(reason = %reason, "abort requested");
        self.abort.send_replace(Some(reason));
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.borrow().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub name: String,
    pub ordinal: u32,
    pub status: PhaseStatus,
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub run_id: String,
    pub phases: Vec<PhaseState>,
    pub current_phase: Option<String>,
    pub halted: Option<String>,
    pub resumable: bool,
    pub state: StateView,
    /// File → holder label.
    pub locks: BTreeMap<PathBuf, String>,
    pub backups: usize,
    pub in_flight: usize,
}

pub struct FixEngine {
    run_id: String,
    config: EngineConfig,
    registry: AgentRegistry,
    validator: Arc<dyn Validator>,
    worktree: Arc<dyn WorkTree>,
    bus: MessageBus,
    cas: Arc<dyn CasStore>,
    journal: Option<Arc<dyn Journal>>,
    abort: Arc<watch::Sender<Option<String>>>,
    ctx: Arc<EngineContext>,
    scheduler: Option<PhaseScheduler>,
    halt: Option<Halt>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for FixEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixEngine")
            .field("run_id", &self.run_id)
            .field("agents", &self.registry.len())
            .field("submitted", &self.scheduler.is_some())
            .field("halt", &self.halt)
            .finish_non_exhaustive()
    }
}

impl FixEngine {
    /// Validate `config` and wire the engine with an in-memory backup store.
    pub fn new(
        config: EngineConfig,
        registry: AgentRegistry,
        validator: Arc<dyn Validator>,
        worktree: Arc<dyn WorkTree>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let bus = MessageBus::new();
        let cas: Arc<dyn CasStore> = Arc::new(MemoryCasStore::new());
        let abort = Arc::new(watch::Sender::new(None));
        let ctx = Self::assemble(&config, &validator, &worktree, &bus, &cas, None, &abort);
        Ok(Self {
            run_id: Uuid::new_v4().to_string(),
            config,
            registry,
            validator,
            worktree,
            bus,
            cas,
            journal: None,
            abort,
            ctx,
            scheduler: None,
            halt: None,
            started_at: None,
            finished_at: None,
        })
    }

    fn assemble(
        config: &EngineConfig,
        validator: &Arc<dyn Validator>,
        worktree: &Arc<dyn WorkTree>,
        bus: &MessageBus,
        cas: &Arc<dyn CasStore>,
        journal: Option<&Arc<dyn Journal>>,
        abort: &Arc<watch::Sender<Option<String>>>,
    ) -> Arc<EngineContext> {
        let settings = config.engine.clone();
        let state = Arc::new(match journal {
            Some(j) => SharedState::with_journal(Arc::clone(j)),
            None => SharedState::new(),
        });
        let backups = Arc::new(BackupStore::new(Arc::clone(cas)));
        let locks = ConflictDetector::with_bus(bus.clone());
        let in_flight = Arc::new(InFlight::default());
        let rollback = RollbackManager::new(
            Arc::clone(&state),
            Arc::clone(&backups),
            locks.clone(),
            Arc::clone(worktree),
            Arc::clone(&in_flight),
            settings.lock_timeout(),
        )
        .with_bus(bus.clone());
        let gate = ValidationGate::new(
            Arc::clone(validator),
            config.validation.policy.clone(),
            settings.validation_timeout(),
        );

        Arc::new(EngineContext {
            state,
            backups,
            locks,
            gate,
            rollback,
            in_flight,
            worktree: Arc::clone(worktree),
            bus: bus.clone(),
            settings,
            abort: Arc::clone(abort),
        })
    }

    fn rewire(mut self) -> Self {
        self.ctx = Self::assemble(
            &self.config,
            &self.validator,
            &self.worktree,
            &self.bus,
            &self.cas,
            self.journal.as_ref(),
            &self.abort,
        );
        self
    }

    /// Publish coordination events on `bus`. Call before `submit_issues`.
    pub fn with_bus(mut self, bus: MessageBus) -> Self {
        self.bus = bus;
        self.rewire()
    }

    /// Keep backup contents in `cas`. Call before `submit_issues`.
    pub fn with_cas(mut self, cas: Arc<dyn CasStore>) -> Self {
        self.cas = cas;
        self.rewire()
    }

    /// Mirror the audit log to `journal`. Call before `submit_issues`.
    pub fn with_journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self.rewire()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            abort: Arc::clone(&self.abort),
        }
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn state(&self) -> Arc<SharedState> {
        Arc::clone(&self.ctx.state)
    }

    /// Build the dependency graph, assign every issue to the first phase
    /// targeting its category and record the submissions.
    ///
    /// Nothing is recorded if the catalog is rejected.
    pub async fn submit_issues(&mut self, mut catalog: IssueCatalog) -> EngineResult<()> {
        if self.scheduler.is_some() {
            return Err(EngineError::AlreadySubmitted);
        }
        for issue in &mut catalog.issues {
            issue.files = issue
                .files
                .iter()
                .map(|path| {
                    normalize_path(path).map_err(|reason| EngineError::InvalidPath {
                        issue: issue.id.clone(),
                        path: path.clone(),
                        reason,
                    })
                })
                .collect::<EngineResult<_>>()?;
        }
        let phases = self.config.phase_specs();
        let mut graph = DependencyGraph::build(&catalog)?;

        for issue in catalog.iter() {
            let phase = phases
                .iter()
                .find(|p| p.targets(&issue.category))
                .ok_or_else(|| EngineError::NoPhaseForCategory {
                    issue: issue.id.clone(),
                    category: issue.category.clone(),
                })?;
            graph.assign_phase(&issue.id, &phase.name)?;
        }

        let ordinal = |id: &IssueId| {
            graph
                .phase_of(id)
                .and_then(|name| phases.iter().find(|p| p.name == name))
                .map(|p| p.ordinal)
        };
        for issue in catalog.iter() {
            for dep in &issue.depends_on {
                if ordinal(dep) > ordinal(&issue.id) {
                    return Err(EngineError::DependencyOrder {
                        issue: issue.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        for issue in catalog.issues {
            let phase = graph.phase_of(&issue.id).unwrap_or_default().to_string();
            self.ctx.state.submit(issue, &phase).await?;
        }
        info!(issues = graph.len(), phases = phases.len(), "issues submitted");

        self.scheduler = Some(PhaseScheduler::new(
            Arc::clone(&self.ctx),
            self.registry.clone(),
            graph,
            phases,
        ));
        Ok(())
    }

    /// Kahn-level preview of the submitted graph.
    pub fn execution_plan(&self) -> EngineResult<ExecutionPlan> {
        self.scheduler
            .as_ref()
            .ok_or(EngineError::NotSubmitted)?
            .graph()
            .execution_plan()
    }

    /// Run every remaining phase.
    ///
    /// Phase-level and fatal errors halt the engine and are returned; the
    /// report still reflects everything that happened. A halted engine must
    /// be resumed before `run` is called again.
    pub async fn run(&mut self) -> EngineResult<FixExecutionReport> {
        let scheduler = self.scheduler.as_mut().ok_or(EngineError::NotSubmitted)?;
        if let Some(halt) = &self.halt {
            return Err(EngineError::Halted { reason: halt.reason() });
        }
        self.started_at.get_or_insert_with(Utc::now);

        let result = scheduler.run().instrument(obs::run_span(&self.run_id)).await;
        let rolled_back_all = scheduler.rolled_back_all();
        self.finished_at = Some(Utc::now());
        METRICS.flush();

        match result {
            Ok(()) => {
                info!(run_id = %self.run_id, "all phases completed");
                Ok(self.report().await)
            }
            Err(e) => {
                self.halt_with(&e, rolled_back_all).await;
                Err(e)
            }
        }
    }

    async fn halt_with(&mut self, err: &EngineError, rolled_back_all: bool) {
        obs::emit_engine_halted(err);
        if let Err(e) = self
            .ctx
            .state
            .append(AuditEvent::EngineHalted {
                reason: err.to_string(),
            })
            .await
        {
            warn!(error = %e, "failed to record halt");
        }
        self.halt = Some(Halt::from_error(err, rolled_back_all));
    }

    /// Continue a halted run. Call [`run`](Self::run) afterwards.
    pub async fn resume(&mut self, directive: ResumeDirective) -> EngineResult<()> {
        let scheduler = self.scheduler.as_mut().ok_or(EngineError::NotSubmitted)?;
        let Some(halt) = self.halt.clone() else {
            return Err(EngineError::InvalidResume {
                detail: "engine is not halted".into(),
            });
        };
        if !halt.resumable() {
            return Err(EngineError::NotResumable { reason: halt.reason() });
        }

        match (&halt, &directive) {
            (Halt::PhaseRolledBack { phase, .. }, ResumeDirective::RetryPhase) => {
                scheduler.retry_phase(phase).await?;
            }
            (Halt::PhaseRolledBack { .. }, _) => {
                return Err(EngineError::InvalidResume {
                    detail: "a rolled-back phase can only be resumed with retry_phase".into(),
                });
            }
            (Halt::PhaseBlocked { phase, unresolved }, ResumeDirective::RetryPhase) => {
                scheduler.retry_issues(phase, unresolved).await?;
            }
            (Halt::PhaseBlocked { phase, .. }, ResumeDirective::RetryIssues(ids)) => {
                scheduler.retry_issues(phase, ids).await?;
            }
            (Halt::PhaseBlocked { phase, .. }, ResumeDirective::ExcludeIssues(ids)) => {
                scheduler.exclude_issues(phase, ids).await?;
            }
            (Halt::RolledBackAll { .. } | Halt::Fatal { .. }, _) => {
                return Err(EngineError::NotResumable { reason: halt.reason() });
            }
        }

        self.ctx
            .state
            .append(AuditEvent::EngineResumed {
                directive: directive.to_string(),
            })
            .await?;
        self.abort.send_replace(None);
        self.halt = None;
        self.finished_at = None;
        info!(directive = %directive, "engine resumed");
        Ok(())
    }

    /// Restore every retained backup and close every attempt. The engine is
    /// not resumable afterwards.
    pub async fn rollback_all(&mut self, reason: &str) -> EngineResult<RollbackOutcome> {
        let scheduler = self.scheduler.as_mut().ok_or(EngineError::NotSubmitted)?;
        let outcome = scheduler.rollback_all(reason).await;
        self.finished_at = Some(Utc::now());
        match outcome {
            Ok(outcome) => {
                let err = EngineError::Halted {
                    reason: format!("complete rollback: {reason}"),
                };
                self.halt_with(&err, true).await;
                Ok(outcome)
            }
            Err(e) => {
                self.halt_with(&e, true).await;
                Err(e)
            }
        }
    }

    pub async fn get_state(&self) -> EngineSnapshot {
        let state = self.ctx.state.snapshot().await;
        let phases: &[PhaseSpec] = self.scheduler.as_ref().map_or(&[][..], |s| s.phases());
        EngineSnapshot {
            run_id: self.run_id.clone(),
            phases: phases
                .iter()
                .map(|p| PhaseState {
                    name: p.name.clone(),
                    ordinal: p.ordinal,
                    status: state.phase_status(&p.name),
                })
                .collect(),
            current_phase: self
                .scheduler
                .as_ref()
                .and_then(|s| s.current_phase())
                .map(|p| p.name.clone()),
            halted: self.halt.as_ref().map(Halt::reason),
            resumable: self.halt.as_ref().is_some_and(Halt::resumable),
            locks: self.ctx.locks.holders(),
            backups: self.ctx.backups.len(),
            in_flight: self.ctx.in_flight.count(),
            state,
        }
    }

    /// Report of everything recorded so far.
    pub async fn report(&self) -> FixExecutionReport {
        let view = self.ctx.state.snapshot().await;
        let outcome = match (&self.halt, self.started_at, &self.finished_at) {
            (Some(Halt::RolledBackAll { reason }), ..) => RunOutcome::RolledBack {
                reason: reason.clone(),
            },
            (Some(halt), ..) => RunOutcome::Halted {
                reason: halt.reason(),
                resumable: halt.resumable(),
            },
            (None, None, _) => RunOutcome::NotStarted,
            (None, Some(_), Some(_)) => RunOutcome::Completed,
            (None, Some(_), None) => RunOutcome::InProgress,
        };
        let phases: &[PhaseSpec] = self.scheduler.as_ref().map_or(&[][..], |s| s.phases());
        FixExecutionReport::build(
            &self.run_id,
            self.started_at,
            self.finished_at,
            outcome,
            phases,
            &view,
        )
    }
}
