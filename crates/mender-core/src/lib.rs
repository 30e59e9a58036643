//! mender core library
//!
//! Orchestrates automated fixes across a codebase: issues are scheduled in
//! dependency order through ordered phases, file locks keep concurrent
//! agents apart, staged validation gates every fix, and rollback restores
//! pre-fix backups at fix, agent, phase or run scope.

pub mod agents;
pub mod backup;
pub mod bus;
pub mod command;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod fakes;
pub mod graph;
pub mod locks;
pub mod metrics;
pub mod obs;
pub mod report;
pub mod rollback;
pub mod state;
pub mod telemetry;
pub mod validation;
pub mod worktree;

pub use agents::{AgentRegistry, FixAgent, Selection};
pub use backup::{Backup, BackupOwner, BackupStore};
pub use bus::{BusEvent, BusHandler, Deduplicate, Envelope, MessageBus};
pub use command::{CommandAgent, CommandValidator};
pub use config::{
    AgentConfig, BackupRetention, EngineConfig, EngineSettings, PhaseConfig, PhaseFailurePolicy,
    ValidationConfig,
};
pub use domain::{
    AgentId, AgentSpec, Category, FixOutcome, FixRecord, Issue, IssueCatalog, IssueId,
    IssueStatus, PhaseSpec, PhaseStatus, Requirement, RestoredBackup, RollbackEvent,
    RollbackLevel, RollbackScope, Severity, ValidationLevel, ValidationResult, ValidationScope,
    ValidationStage,
};
pub use engine::{EngineHandle, EngineSnapshot, FixEngine, PhaseState, ResumeDirective};
pub use error::{EngineError, EngineResult, FixError};
pub use graph::{DependencyGraph, ExecutionPlan};
pub use locks::{ConflictDetector, LockGuard, LockTimeoutError};
pub use report::{read_report, write_report, FixExecutionReport, IssueReport, RunOutcome};
pub use rollback::{InFlight, RollbackManager, RollbackOutcome};
pub use state::{AuditEntry, AuditEvent, SharedState, StateView};
pub use validation::{CheckOutcome, ValidationGate, ValidationPolicy, Validator};
pub use worktree::{FsWorkTree, MemoryWorkTree, WorkTree};
