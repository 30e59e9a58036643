//! Core domain model: issues, phases, agents, validation and rollback types.
//!
//! Every status field is a closed enum with an explicit transition table; the
//! engine refuses any transition the table does not list.

pub mod agent;
pub mod issue;
pub mod phase;
pub mod records;
pub mod rollback;
pub mod validation;

pub use agent::{AgentId, AgentSpec};
pub use issue::{normalize_path, Category, Issue, IssueCatalog, IssueId, IssueStatus, Severity};
pub use phase::{PhaseSpec, PhaseStatus};
pub use records::{FixOutcome, FixRecord};
pub use rollback::{RestoredBackup, RollbackEvent, RollbackLevel, RollbackScope};
pub use validation::{
    Requirement, ValidationLevel, ValidationResult, ValidationScope, ValidationStage,
};
