//! Structured lifecycle events for engine runs.
//!
//! Every emitter logs with an `event = "<area>.<verb>"` field so log
//! pipelines can filter on it. Run-scoped context comes from [`EngineSpan`].

use std::path::Path;

use tracing::{info, warn};

use crate::domain::{IssueId, PhaseStatus, RollbackLevel, ValidationLevel};

/// RAII guard that keeps a run-scoped span entered.
///
/// ```ignore
/// let _span = EngineSpan::enter("4b1c...");
/// // everything logged here carries run_id
/// ```
pub struct EngineSpan {
    _span: tracing::span::EnteredSpan,
}

impl EngineSpan {
    pub fn enter(run_id: &str) -> Self {
        let span = tracing::info_span!("mender.run", run_id = %run_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Span for async work; use with `tracing::Instrument`.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("mender.run", run_id = %run_id)
}

pub fn emit_phase_transition(phase: &str, from: PhaseStatus, to: PhaseStatus) {
    info!(event = "phase.transition", phase = %phase, from = %from, to = %to);
}

pub fn emit_fix_claimed(issue: &IssueId, agent: &str, attempt: u32) {
    info!(event = "fix.claimed", issue = %issue, agent = %agent, attempt = attempt);
}

pub fn emit_fix_finished(issue: &IssueId, attempt: u32, success: bool, duration_ms: u64) {
    info!(
        event = "fix.finished",
        issue = %issue,
        attempt = attempt,
        success = success,
        duration_ms = duration_ms,
    );
}

pub fn emit_lock_contended(path: &Path, requester: &str, holder: Option<&str>) {
    info!(
        event = "lock.contended",
        path = %path.display(),
        requester = %requester,
        holder = holder.unwrap_or("-"),
    );
}

pub fn emit_validation_finished(level: ValidationLevel, scope: &str, passed: bool, duration_ms: u64) {
    info!(
        event = "validation.finished",
        level = %level,
        scope = %scope,
        passed = passed,
        duration_ms = duration_ms,
    );
}

pub fn emit_rollback_applied(level: RollbackLevel, scope: &str, restored: usize, issues: usize) {
    warn!(
        event = "rollback.applied",
        level = %level,
        scope = %scope,
        restored = restored,
        issues = issues,
    );
}

pub fn emit_engine_halted(reason: &dyn std::fmt::Display) {
    warn!(event = "engine.halted", reason = %reason);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_span_enter() {
        let _span = EngineSpan::enter("test-run");
        emit_phase_transition("p1", PhaseStatus::NotStarted, PhaseStatus::Running);
    }
}
