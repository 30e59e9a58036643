//! Staged validation gate.
//!
//! The gate wraps an external [`Validator`] with the requirement policy and a
//! per-call timeout. It keeps no state between calls; whatever a validator
//! checks is read from the working tree at call time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::domain::{Requirement, ValidationLevel, ValidationResult, ValidationScope, ValidationStage};
use crate::obs;

/// Raw verdict from an external checker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub passed: bool,
    pub detail: String,
}

impl CheckOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            detail: String::new(),
        }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            detail: detail.into(),
        }
    }
}

/// The validation collaborator (linters, compilers, test suites).
#[async_trait]
pub trait Validator: Send + Sync {
    async fn run(&self, level: ValidationLevel, scope: &ValidationScope) -> CheckOutcome;
}

/// Per-level requirement. Regression is should-pass by default, every other
/// level must pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationPolicy {
    pub syntax: Requirement,
    pub build: Requirement,
    pub runtime: Requirement,
    pub integration: Requirement,
    pub regression: Requirement,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            syntax: Requirement::MustPass,
            build: Requirement::MustPass,
            runtime: Requirement::MustPass,
            integration: Requirement::MustPass,
            regression: Requirement::ShouldPass,
        }
    }
}

impl ValidationPolicy {
    pub fn requirement(&self, level: ValidationLevel) -> Requirement {
        match level {
            ValidationLevel::Syntax => self.syntax,
            ValidationLevel::Build => self.build,
            ValidationLevel::Runtime => self.runtime,
            ValidationLevel::Integration => self.integration,
            ValidationLevel::Regression => self.regression,
        }
    }
}

/// Results of one stage, in level order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageVerdict {
    pub results: Vec<ValidationResult>,
}

impl StageVerdict {
    /// First failed must-pass level, if any.
    pub fn blocking_failure(&self) -> Option<&ValidationResult> {
        self.results.iter().find(|r| r.is_blocking())
    }

    pub fn passed(&self) -> bool {
        self.blocking_failure().is_none()
    }
}

#[derive(Clone)]
pub struct ValidationGate {
    validator: Arc<dyn Validator>,
    policy: ValidationPolicy,
    timeout: Duration,
}

impl std::fmt::Debug for ValidationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationGate")
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ValidationGate {
    pub fn new(validator: Arc<dyn Validator>, policy: ValidationPolicy, timeout: Duration) -> Self {
        Self {
            validator,
            policy,
            timeout,
        }
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Run one level. A validator that overruns the timeout fails the level.
    #[instrument(skip(self, scope), fields(scope = %scope.label()))]
    pub async fn run(&self, level: ValidationLevel, scope: &ValidationScope) -> ValidationResult {
        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, self.validator.run(level, scope)).await {
            Ok(outcome) => outcome,
            Err(_) => CheckOutcome::fail(format!(
                "{level} validation timed out after {}ms",
                self.timeout.as_millis()
            )),
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        obs::emit_validation_finished(level, &scope.label(), outcome.passed, duration_ms);

        ValidationResult {
            level,
            scope: scope.clone(),
            requirement: self.policy.requirement(level),
            passed: outcome.passed,
            detail: outcome.detail,
            duration_ms,
            checked_at: Utc::now(),
        }
    }

    /// Run every level of `stage` in order, stopping after the first
    /// must-pass failure.
    pub async fn run_stage(&self, stage: ValidationStage, scope: &ValidationScope) -> StageVerdict {
        let mut verdict = StageVerdict::default();
        for &level in stage.levels() {
            let result = self.run(level, scope).await;
            let blocking = result.is_blocking();
            verdict.results.push(result);
            if blocking {
                break;
            }
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::IssueId;
    use std::sync::Mutex;

    struct Fixed {
        failing: Vec<ValidationLevel>,
        calls: Mutex<Vec<ValidationLevel>>,
    }

    #[async_trait]
    impl Validator for Fixed {
        async fn run(&self, level: ValidationLevel, _scope: &ValidationScope) -> CheckOutcome {
            self.calls.lock().unwrap().push(level);
            if self.failing.contains(&level) {
                CheckOutcome::fail(format!("{level} broke"))
            } else {
                CheckOutcome::pass()
            }
        }
    }

    struct Hangs;

    #[async_trait]
    impl Validator for Hangs {
        async fn run(&self, _level: ValidationLevel, _scope: &ValidationScope) -> CheckOutcome {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            CheckOutcome::pass()
        }
    }

    fn fix_scope() -> ValidationScope {
        ValidationScope::Fix {
            issue: IssueId::from("C"),
            attempt: 1,
            files: vec![],
        }
    }

    #[tokio::test]
    async fn test_must_pass_failure_stops_stage() {
        let v = Arc::new(Fixed {
            failing: vec![ValidationLevel::Syntax],
            calls: Mutex::new(vec![]),
        });
        let gate = ValidationGate::new(v.clone(), ValidationPolicy::default(), Duration::from_secs(5));

        let verdict = gate.run_stage(ValidationStage::Fix, &fix_scope()).await;
        assert!(!verdict.passed());
        assert_eq!(verdict.blocking_failure().unwrap().level, ValidationLevel::Syntax);
        assert_eq!(*v.calls.lock().unwrap(), vec![ValidationLevel::Syntax]);
    }

    #[tokio::test]
    async fn test_should_pass_failure_is_recorded_not_blocking() {
        let v = Arc::new(Fixed {
            failing: vec![ValidationLevel::Regression],
            calls: Mutex::new(vec![]),
        });
        let gate = ValidationGate::new(v, ValidationPolicy::default(), Duration::from_secs(5));
        let scope = ValidationScope::Phase {
            phase: "p1".into(),
            issues: vec![],
        };

        let verdict = gate.run_stage(ValidationStage::Phase, &scope).await;
        assert!(verdict.passed());
        assert_eq!(verdict.results.len(), 2);
        assert!(!verdict.results[1].passed);
        assert_eq!(verdict.results[1].requirement, Requirement::ShouldPass);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_level() {
        let gate = ValidationGate::new(Arc::new(Hangs), ValidationPolicy::default(), Duration::from_millis(50));
        let result = gate.run(ValidationLevel::Build, &fix_scope()).await;
        assert!(!result.passed);
        assert!(result.detail.contains("timed out"));
        assert!(result.is_blocking());
    }

    #[test]
    fn test_policy_deserializes_partial_table() {
        let policy: ValidationPolicy = toml::from_str(r#"build = "should_pass""#).unwrap();
        assert_eq!(policy.requirement(ValidationLevel::Build), Requirement::ShouldPass);
        assert_eq!(policy.requirement(ValidationLevel::Syntax), Requirement::MustPass);
        assert_eq!(policy.requirement(ValidationLevel::Regression), Requirement::ShouldPass);
    }
}
