//! Scripted collaborators for tests and dry runs.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::agents::FixAgent;
use crate::domain::{AgentId, FixOutcome, Issue, IssueId, ValidationLevel, ValidationScope};
use crate::validation::{CheckOutcome, Validator};
use crate::worktree::WorkTree;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One scripted attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    /// Write every declared file and report success.
    Succeed,
    /// Write every declared file, then report failure.
    Fail(String),
    /// Never return.
    Hang,
    /// Succeed but also claim to have touched an undeclared file.
    TouchUndeclared(PathBuf),
}

/// Agent whose behaviour per issue is scripted attempt by attempt.
/// Issues without a script (or with an exhausted one) succeed.
pub struct ScriptedAgent {
    name: String,
    worktree: Option<Arc<dyn WorkTree>>,
    delay: Duration,
    scripts: Mutex<HashMap<IssueId, VecDeque<Script>>>,
    calls: Mutex<Vec<IssueId>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            worktree: None,
            delay: Duration::ZERO,
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Make fixes visible by writing `"<issue> fixed by <agent>"` to files.
    pub fn writing_to(mut self, worktree: Arc<dyn WorkTree>) -> Self {
        self.worktree = Some(worktree);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(self, issue: &str, steps: impl IntoIterator<Item = Script>) -> Self {
        lock(&self.scripts)
            .entry(IssueId::from(issue))
            .or_default()
            .extend(steps);
        self
    }

    /// Issues in the order their attempts started.
    pub fn calls(&self) -> Vec<IssueId> {
        lock(&self.calls).clone()
    }

    /// Highest number of attempts that ran at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn write_files(&self, issue: &Issue) {
        let Some(tree) = &self.worktree else {
            return;
        };
        let body = format!("{} fixed by {}", issue.id, self.name);
        for path in &issue.files {
            // Write errors surface later as validation failures.
            let _ = tree.write(path, body.as_bytes()).await;
        }
    }
}

struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl FixAgent for ScriptedAgent {
    async fn attempt_fix(&self, issue: &Issue) -> FixOutcome {
        lock(&self.calls).push(issue.id.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _running = Running(&self.running);

        let step = lock(&self.scripts)
            .get_mut(&issue.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Script::Succeed);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match step {
            Script::Succeed => {
                self.write_files(issue).await;
                FixOutcome::success(issue.files.iter().cloned())
            }
            Script::Fail(diagnostic) => {
                self.write_files(issue).await;
                FixOutcome::failure(diagnostic)
            }
            Script::Hang => {
                std::future::pending::<()>().await;
                FixOutcome::failure("unreachable")
            }
            Script::TouchUndeclared(path) => {
                self.write_files(issue).await;
                let mut touched: Vec<PathBuf> = issue.files.iter().cloned().collect();
                touched.push(path);
                FixOutcome::success(touched)
            }
        }
    }
}

/// Which validation scopes a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeMatch {
    Any,
    Issue(IssueId),
    Agent(AgentId),
    Phase(String),
}

impl ScopeMatch {
    fn matches(&self, scope: &ValidationScope) -> bool {
        match (self, scope) {
            (Self::Any, _) => true,
            (Self::Issue(id), ValidationScope::Fix { issue, .. }) => id == issue,
            (Self::Agent(id), ValidationScope::Batch { agent, .. }) => id == agent,
            (Self::Phase(name), ValidationScope::Batch { phase, .. })
            | (Self::Phase(name), ValidationScope::Phase { phase, .. }) => name == phase,
            _ => false,
        }
    }
}

#[derive(Debug)]
struct Rule {
    level: ValidationLevel,
    scope: ScopeMatch,
    /// `None` fails forever.
    remaining: Option<u32>,
}

/// Validator that passes everything except the failures it is told about.
#[derive(Debug, Default)]
pub struct ScriptedValidator {
    rules: Mutex<Vec<Rule>>,
    delay: Duration,
    calls: Mutex<Vec<(ValidationLevel, String)>>,
}

impl ScriptedValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail `level` for matching scopes, every time.
    pub fn fail(self, level: ValidationLevel, scope: ScopeMatch) -> Self {
        lock(&self.rules).push(Rule {
            level,
            scope,
            remaining: None,
        });
        self
    }

    /// Fail `level` for matching scopes the next `times` times.
    pub fn fail_times(self, level: ValidationLevel, scope: ScopeMatch, times: u32) -> Self {
        lock(&self.rules).push(Rule {
            level,
            scope,
            remaining: Some(times),
        });
        self
    }

    /// `(level, scope label)` per call, in call order.
    pub fn calls(&self) -> Vec<(ValidationLevel, String)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl Validator for ScriptedValidator {
    async fn run(&self, level: ValidationLevel, scope: &ValidationScope) -> CheckOutcome {
        lock(&self.calls).push((level, scope.label()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut rules = lock(&self.rules);
        let hit = rules
            .iter_mut()
            .find(|r| r.level == level && r.scope.matches(scope) && r.remaining != Some(0));
        match hit {
            Some(rule) => {
                if let Some(n) = rule.remaining.as_mut() {
                    *n -= 1;
                }
                CheckOutcome::fail(format!("scripted {level} failure for {}", scope.label()))
            }
            None => CheckOutcome::pass(),
        }
    }
}
