//! Multi-level rollback.
//!
//! A rollback suspends dispatch inside its scope, waits for in-flight fixes in
//! that scope, restores backups most-recent-first, moves the affected issues
//! to RolledBack and records a [`RollbackEvent`]. Each scope is rolled back at
//! most once; repeating a request is a no-op that emits nothing.
//!
//! Fix-level rollbacks run inside the fix task while it still holds its file
//! locks. Coarser rollbacks take the locks of every file they restore and
//! widen to any later backup of those files, so a restore never clobbers a
//! fix it does not also undo. Fixes outside the scope that still hold one of
//! those files are waited out; contention alone never fails a rollback.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::backup::{Backup, BackupStore};
use crate::bus::{BusEvent, MessageBus};
use crate::domain::{AgentId, IssueId, IssueStatus, RollbackEvent, RollbackLevel, RollbackScope};
use crate::error::{EngineError, EngineResult};
use crate::locks::{ConflictDetector, LockGuard};
use crate::metrics::METRICS;
use crate::obs;
use crate::state::SharedState;
use crate::worktree::WorkTree;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A fix that has been handed to a task and not yet finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flight {
    pub issue: IssueId,
    pub attempt: u32,
    pub agent: AgentId,
    pub phase: String,
    /// Files the issue declares.
    pub files: BTreeSet<PathBuf>,
}

impl Flight {
    fn within(&self, scope: &RollbackScope) -> bool {
        match scope {
            RollbackScope::Fix { issue, attempt } => &self.issue == issue && self.attempt == *attempt,
            RollbackScope::Agent { agent, phase } => &self.agent == agent && &self.phase == phase,
            RollbackScope::Phase { phase, .. } => &self.phase == phase,
            RollbackScope::Complete => true,
        }
    }
}

/// Registry of running fix tasks.
#[derive(Debug, Default)]
pub struct InFlight {
    next: AtomicU64,
    flights: Mutex<HashMap<u64, Flight>>,
    changed: Notify,
}

impl InFlight {
    pub fn begin(self: &Arc<Self>, flight: Flight) -> FlightGuard {
        let token = self.next.fetch_add(1, Ordering::SeqCst);
        lock(&self.flights).insert(token, flight);
        FlightGuard {
            registry: Arc::clone(self),
            token,
        }
    }

    pub fn count(&self) -> usize {
        lock(&self.flights).len()
    }

    fn any_within(&self, scope: &RollbackScope) -> bool {
        lock(&self.flights).values().any(|f| f.within(scope))
    }

    /// A flight outside `scope` that declares one of `paths`.
    fn overlapping(&self, scope: &RollbackScope, paths: &BTreeSet<PathBuf>) -> Option<IssueId> {
        lock(&self.flights)
            .values()
            .find(|f| !f.within(scope) && !f.files.is_disjoint(paths))
            .map(|f| f.issue.clone())
    }

    /// Wait until no flight inside `scope` remains.
    pub async fn wait_clear(&self, scope: &RollbackScope) {
        self.wait_until(|| !self.any_within(scope)).await;
    }

    /// Wait until no flight outside `scope` declares any of `paths`.
    pub async fn wait_disjoint(&self, scope: &RollbackScope, paths: &BTreeSet<PathBuf>) {
        self.wait_until(|| match self.overlapping(scope, paths) {
            Some(issue) => {
                debug!(scope = %scope, peer = %issue, "waiting for overlapping fix");
                false
            }
            None => true,
        })
        .await;
    }

    async fn wait_until(&self, mut done: impl FnMut() -> bool) {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            if done() {
                return;
            }
            changed.await;
        }
    }
}

/// Deregisters its flight on drop.
#[derive(Debug)]
pub struct FlightGuard {
    registry: Arc<InFlight>,
    token: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        lock(&self.registry.flights).remove(&self.token);
        self.registry.changed.notify_waiters();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Suspension {
    Agent { agent: AgentId, phase: String },
    Phase(String),
    All,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RollbackOutcome {
    Applied(RollbackEvent),
    /// The scope was already rolled back; nothing happened.
    AlreadyRolledBack,
}

impl RollbackOutcome {
    pub fn event(&self) -> Option<&RollbackEvent> {
        match self {
            Self::Applied(e) => Some(e),
            Self::AlreadyRolledBack => None,
        }
    }
}

pub struct RollbackManager {
    state: Arc<SharedState>,
    backups: Arc<BackupStore>,
    locks: ConflictDetector,
    worktree: Arc<dyn WorkTree>,
    bus: Option<MessageBus>,
    in_flight: Arc<InFlight>,
    lock_timeout: Duration,
    suspended: Mutex<HashSet<Suspension>>,
    done: Mutex<HashSet<RollbackScope>>,
    /// Serialises coarse rollbacks against each other.
    coarse: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for RollbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackManager")
            .field("completed", &lock(&self.done).len())
            .finish_non_exhaustive()
    }
}

impl RollbackManager {
    pub fn new(
        state: Arc<SharedState>,
        backups: Arc<BackupStore>,
        locks: ConflictDetector,
        worktree: Arc<dyn WorkTree>,
        in_flight: Arc<InFlight>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            state,
            backups,
            locks,
            worktree,
            bus: None,
            in_flight,
            lock_timeout,
            suspended: Mutex::new(HashSet::new()),
            done: Mutex::new(HashSet::new()),
            coarse: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_bus(mut self, bus: MessageBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Whether dispatch to `agent` within `phase` is currently suspended.
    pub fn is_suspended(&self, agent: &AgentId, phase: &str) -> bool {
        let suspended = lock(&self.suspended);
        suspended.contains(&Suspension::All)
            || suspended.contains(&Suspension::Phase(phase.to_string()))
            || suspended.contains(&Suspension::Agent {
                agent: agent.clone(),
                phase: phase.to_string(),
            })
    }

    pub fn is_rolled_back(&self, scope: &RollbackScope) -> bool {
        lock(&self.done).contains(scope)
    }

    /// Lift phase and agent suspensions for `phase` so it can run again.
    /// Agent scopes of the phase become eligible for rollback again.
    pub fn reopen_phase(&self, phase: &str) {
        lock(&self.suspended).retain(|s| match s {
            Suspension::Phase(p) | Suspension::Agent { phase: p, .. } => p != phase,
            Suspension::All => true,
        });
        lock(&self.done).retain(|s| !matches!(s, RollbackScope::Agent { phase: p, .. } if p == phase));
    }

    fn suspend(&self, scope: &RollbackScope) {
        let key = match scope {
            RollbackScope::Fix { .. } => return,
            RollbackScope::Agent { agent, phase } => Suspension::Agent {
                agent: agent.clone(),
                phase: phase.clone(),
            },
            RollbackScope::Phase { phase, .. } => Suspension::Phase(phase.clone()),
            RollbackScope::Complete => Suspension::All,
        };
        lock(&self.suspended).insert(key);
    }

    fn backups_in(&self, scope: &RollbackScope) -> Vec<Backup> {
        match scope {
            RollbackScope::Fix { issue, attempt } => self.backups.for_attempt(issue, *attempt),
            RollbackScope::Agent { agent, phase } => self.backups.for_agent(agent, phase),
            RollbackScope::Phase { phase, .. } => self.backups.for_phase(phase),
            RollbackScope::Complete => self.backups.all(),
        }
    }

    /// Backups of `scope` plus every later backup of a file they cover,
    /// to a fixpoint.
    fn cascade(&self, scope: &RollbackScope) -> Vec<Backup> {
        let mut set: Vec<Backup> = self.backups_in(scope);
        if scope.level() == RollbackLevel::Fix {
            return set;
        }
        let mut ids: HashSet<u64> = set.iter().map(|b| b.id).collect();
        loop {
            let Some(first) = set.iter().map(|b| b.id).min() else {
                return set;
            };
            let paths: BTreeSet<PathBuf> = set.iter().map(|b| b.path.clone()).collect();
            let extra: Vec<Backup> = self
                .backups
                .touching_after(&paths, first)
                .into_iter()
                .filter(|b| !ids.contains(&b.id))
                .collect();
            if extra.is_empty() {
                return set;
            }
            ids.extend(extra.iter().map(|b| b.id));
            set.extend(extra);
        }
    }

    /// Take locks on every file the rollback restores.
    ///
    /// Peers outside the scope that declare a restored file are waited out
    /// first; each is bounded by its own lock, agent and validation timeouts.
    /// An expired lock wait re-plans instead of failing. Re-plans also when a
    /// fix that finished while we waited widened the set.
    async fn lock_restore_set(&self, scope: &RollbackScope) -> (Vec<Backup>, LockGuard) {
        let label = format!("rollback:{scope}");
        loop {
            let planned = self.cascade(scope);
            let paths: BTreeSet<PathBuf> = planned.iter().map(|b| b.path.clone()).collect();
            self.in_flight.wait_disjoint(scope, &paths).await;

            let guard = match self
                .locks
                .acquire(&label, paths.iter().cloned(), self.lock_timeout)
                .await
            {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(scope = %scope, error = %e, "rollback still waiting for file locks");
                    continue;
                }
            };
            let settled = self.cascade(scope);
            if settled.iter().all(|b| paths.contains(&b.path)) {
                return (settled, guard);
            }
            debug!(scope = %scope, "restore set widened while waiting for locks; re-planning");
        }
    }

    /// Issues whose status moves to RolledBack, with the attempt to close.
    async fn affected_issues(&self, scope: &RollbackScope, restored: &[Backup]) -> Vec<(IssueId, u32)> {
        let view = self.state.snapshot().await;
        let closable = |status: IssueStatus| matches!(status, IssueStatus::Fixed | IssueStatus::Failed);

        let mut affected: BTreeSet<(IssueId, u32)> = BTreeSet::new();
        for b in restored {
            affected.insert((b.issue.clone(), b.attempt));
        }
        for (id, issue) in &view.issues {
            let in_scope = match scope {
                RollbackScope::Fix { issue: i, attempt } => i == id && issue.attempt == *attempt,
                RollbackScope::Agent { agent, phase } => {
                    issue.agent.as_ref() == Some(agent) && &issue.phase == phase
                }
                RollbackScope::Phase { phase, .. } => &issue.phase == phase,
                RollbackScope::Complete => true,
            };
            if in_scope {
                affected.insert((id.clone(), issue.attempt));
            }
        }

        affected
            .into_iter()
            .filter(|(id, attempt)| {
                view.issues
                    .get(id)
                    .is_some_and(|v| v.attempt == *attempt && closable(v.status))
            })
            .collect()
    }

    /// Roll back `scope`.
    ///
    /// For `RollbackScope::Fix` the caller must hold the fix's file locks.
    /// A restore that fails is returned as [`EngineError::RollbackFailure`];
    /// the scope is then not marked done. Waiting on locks is never a failure.
    #[instrument(skip(self, scope), fields(scope = %scope))]
    pub async fn rollback(&self, scope: RollbackScope, reason: &str) -> EngineResult<RollbackOutcome> {
        if self.is_rolled_back(&scope) {
            debug!(scope = %scope, "scope already rolled back");
            return Ok(RollbackOutcome::AlreadyRolledBack);
        }

        let level = scope.level();
        let _serial = match level {
            RollbackLevel::Fix => None,
            _ => Some(self.coarse.lock().await),
        };
        // Re-check after waiting behind another coarse rollback.
        if self.is_rolled_back(&scope) {
            return Ok(RollbackOutcome::AlreadyRolledBack);
        }

        self.suspend(&scope);
        if level != RollbackLevel::Fix {
            self.in_flight.wait_clear(&scope).await;
        }

        let (mut restore_set, _guard) = match level {
            RollbackLevel::Fix => (self.cascade(&scope), None),
            _ => {
                let (set, guard) = self.lock_restore_set(&scope).await;
                (set, Some(guard))
            }
        };
        restore_set.sort_by(|a, b| b.id.cmp(&a.id));

        let mut restored = Vec::with_capacity(restore_set.len());
        for backup in &restore_set {
            let entry = self
                .backups
                .restore(self.worktree.as_ref(), backup)
                .await
                .map_err(|e| EngineError::RollbackFailure {
                    scope: scope.to_string(),
                    detail: format!("restoring {}: {e}", backup.path.display()),
                })?;
            restored.push(entry);
        }

        let affected = self.affected_issues(&scope, &restore_set).await;
        let event = RollbackEvent {
            id: Uuid::new_v4(),
            level,
            scope: scope.clone(),
            reason: reason.to_string(),
            issues: affected.iter().map(|(id, _)| id.clone()).collect(),
            restored,
            at: Utc::now(),
        };
        for (issue, attempt) in &affected {
            self.state.mark_rolled_back(issue, *attempt, event.id).await?;
        }
        self.state.record_rollback(event.clone()).await?;

        let ids: Vec<u64> = restore_set.iter().map(|b| b.id).collect();
        self.backups.release(&ids).await?;
        lock(&self.done).insert(scope.clone());

        METRICS.inc_rollbacks();
        obs::emit_rollback_applied(level, &scope.to_string(), event.restored.len(), event.issues.len());
        if let Some(bus) = &self.bus {
            bus.publish(BusEvent::RollbackTriggered {
                level,
                scope,
                reason: reason.to_string(),
            });
        }
        Ok(RollbackOutcome::Applied(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupOwner;
    use crate::domain::{FixRecord, Issue, Severity};
    use crate::error::FixError;
    use crate::worktree::MemoryWorkTree;
    use mender_state::MemoryCasStore;
    use std::path::Path;

    struct Harness {
        state: Arc<SharedState>,
        backups: Arc<BackupStore>,
        tree: Arc<MemoryWorkTree>,
        locks: ConflictDetector,
        in_flight: Arc<InFlight>,
        manager: RollbackManager,
    }

    fn harness(tree: MemoryWorkTree) -> Harness {
        harness_with(tree, Duration::from_secs(5))
    }

    fn harness_with(tree: MemoryWorkTree, lock_timeout: Duration) -> Harness {
        let state = Arc::new(SharedState::new());
        let backups = Arc::new(BackupStore::new(Arc::new(MemoryCasStore::new())));
        let tree = Arc::new(tree);
        let locks = ConflictDetector::new();
        let in_flight = Arc::new(InFlight::default());
        let manager = RollbackManager::new(
            state.clone(),
            backups.clone(),
            locks.clone(),
            tree.clone(),
            in_flight.clone(),
            lock_timeout,
        );
        Harness {
            state,
            backups,
            tree,
            locks,
            in_flight,
            manager,
        }
    }

    /// Submit, claim, back up, mutate and finish one issue.
    async fn apply_fix(h: &Harness, id: &str, agent: &str, file: &str, content: &str, fixed: bool) {
        let issue = Issue::new(id, "a11y", Severity::High).with_file(file);
        let iid = issue.id.clone();
        let agent = AgentId::from(agent);
        h.state.submit(issue, "p1").await.unwrap();
        h.state.claim(&iid, 1, &agent).await.unwrap();
        let owner = BackupOwner {
            issue: iid.clone(),
            attempt: 1,
            agent: agent.clone(),
            phase: "p1".into(),
        };
        let taken = h
            .backups
            .snapshot(h.tree.as_ref(), &owner, [Path::new(file)])
            .await
            .unwrap();
        h.tree.write(Path::new(file), content.as_bytes()).await.unwrap();
        if fixed {
            h.state
                .record_fix(FixRecord {
                    issue: iid,
                    attempt: 1,
                    agent,
                    phase: "p1".into(),
                    started_at: Utc::now(),
                    finished_at: Utc::now(),
                    files_modified: vec![file.into()],
                    backups: taken.iter().map(|b| b.id).collect(),
                    validation: vec![],
                })
                .await
                .unwrap();
        } else {
            h.state
                .record_failure(
                    &iid,
                    1,
                    Some(&agent),
                    FixError::AgentReported {
                        diagnostic: "bad".into(),
                    },
                    vec![],
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_fix_rollback_restores_and_marks_rolled_back() {
        let h = harness(MemoryWorkTree::new().with_file("f1", "orig"));
        apply_fix(&h, "C", "a", "f1", "broken", false).await;

        let scope = RollbackScope::Fix {
            issue: IssueId::from("C"),
            attempt: 1,
        };
        let outcome = h.manager.rollback(scope, "build failed").await.unwrap();
        let event = outcome.event().unwrap();

        assert_eq!(h.tree.contents("f1").as_deref(), Some("orig"));
        assert_eq!(event.issues, vec![IssueId::from("C")]);
        assert_eq!(event.restored.len(), 1);
        let view = h.state.get_issue(&IssueId::from("C")).await.unwrap();
        assert_eq!(view.status, IssueStatus::RolledBack);
        assert_eq!(h.state.snapshot().await.rollbacks.len(), 1);
        assert!(h.backups.is_empty());
    }

    #[tokio::test]
    async fn test_second_rollback_of_same_scope_is_noop() {
        let h = harness(MemoryWorkTree::new().with_file("f1", "orig"));
        apply_fix(&h, "C", "a", "f1", "broken", false).await;
        let scope = RollbackScope::Fix {
            issue: IssueId::from("C"),
            attempt: 1,
        };
        h.manager.rollback(scope.clone(), "first").await.unwrap();
        let entries_before = h.state.len().await;

        h.tree.write(Path::new("f1"), b"touched later").await.unwrap();
        let again = h.manager.rollback(scope, "second").await.unwrap();

        assert_eq!(again, RollbackOutcome::AlreadyRolledBack);
        assert_eq!(h.state.len().await, entries_before);
        assert_eq!(h.tree.contents("f1").as_deref(), Some("touched later"));
    }

    #[tokio::test]
    async fn test_agent_rollback_cascades_to_later_fix_on_same_file() {
        let h = harness(MemoryWorkTree::new().with_file("f1", "v0").with_file("f9", "other"));
        apply_fix(&h, "A", "agent-1", "f1", "v1", true).await;
        apply_fix(&h, "B", "agent-2", "f1", "v2", true).await;
        apply_fix(&h, "Z", "agent-2", "f9", "other-2", true).await;

        let scope = RollbackScope::Agent {
            agent: AgentId::from("agent-1"),
            phase: "p1".into(),
        };
        let outcome = h.manager.rollback(scope, "runtime failed").await.unwrap();
        let event = outcome.event().unwrap();

        // Most recent first: B's backup (v1) then A's (v0).
        assert_eq!(h.tree.contents("f1").as_deref(), Some("v0"));
        assert_eq!(event.restored[0].issue, IssueId::from("B"));
        assert_eq!(event.issues, vec![IssueId::from("A"), IssueId::from("B")]);
        // Unrelated fix untouched.
        assert_eq!(h.tree.contents("f9").as_deref(), Some("other-2"));
        let z = h.state.get_issue(&IssueId::from("Z")).await.unwrap();
        assert_eq!(z.status, IssueStatus::Fixed);

        assert!(h.manager.is_suspended(&AgentId::from("agent-1"), "p1"));
        assert!(!h.manager.is_suspended(&AgentId::from("agent-2"), "p1"));
        assert!(h.locks.is_idle());
    }

    #[tokio::test]
    async fn test_phase_rollback_waits_for_in_flight_fix() {
        let h = Arc::new(harness(MemoryWorkTree::new().with_file("f1", "v0")));
        apply_fix(&h, "A", "agent-1", "f1", "v1", true).await;

        let guard = h.in_flight.begin(Flight {
            issue: IssueId::from("B"),
            attempt: 1,
            agent: AgentId::from("agent-1"),
            phase: "p1".into(),
            files: BTreeSet::new(),
        });
        let task = {
            let h = h.clone();
            tokio::spawn(async move {
                h.manager
                    .rollback(
                        RollbackScope::Phase {
                            phase: "p1".into(),
                            round: 0,
                        },
                        "integration failed",
                    )
                    .await
            })
        };
        // The phase is suspended for every agent while the rollback waits.
        while !h.manager.is_suspended(&AgentId::from("agent-9"), "p1") {
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;
        assert!(!task.is_finished());

        drop(guard);
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.event().unwrap().level, RollbackLevel::Phase);
        assert_eq!(h.tree.contents("f1").as_deref(), Some("v0"));
        assert_eq!(h.in_flight.count(), 0);
    }

    #[tokio::test]
    async fn test_agent_rollback_outwaits_peer_holding_cascaded_file() {
        let h = Arc::new(harness_with(
            MemoryWorkTree::new().with_file("f1", "v0"),
            Duration::from_millis(20),
        ));
        apply_fix(&h, "A", "agent-1", "f1", "v1", true).await;

        // B from another agent is mid-fix on the same file.
        let b = IssueId::from("B");
        let agent_2 = AgentId::from("agent-2");
        h.state
            .submit(Issue::new("B", "a11y", Severity::High).with_file("f1"), "p1")
            .await
            .unwrap();
        let flight = h.in_flight.begin(Flight {
            issue: b.clone(),
            attempt: 1,
            agent: agent_2.clone(),
            phase: "p1".into(),
            files: [PathBuf::from("f1")].into(),
        });
        let held = h
            .locks
            .acquire("B", ["f1"], Duration::from_millis(20))
            .await
            .unwrap();
        h.state.claim(&b, 1, &agent_2).await.unwrap();
        let owner = BackupOwner {
            issue: b.clone(),
            attempt: 1,
            agent: agent_2.clone(),
            phase: "p1".into(),
        };
        let taken = h
            .backups
            .snapshot(h.tree.as_ref(), &owner, [Path::new("f1")])
            .await
            .unwrap();
        h.tree.write(Path::new("f1"), b"v2").await.unwrap();

        let task = {
            let h = h.clone();
            tokio::spawn(async move {
                h.manager
                    .rollback(
                        RollbackScope::Agent {
                            agent: AgentId::from("agent-1"),
                            phase: "p1".into(),
                        },
                        "runtime failed",
                    )
                    .await
            })
        };
        // Several lock timeouts pass while B is still running.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!task.is_finished());

        h.state
            .record_fix(FixRecord {
                issue: b.clone(),
                attempt: 1,
                agent: agent_2,
                phase: "p1".into(),
                started_at: Utc::now(),
                finished_at: Utc::now(),
                files_modified: vec!["f1".into()],
                backups: taken.iter().map(|b| b.id).collect(),
                validation: vec![],
            })
            .await
            .unwrap();
        held.release();
        drop(flight);

        let outcome = task.await.unwrap().unwrap();
        let event = outcome.event().unwrap();
        assert_eq!(event.issues, vec![IssueId::from("A"), b.clone()]);
        assert_eq!(h.tree.contents("f1").as_deref(), Some("v0"));
        let view = h.state.get_issue(&b).await.unwrap();
        assert_eq!(view.status, IssueStatus::RolledBack);
        assert!(h.locks.is_idle());
    }

    #[tokio::test]
    async fn test_reopen_phase_clears_agent_suspension() {
        let h = harness(MemoryWorkTree::new().with_file("f1", "v0"));
        apply_fix(&h, "A", "agent-1", "f1", "v1", true).await;
        let scope = RollbackScope::Agent {
            agent: AgentId::from("agent-1"),
            phase: "p1".into(),
        };
        h.manager.rollback(scope.clone(), "x").await.unwrap();
        h.manager.reopen_phase("p1");
        assert!(!h.manager.is_suspended(&AgentId::from("agent-1"), "p1"));
        assert!(!h.manager.is_rolled_back(&scope));
    }
}
