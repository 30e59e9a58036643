//! Failure handling: fix, agent, phase and complete rollback, abort and
//! operator resume.

use std::sync::Arc;
use std::time::Duration;

use mender_core::fakes::{Script, ScopeMatch, ScriptedAgent, ScriptedValidator};
use mender_core::state::AuditEvent;
use mender_core::{
    AgentId, AgentRegistry, AgentSpec, BackupRetention, EngineConfig, EngineError,
    EngineSettings, FixEngine, FixError, Issue, IssueCatalog, IssueId, IssueStatus,
    MemoryWorkTree, PhaseFailurePolicy, PhaseStatus, ResumeDirective, RollbackLevel,
    RollbackOutcome, RunOutcome, Severity, ValidationLevel,
};

fn id(s: &str) -> IssueId {
    IssueId::from(s)
}

fn config(settings: EngineSettings) -> EngineConfig {
    EngineConfig::default()
        .with_phase("quality", ["a11y", "lint"])
        .with_settings(settings)
}

struct Harness {
    engine: FixEngine,
    tree: Arc<MemoryWorkTree>,
}

fn harness(
    config: EngineConfig,
    tree: MemoryWorkTree,
    agents: Vec<(AgentSpec, ScriptedAgent)>,
    validator: ScriptedValidator,
) -> (Harness, Vec<Arc<ScriptedAgent>>) {
    let tree = Arc::new(tree);
    let mut registry = AgentRegistry::new();
    let mut handles = Vec::new();
    for (spec, agent) in agents {
        let agent = Arc::new(agent.writing_to(tree.clone()));
        registry.register(spec, agent.clone()).unwrap();
        handles.push(agent);
    }
    let engine = FixEngine::new(config, registry, Arc::new(validator), tree.clone()).unwrap();
    (Harness { engine, tree }, handles)
}

#[tokio::test]
async fn failed_build_validation_restores_files_and_blocks_phase() {
    let validator = ScriptedValidator::new().fail_times(
        ValidationLevel::Build,
        ScopeMatch::Issue(id("C")),
        1,
    );
    let (mut h, _) = harness(
        config(EngineSettings::default()),
        MemoryWorkTree::new().with_file("f4", "original"),
        vec![(AgentSpec::new("fixer", ["a11y"], 1), ScriptedAgent::new("fixer"))],
        validator,
    );
    h.engine
        .submit_issues(IssueCatalog::new(vec![
            Issue::new("C", "a11y", Severity::High).with_file("f4")
        ]))
        .await
        .unwrap();

    let err = h.engine.run().await.unwrap_err();
    assert!(
        matches!(&err, EngineError::PhaseBlocked { unresolved, .. } if unresolved == &vec![id("C")]),
        "{err}"
    );
    assert_eq!(h.tree.contents("f4").as_deref(), Some("original"));

    let view = h.engine.state().snapshot().await;
    let c = &view.issues[&id("C")];
    assert_eq!(c.status, IssueStatus::RolledBack);
    assert!(matches!(
        c.failure,
        Some(FixError::ValidationFailure {
            level: ValidationLevel::Build,
            ..
        })
    ));
    assert_eq!(view.phase_status("quality"), PhaseStatus::Running);
    let event = view.rollbacks.last().unwrap();
    assert_eq!(event.level, RollbackLevel::Fix);
    assert_eq!(event.issues, vec![id("C")]);
    assert_eq!(event.restored.len(), 1);

    let snapshot = h.engine.get_state().await;
    assert!(snapshot.resumable);
    assert!(matches!(
        h.engine.run().await,
        Err(EngineError::Halted { .. })
    ));

    h.engine
        .resume(ResumeDirective::RetryIssues(vec![id("C")]))
        .await
        .unwrap();
    let report = h.engine.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    let c = report.issue(&id("C")).unwrap();
    assert_eq!(c.status, IssueStatus::Fixed);
    assert_eq!(c.attempts, 2);
    assert_eq!(h.tree.contents("f4").as_deref(), Some("C fixed by fixer"));
}

#[tokio::test]
async fn excluding_a_blocked_issue_cascades_to_its_dependents() {
    let validator =
        ScriptedValidator::new().fail(ValidationLevel::Build, ScopeMatch::Issue(id("C")));
    let (mut h, agents) = harness(
        config(EngineSettings::default()),
        MemoryWorkTree::new().with_file("f4", "original"),
        vec![(AgentSpec::new("fixer", ["a11y"], 1), ScriptedAgent::new("fixer"))],
        validator,
    );
    h.engine
        .submit_issues(IssueCatalog::new(vec![
            Issue::new("C", "a11y", Severity::High).with_file("f4"),
            Issue::new("D", "a11y", Severity::Low)
                .with_file("f5")
                .with_dependency("C"),
        ]))
        .await
        .unwrap();

    match h.engine.run().await {
        Err(EngineError::PhaseBlocked { unresolved, .. }) => {
            assert_eq!(unresolved, vec![id("C"), id("D")]);
        }
        other => panic!("expected PhaseBlocked, got {other:?}"),
    }

    let unknown = h
        .engine
        .resume(ResumeDirective::ExcludeIssues(vec![id("nope")]))
        .await;
    assert!(matches!(unknown, Err(EngineError::UnknownIssue { .. })));

    h.engine
        .resume(ResumeDirective::ExcludeIssues(vec![id("C")]))
        .await
        .unwrap();
    let report = h.engine.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.summary.excluded, 2);
    let d = report.issue(&id("D")).unwrap();
    assert_eq!(d.status, IssueStatus::Failed);
    assert_eq!(
        d.failure,
        Some(FixError::DependencyExcluded { dependency: id("C") })
    );
    assert_eq!(agents[0].calls(), vec![id("C")]);
    assert_eq!(h.tree.contents("f4").as_deref(), Some("original"));
}

#[tokio::test]
async fn repeated_validation_failures_escalate_to_agent_rollback() {
    let settings = EngineSettings {
        escalation_threshold: 2,
        ..EngineSettings::default()
    };
    let validator = ScriptedValidator::new()
        .fail(ValidationLevel::Build, ScopeMatch::Issue(id("X")))
        .fail(ValidationLevel::Build, ScopeMatch::Issue(id("Y")));
    let (mut h, _) = harness(
        config(settings),
        MemoryWorkTree::new()
            .with_file("fx", "x0")
            .with_file("fy", "y0")
            .with_file("fz", "z0"),
        vec![(AgentSpec::new("linter", ["lint"], 1), ScriptedAgent::new("linter"))],
        validator,
    );
    h.engine
        .submit_issues(IssueCatalog::new(vec![
            Issue::new("Z", "lint", Severity::Critical).with_file("fz"),
            Issue::new("X", "lint", Severity::High).with_file("fx"),
            Issue::new("Y", "lint", Severity::Medium).with_file("fy"),
        ]))
        .await
        .unwrap();

    match h.engine.run().await {
        Err(EngineError::PhaseBlocked { unresolved, .. }) => {
            assert_eq!(unresolved, vec![id("X"), id("Y"), id("Z")]);
        }
        other => panic!("expected PhaseBlocked, got {other:?}"),
    }

    let view = h.engine.state().snapshot().await;
    let agent_event = view
        .rollbacks
        .iter()
        .find(|e| e.level == RollbackLevel::Agent)
        .expect("agent-level rollback");
    assert_eq!(agent_event.issues, vec![id("Z")]);
    assert!(agent_event.reason.contains("must-pass"));
    for (file, original) in [("fx", "x0"), ("fy", "y0"), ("fz", "z0")] {
        assert_eq!(h.tree.contents(file).as_deref(), Some(original));
    }

    // Z was requeued but its only agent is suspended for the phase.
    let z = &view.issues[&id("Z")];
    assert_eq!((z.status, z.attempt), (IssueStatus::Pending, 2));
}

#[tokio::test]
async fn agent_rollback_waits_out_running_peer_on_cascaded_file() {
    let settings = EngineSettings {
        lock_timeout_ms: 50,
        escalation_threshold: 1,
        max_attempts: 2,
        ..EngineSettings::default()
    };
    let validator = ScriptedValidator::new().fail_times(
        ValidationLevel::Build,
        ScopeMatch::Issue(id("C")),
        1,
    );
    let (mut h, agents) = harness(
        config(settings),
        MemoryWorkTree::new().with_file("f1", "v0").with_file("f5", "c0"),
        vec![
            (AgentSpec::new("agent-1", ["a11y"], 1), ScriptedAgent::new("agent-1")),
            (
                AgentSpec::new("agent-2", ["a11y"], 1),
                ScriptedAgent::new("agent-2").with_delay(Duration::from_millis(500)),
            ),
        ],
        validator,
    );
    h.engine
        .submit_issues(IssueCatalog::new(vec![
            Issue::new("A", "a11y", Severity::Critical).with_file("f1"),
            Issue::new("B", "a11y", Severity::High).with_file("f1"),
            Issue::new("C", "a11y", Severity::Medium).with_file("f5"),
        ]))
        .await
        .unwrap();

    // B is still inside its 500ms fix on f1 when C's failure escalates, far
    // beyond the 50ms lock timeout.
    let report = h.engine.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.summary.fixed, 3);
    assert_eq!(agents[0].calls(), vec![id("A"), id("C")]);

    let agent_event = report
        .rollbacks
        .iter()
        .find(|e| e.level == RollbackLevel::Agent)
        .expect("agent-level rollback");
    assert_eq!(agent_event.issues, vec![id("A"), id("B")]);
    assert_eq!(agent_event.restored[0].issue, id("B"));

    let view = h.engine.state().snapshot().await;
    let b = &view.issues[&id("B")];
    assert!(b
        .history
        .iter()
        .any(|c| c.attempt == 1 && c.status == IssueStatus::RolledBack));
    assert_eq!((b.status, b.attempt), (IssueStatus::Fixed, 2));
    assert_eq!(b.agent, Some(AgentId::from("agent-2")));
    assert_eq!(view.phase_status("quality"), PhaseStatus::Completed);
    assert_eq!(h.tree.contents("f5").as_deref(), Some("C fixed by agent-2"));
}

#[tokio::test]
async fn failed_batch_routes_work_to_another_agent() {
    let validator = ScriptedValidator::new().fail(
        ValidationLevel::Runtime,
        ScopeMatch::Agent(AgentId::from("wide")),
    );
    let (mut h, agents) = harness(
        config(EngineSettings::default()),
        MemoryWorkTree::new().with_file("fp", "p0"),
        vec![
            (AgentSpec::new("wide", ["a11y"], 4), ScriptedAgent::new("wide")),
            (AgentSpec::new("narrow", ["a11y"], 1), ScriptedAgent::new("narrow")),
        ],
        validator,
    );
    h.engine
        .submit_issues(IssueCatalog::new(vec![
            Issue::new("P", "a11y", Severity::Low).with_file("fp")
        ]))
        .await
        .unwrap();

    let report = h.engine.run().await.unwrap();
    let p = report.issue(&id("P")).unwrap();
    assert_eq!(p.status, IssueStatus::Fixed);
    assert_eq!(p.agent, Some(AgentId::from("narrow")));
    assert_eq!(p.attempts, 2);
    assert_eq!(agents[0].calls(), vec![id("P")]);
    assert_eq!(agents[1].calls(), vec![id("P")]);
    assert_eq!(h.tree.contents("fp").as_deref(), Some("P fixed by narrow"));

    assert_eq!(report.rollbacks.len(), 1);
    assert_eq!(report.rollbacks[0].level, RollbackLevel::Agent);
    let batch_results = &report.phases[0].validation;
    assert!(batch_results
        .iter()
        .any(|r| r.level == ValidationLevel::Runtime && !r.passed));
}

#[tokio::test]
async fn lock_timeout_fails_attempt_without_starting_agent() {
    let settings = EngineSettings {
        lock_timeout_ms: 20,
        max_attempts: 2,
        ..EngineSettings::default()
    };
    let (mut h, agents) = harness(
        config(settings),
        MemoryWorkTree::new(),
        vec![(
            AgentSpec::new("slow", ["lint"], 2),
            ScriptedAgent::new("slow").with_delay(Duration::from_millis(150)),
        )],
        ScriptedValidator::new(),
    );
    h.engine
        .submit_issues(IssueCatalog::new(vec![
            Issue::new("first", "lint", Severity::High).with_file("shared"),
            Issue::new("second", "lint", Severity::Low).with_file("shared"),
        ]))
        .await
        .unwrap();

    let report = h.engine.run().await.unwrap();
    assert_eq!(report.summary.fixed, 2);
    assert_eq!(report.issue(&id("second")).unwrap().attempts, 2);
    assert_eq!(agents[0].calls(), vec![id("first"), id("second")]);

    let entries = h.engine.state().entries().await;
    assert!(entries.iter().any(|e| matches!(
        &e.event,
        AuditEvent::FixFailed { issue, attempt: 1, agent: None, error: FixError::LockTimeout { .. }, .. }
            if issue == &id("second")
    )));
    let view = h.engine.state().snapshot().await;
    assert!(!view.issues[&id("second")]
        .history
        .iter()
        .any(|c| c.attempt == 1 && c.status == IssueStatus::InProgress));
}

#[tokio::test]
async fn misbehaving_agents_are_excluded_when_configured() {
    let settings = EngineSettings {
        fix_timeout_ms: 30,
        exclude_unresolved: true,
        ..EngineSettings::default()
    };
    let agent = ScriptedAgent::new("fixer")
        .script("H", [Script::Hang])
        .script("U", [Script::TouchUndeclared("secret".into())])
        .script("R", [Script::Fail("could not parse".into())]);
    let (mut h, _) = harness(
        config(settings),
        MemoryWorkTree::new()
            .with_file("h", "h0")
            .with_file("u", "u0")
            .with_file("r", "r0"),
        vec![(AgentSpec::new("fixer", ["a11y"], 3), agent)],
        ScriptedValidator::new(),
    );
    h.engine
        .submit_issues(IssueCatalog::new(vec![
            Issue::new("H", "a11y", Severity::Low).with_file("h"),
            Issue::new("U", "a11y", Severity::Low).with_file("u"),
            Issue::new("R", "a11y", Severity::Low).with_file("r"),
        ]))
        .await
        .unwrap();

    let report = h.engine.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.summary.excluded, 3);

    let failure = |s: &str| report.issue(&id(s)).unwrap().failure.clone();
    assert!(matches!(failure("H"), Some(FixError::AgentTimeout { timeout_ms: 30, .. })));
    assert!(matches!(failure("U"), Some(FixError::UndeclaredFiles { .. })));
    assert_eq!(
        failure("R"),
        Some(FixError::AgentReported {
            diagnostic: "could not parse".into()
        })
    );
    for (file, original) in [("h", "h0"), ("u", "u0"), ("r", "r0")] {
        assert_eq!(h.tree.contents(file).as_deref(), Some(original));
    }
}

#[tokio::test]
async fn phase_validation_failure_rolls_back_and_retries_phase() {
    let validator = ScriptedValidator::new().fail_times(
        ValidationLevel::Integration,
        ScopeMatch::Phase("quality".into()),
        1,
    );
    let (mut h, _) = harness(
        config(EngineSettings::default()),
        MemoryWorkTree::new()
            .with_file("a", "a0")
            .with_file("b", "b0"),
        vec![(AgentSpec::new("fixer", ["a11y"], 2), ScriptedAgent::new("fixer"))],
        validator,
    );
    h.engine
        .submit_issues(IssueCatalog::new(vec![
            Issue::new("A", "a11y", Severity::Low).with_file("a"),
            Issue::new("B", "a11y", Severity::Low)
                .with_file("b")
                .with_dependency("A"),
        ]))
        .await
        .unwrap();

    let err = h.engine.run().await.unwrap_err();
    assert!(matches!(err, EngineError::PhaseRolledBack { .. }), "{err}");
    assert_eq!(h.tree.contents("a").as_deref(), Some("a0"));
    assert_eq!(h.tree.contents("b").as_deref(), Some("b0"));

    let snapshot = h.engine.get_state().await;
    assert_eq!(snapshot.phases[0].status, PhaseStatus::RolledBack);
    assert!(snapshot.resumable);
    let event = snapshot.state.rollbacks.last().unwrap();
    assert_eq!(event.level, RollbackLevel::Phase);
    assert_eq!(event.issues, vec![id("A"), id("B")]);

    let wrong = h
        .engine
        .resume(ResumeDirective::ExcludeIssues(vec![id("A")]))
        .await;
    assert!(matches!(wrong, Err(EngineError::InvalidResume { .. })));

    h.engine.resume(ResumeDirective::RetryPhase).await.unwrap();
    let report = h.engine.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(report.issues.iter().all(|i| i.attempts == 2));
    assert_eq!(h.tree.contents("b").as_deref(), Some("B fixed by fixer"));
}

#[tokio::test]
async fn abort_withdraws_waiting_fixes_and_rolls_back_phase() {
    let (mut h, agents) = harness(
        config(EngineSettings::default()),
        MemoryWorkTree::new().with_file("f1", "original"),
        vec![(
            AgentSpec::new("fixer", ["a11y"], 2),
            ScriptedAgent::new("fixer").with_delay(Duration::from_millis(150)),
        )],
        ScriptedValidator::new(),
    );
    h.engine
        .submit_issues(IssueCatalog::new(vec![
            Issue::new("X", "a11y", Severity::High).with_file("f1"),
            Issue::new("Y", "a11y", Severity::Low).with_file("f1"),
        ]))
        .await
        .unwrap();

    let handle = h.engine.handle();
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        handle.abort("operator stop");
    });

    let err = h.engine.run().await.unwrap_err();
    stopper.await.unwrap();
    match &err {
        EngineError::PhaseRolledBack { reason, .. } => assert!(reason.contains("aborted")),
        other => panic!("expected PhaseRolledBack, got {other:?}"),
    }
    assert!(h.engine.handle().is_aborted());
    assert_eq!(agents[0].calls(), vec![id("X")]);
    assert_eq!(h.tree.contents("f1").as_deref(), Some("original"));

    let view = h.engine.state().snapshot().await;
    assert_eq!(view.issues[&id("X")].status, IssueStatus::RolledBack);
    assert_eq!(view.issues[&id("Y")].status, IssueStatus::Pending);
    assert!(view.halted.is_some());

    h.engine.resume(ResumeDirective::RetryPhase).await.unwrap();
    assert!(!h.engine.handle().is_aborted());
    let report = h.engine.run().await.unwrap();
    assert_eq!(report.summary.fixed, 2);
    assert_eq!(h.tree.contents("f1").as_deref(), Some("Y fixed by fixer"));
    assert!(h.engine.state().snapshot().await.halted.is_none());
}

#[tokio::test]
async fn complete_rollback_is_idempotent_and_final() {
    let settings = EngineSettings {
        backup_retention: BackupRetention::RunEnd,
        ..EngineSettings::default()
    };
    let (mut h, _) = harness(
        config(settings),
        MemoryWorkTree::new()
            .with_file("a", "a0")
            .with_file("b", "b0"),
        vec![(AgentSpec::new("fixer", ["a11y"], 2), ScriptedAgent::new("fixer"))],
        ScriptedValidator::new(),
    );
    h.engine
        .submit_issues(IssueCatalog::new(vec![
            Issue::new("A", "a11y", Severity::Low).with_file("a"),
            Issue::new("B", "a11y", Severity::Low).with_file("b"),
        ]))
        .await
        .unwrap();
    h.engine.run().await.unwrap();
    assert_eq!(h.tree.contents("a").as_deref(), Some("A fixed by fixer"));

    let first = h.engine.rollback_all("release cancelled").await.unwrap();
    let event = first.event().cloned().expect("rollback applied");
    assert_eq!(event.level, RollbackLevel::Complete);
    assert_eq!(event.restored.len(), 2);
    assert_eq!(h.tree.contents("a").as_deref(), Some("a0"));
    assert_eq!(h.tree.contents("b").as_deref(), Some("b0"));

    let second = h.engine.rollback_all("release cancelled").await.unwrap();
    assert_eq!(second, RollbackOutcome::AlreadyRolledBack);

    let report = h.engine.report().await;
    assert_eq!(report.rollbacks.len(), 1);
    assert_eq!(report.summary.rolled_back, 2);
    assert!(matches!(report.outcome, RunOutcome::RolledBack { .. }));
    assert!(matches!(
        h.engine.resume(ResumeDirective::RetryPhase).await,
        Err(EngineError::NotResumable { .. })
    ));
}

#[tokio::test]
async fn rollback_all_policy_undoes_completed_phases() {
    let settings = EngineSettings {
        on_phase_failure: PhaseFailurePolicy::RollbackAll,
        backup_retention: BackupRetention::RunEnd,
        ..EngineSettings::default()
    };
    let config = EngineConfig::default()
        .with_phase("critical", ["security"])
        .with_phase("quality", ["a11y"])
        .with_settings(settings);
    let validator = ScriptedValidator::new().fail(
        ValidationLevel::Integration,
        ScopeMatch::Phase("quality".into()),
    );
    let (mut h, _) = harness(
        config,
        MemoryWorkTree::new()
            .with_file("s", "s0")
            .with_file("q", "q0"),
        vec![(
            AgentSpec::new("fixer", ["security", "a11y"], 2),
            ScriptedAgent::new("fixer"),
        )],
        validator,
    );
    h.engine
        .submit_issues(IssueCatalog::new(vec![
            Issue::new("S", "security", Severity::Critical).with_file("s"),
            Issue::new("Q", "a11y", Severity::Low).with_file("q"),
        ]))
        .await
        .unwrap();

    let err = h.engine.run().await.unwrap_err();
    assert!(matches!(err, EngineError::PhaseRolledBack { .. }), "{err}");
    assert_eq!(h.tree.contents("s").as_deref(), Some("s0"));
    assert_eq!(h.tree.contents("q").as_deref(), Some("q0"));

    let snapshot = h.engine.get_state().await;
    assert!(!snapshot.resumable);
    assert_eq!(snapshot.phases[0].status, PhaseStatus::Completed);
    assert_eq!(snapshot.phases[1].status, PhaseStatus::RolledBack);
    assert!(matches!(
        h.engine.resume(ResumeDirective::RetryPhase).await,
        Err(EngineError::NotResumable { .. })
    ));
    assert!(matches!(
        h.engine.report().await.outcome,
        RunOutcome::RolledBack { .. }
    ));
}
