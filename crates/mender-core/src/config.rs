//! Engine configuration, loaded from TOML.
//!
//! Every field has a default, so a config file only needs its `[[phases]]`.
//!
//! ```toml
//! [engine]
//! lock_timeout_ms = 30000
//! max_attempts = 2
//!
//! [validation]
//! regression = "should_pass"
//!
//! [validation.commands]
//! build = ["npm", "run", "build"]
//!
//! [[phases]]
//! name = "critical"
//! categories = ["security", "build"]
//!
//! [[agents]]
//! id = "security-fixer"
//! capabilities = ["security"]
//! command = ["./fixers/security.sh"]
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{AgentSpec, PhaseSpec, ValidationLevel};
use crate::error::{EngineError, EngineResult};
use crate::validation::ValidationPolicy;

/// What happens when a phase fails its phase-level validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseFailurePolicy {
    /// Undo the failing phase only.
    #[default]
    RollbackPhase,
    /// Undo every retained backup of the run. Not resumable.
    RollbackAll,
}

/// When a phase's backups are released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupRetention {
    /// As soon as the phase reaches Completed.
    #[default]
    PhaseCompletion,
    /// Never during the run, so a complete rollback can undo finished phases.
    RunEnd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub lock_timeout_ms: u64,
    pub fix_timeout_ms: u64,
    pub validation_timeout_ms: u64,
    /// Attempts per issue before it counts as unresolved.
    pub max_attempts: u32,
    /// Must-pass failures per (agent, category) within one phase before the
    /// agent's work in that phase is rolled back.
    pub escalation_threshold: u32,
    /// Exclude unresolved issues instead of halting the phase.
    pub exclude_unresolved: bool,
    pub on_phase_failure: PhaseFailurePolicy,
    pub backup_retention: BackupRetention,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 30_000,
            fix_timeout_ms: 300_000,
            validation_timeout_ms: 600_000,
            max_attempts: 1,
            escalation_threshold: 3,
            exclude_unresolved: false,
            on_phase_failure: PhaseFailurePolicy::default(),
            backup_retention: BackupRetention::default(),
        }
    }
}

impl EngineSettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn fix_timeout(&self) -> Duration {
        Duration::from_millis(self.fix_timeout_ms)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    #[serde(flatten)]
    pub policy: ValidationPolicy,
    /// Command per level for command-backed validators.
    pub commands: BTreeMap<ValidationLevel, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub name: String,
    pub categories: Vec<String>,
    /// Defaults to the phase's position in the file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<u32>,
}

fn default_concurrency_limit() -> usize {
    2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub capabilities: Vec<String>,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Program and arguments for command-backed agents.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

impl AgentConfig {
    pub fn spec(&self) -> AgentSpec {
        AgentSpec::new(self.id.clone(), self.capabilities.iter().cloned(), self.concurrency_limit)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: EngineSettings,
    pub validation: ValidationConfig,
    pub phases: Vec<PhaseConfig>,
    pub agents: Vec<AgentConfig>,
}

impl EngineConfig {
    /// Parse and validate.
    pub fn from_toml_str(raw: &str) -> EngineResult<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))
    }

    /// Append a phase; its ordinal is its position.
    pub fn with_phase<I, S>(mut self, name: impl Into<String>, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.phases.push(PhaseConfig {
            name: name.into(),
            categories: categories.into_iter().map(Into::into).collect(),
            ordinal: None,
        });
        self
    }

    pub fn with_settings(mut self, engine: EngineSettings) -> Self {
        self.engine = engine;
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.phases.is_empty() {
            return Err(EngineError::Config("at least one phase is required".into()));
        }
        let engine = &self.engine;
        let zeroes = [
            ("max_attempts", u64::from(engine.max_attempts)),
            ("escalation_threshold", u64::from(engine.escalation_threshold)),
            ("lock_timeout_ms", engine.lock_timeout_ms),
            ("fix_timeout_ms", engine.fix_timeout_ms),
        ];
        if let Some((key, _)) = zeroes.iter().find(|(_, v)| *v == 0) {
            return Err(EngineError::Config(format!("engine.{key} must be at least 1")));
        }

        let mut names = BTreeSet::new();
        let mut ordinals = BTreeSet::new();
        for spec in self.phase_specs() {
            if !names.insert(spec.name.clone()) {
                return Err(EngineError::Config(format!("duplicate phase name {}", spec.name)));
            }
            if !ordinals.insert(spec.ordinal) {
                return Err(EngineError::Config(format!(
                    "duplicate phase ordinal {} ({})",
                    spec.ordinal, spec.name
                )));
            }
        }

        let mut ids = BTreeSet::new();
        for agent in &self.agents {
            if !ids.insert(agent.id.as_str()) {
                return Err(EngineError::Config(format!("duplicate agent id {}", agent.id)));
            }
            if agent.concurrency_limit == 0 {
                return Err(EngineError::Config(format!(
                    "agent {} has a zero concurrency_limit",
                    agent.id
                )));
            }
        }
        Ok(())
    }

    /// Phases sorted by ordinal.
    pub fn phase_specs(&self) -> Vec<PhaseSpec> {
        let mut specs: Vec<PhaseSpec> = self
            .phases
            .iter()
            .enumerate()
            .map(|(i, p)| PhaseSpec::new(p.name.clone(), p.ordinal.unwrap_or(i as u32), p.categories.iter().cloned()))
            .collect();
        specs.sort_by_key(|p| p.ordinal);
        specs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Requirement;

    const FULL: &str = r#"
[engine]
lock_timeout_ms = 500
max_attempts = 2
on_phase_failure = "rollback_all"
backup_retention = "run_end"

[validation]
build = "should_pass"

[validation.commands]
build = ["npm", "run", "build"]

[[phases]]
name = "quality"
categories = ["a11y"]
ordinal = 5

[[phases]]
name = "critical"
categories = ["security", "build"]
ordinal = 1

[[agents]]
id = "security-fixer"
capabilities = ["security"]
command = ["./fix.sh"]
"#;

    #[test]
    fn test_full_config_parses() {
        let config = EngineConfig::from_toml_str(FULL).unwrap();
        assert_eq!(config.engine.lock_timeout(), Duration::from_millis(500));
        assert_eq!(config.engine.fix_timeout_ms, 300_000);
        assert_eq!(config.engine.on_phase_failure, PhaseFailurePolicy::RollbackAll);
        assert_eq!(config.engine.backup_retention, BackupRetention::RunEnd);
        assert_eq!(
            config.validation.policy.requirement(ValidationLevel::Build),
            Requirement::ShouldPass
        );
        assert_eq!(
            config.validation.commands[&ValidationLevel::Build],
            vec!["npm", "run", "build"]
        );
        assert_eq!(config.agents[0].concurrency_limit, 2);

        let names: Vec<String> = config.phase_specs().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["critical", "quality"]);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
[[phases]]
name = "only"
categories = ["x"]
"#,
        )
        .unwrap();
        assert_eq!(config.engine, EngineSettings::default());
        assert_eq!(config.validation.policy, ValidationPolicy::default());
        assert_eq!(config.phase_specs()[0].ordinal, 0);
    }

    #[test]
    fn test_rejects_invalid_configs() {
        let cases = [
            "",
            "[engine]\nmax_attempts = 0\n[[phases]]\nname='a'\ncategories=[]",
            "[engine]\nescalation_threshold = 0\n[[phases]]\nname='a'\ncategories=[]",
            "[engine]\nlock_timeout_ms = 0\n[[phases]]\nname='a'\ncategories=[]",
            "[engine]\nfix_timeout_ms = 0\n[[phases]]\nname='a'\ncategories=[]",
            "[[phases]]\nname='a'\ncategories=[]\n[[phases]]\nname='a'\ncategories=[]",
            "[[phases]]\nname='a'\ncategories=[]\nordinal=1\n[[phases]]\nname='b'\ncategories=[]",
            "[[phases]]\nname='a'\ncategories=[]\n[[agents]]\nid='x'\ncapabilities=[]\nconcurrency_limit=0",
            "[[phases]]\nname='a'\ncategories=[]\n[[agents]]\nid='x'\ncapabilities=[]\n[[agents]]\nid='x'\ncapabilities=[]",
            "[engine]\nlock_timeout_ms = 'soon'",
        ];
        for raw in cases {
            assert!(
                matches!(EngineConfig::from_toml_str(raw), Err(EngineError::Config(_))),
                "accepted: {raw}"
            );
        }
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mender.toml");
        std::fs::write(&path, FULL).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap().phases.len(), 2);
        assert!(EngineConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
