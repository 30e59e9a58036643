//! Subprocess-backed agents and validators.
//!
//! Both run a configured program in the work tree root and treat exit code 0
//! as success. Context is passed through `MENDER_*` environment variables.
//! Children are killed when the engine's timeout drops the call.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::agents::FixAgent;
use crate::domain::{FixOutcome, Issue, ValidationLevel, ValidationScope};
use crate::validation::{CheckOutcome, Validator};

/// Longest diagnostic tail kept from a child's output.
const DIAGNOSTIC_LIMIT: usize = 4096;

#[derive(Debug)]
struct CommandOutput {
    exit_code: i32,
    success: bool,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn diagnostic(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let text = text.trim();
        let start = text.len().saturating_sub(DIAGNOSTIC_LIMIT);
        let start = (start..=text.len())
            .find(|i| text.is_char_boundary(*i))
            .unwrap_or(text.len());
        format!("exit {}: {}", self.exit_code, &text[start..])
    }
}

async fn run_command(command: &[String], root: &Path, env: &[(&str, String)]) -> std::io::Result<CommandOutput> {
    let Some((exe, args)) = command.split_first() else {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"));
    };

    let mut cmd = Command::new(exe);
    cmd.args(args)
        .current_dir(root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }

    let output = cmd.spawn()?.wait_with_output().await?;
    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn join_paths<'a>(paths: impl IntoIterator<Item = &'a PathBuf>) -> String {
    paths
        .into_iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Runs one program per fix.
///
/// Environment: `MENDER_ISSUE_ID`, `MENDER_CATEGORY`, `MENDER_SEVERITY`,
/// `MENDER_FILES` (newline-separated).
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: Vec<String>,
    root: PathBuf,
}

impl CommandAgent {
    pub fn new(command: Vec<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            command,
            root: root.into(),
        }
    }
}

#[async_trait]
impl FixAgent for CommandAgent {
    async fn attempt_fix(&self, issue: &Issue) -> FixOutcome {
        let env = [
            ("MENDER_ISSUE_ID", issue.id.to_string()),
            ("MENDER_CATEGORY", issue.category.to_string()),
            ("MENDER_SEVERITY", issue.severity.to_string()),
            ("MENDER_FILES", join_paths(&issue.files)),
        ];
        match run_command(&self.command, &self.root, &env).await {
            Ok(out) if out.success => {
                debug!(issue = %issue.id, "agent command succeeded");
                FixOutcome::success(issue.files.iter().cloned())
            }
            Ok(out) => FixOutcome::failure(out.diagnostic()),
            Err(e) => {
                warn!(issue = %issue.id, error = %e, "agent command could not run");
                FixOutcome::failure(format!("failed to run {:?}: {e}", self.command))
            }
        }
    }
}

/// Runs the configured program for each level. A level without a program
/// passes.
///
/// Environment: `MENDER_LEVEL`, `MENDER_SCOPE`, `MENDER_ISSUES`
/// (newline-separated) and, for fix scopes, `MENDER_FILES`.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    commands: BTreeMap<ValidationLevel, Vec<String>>,
    root: PathBuf,
}

impl CommandValidator {
    pub fn new(commands: BTreeMap<ValidationLevel, Vec<String>>, root: impl Into<PathBuf>) -> Self {
        Self {
            commands,
            root: root.into(),
        }
    }
}

#[async_trait]
impl Validator for CommandValidator {
    async fn run(&self, level: ValidationLevel, scope: &ValidationScope) -> CheckOutcome {
        let Some(command) = self.commands.get(&level).filter(|c| !c.is_empty()) else {
            return CheckOutcome {
                passed: true,
                detail: format!("no {level} command configured"),
            };
        };

        let mut env = vec![
            ("MENDER_LEVEL", level.to_string()),
            ("MENDER_SCOPE", scope.label()),
        ];
        match scope {
            ValidationScope::Fix { issue, files, .. } => {
                env.push(("MENDER_ISSUES", issue.to_string()));
                env.push(("MENDER_FILES", join_paths(files)));
            }
            ValidationScope::Batch { issues, .. } | ValidationScope::Phase { issues, .. } => {
                let ids: Vec<&str> = issues.iter().map(|i| i.as_str()).collect();
                env.push(("MENDER_ISSUES", ids.join("\n")));
            }
        }

        match run_command(command, &self.root, &env).await {
            Ok(out) if out.success => CheckOutcome::pass(),
            Ok(out) => CheckOutcome::fail(out.diagnostic()),
            Err(e) => CheckOutcome::fail(format!("failed to run {command:?}: {e}")),
        }
    }
}
