//! mender - fix orchestration CLI
//!
//! ## Commands
//!
//! - `plan`: validate a catalog against a config and show the dispatch order
//! - `run`: run every phase with command-backed agents and validators
//! - `report`: verify and print a stored execution report

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};

use mender_core::{
    read_report, write_report, AgentRegistry, CommandAgent, CommandValidator, EngineConfig,
    FixEngine, FixExecutionReport, FsWorkTree, IssueCatalog, IssueId, RunOutcome,
};
use mender_state::{FsCasStore, JsonlJournal};

#[derive(Parser)]
#[command(name = "mender")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Dependency-aware, rollback-safe fix orchestration", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a catalog and print each phase's dependency levels
    Plan {
        /// Issue catalog (JSON array or {"issues": [...]})
        #[arg(long)]
        catalog: PathBuf,

        /// Engine config (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Print the plan as JSON
        #[arg(long)]
        raw: bool,
    },

    /// Run every phase against a working tree
    Run {
        #[arg(long)]
        catalog: PathBuf,

        #[arg(long)]
        config: PathBuf,

        /// Working tree the agents fix (default: current directory)
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Directory for backups, the audit journal and reports
        #[arg(long, default_value = ".mender")]
        state_dir: PathBuf,

        /// Where to write the report (default: <state-dir>/runs)
        #[arg(long)]
        report_dir: Option<PathBuf>,
    },

    /// Verify and print a stored report
    Report {
        /// Run ID to load
        #[arg(long)]
        run: String,

        /// Directory containing run reports (default: .mender/runs)
        #[arg(long)]
        report_dir: Option<PathBuf>,

        /// Print the verified report as JSON
        #[arg(long)]
        raw: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    mender_core::telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Plan {
            catalog,
            config,
            raw,
        } => cmd_plan(&catalog, &config, raw).await,
        Commands::Run {
            catalog,
            config,
            root,
            state_dir,
            report_dir,
        } => {
            let report_dir = report_dir.unwrap_or_else(|| state_dir.join("runs"));
            cmd_run(&catalog, &config, &root, &state_dir, &report_dir).await
        }
        Commands::Report {
            run,
            report_dir,
            raw,
        } => {
            let report_dir = report_dir.unwrap_or_else(|| PathBuf::from(".mender/runs"));
            cmd_report(&run, &report_dir, raw)
        }
    }
}

fn load_inputs(catalog: &Path, config: &Path) -> Result<(IssueCatalog, EngineConfig)> {
    let config = EngineConfig::load(config)
        .with_context(|| format!("Failed to load config: {}", config.display()))?;
    let raw = std::fs::read_to_string(catalog)
        .with_context(|| format!("Failed to read catalog: {}", catalog.display()))?;
    let catalog = IssueCatalog::from_json(&raw)
        .with_context(|| format!("Catalog is not valid JSON: {}", catalog.display()))?;
    Ok((catalog, config))
}

fn command_registry(config: &EngineConfig, root: &Path) -> Result<AgentRegistry> {
    let mut registry = AgentRegistry::new();
    for agent in &config.agents {
        if agent.command.is_empty() {
            anyhow::bail!("Agent {} has no command configured", agent.id);
        }
        registry
            .register(agent.spec(), Arc::new(CommandAgent::new(agent.command.clone(), root)))
            .with_context(|| format!("Failed to register agent {}", agent.id))?;
    }
    Ok(registry)
}

#[derive(Debug, Serialize)]
struct PhasePlan {
    name: String,
    ordinal: u32,
    levels: Vec<Vec<IssueId>>,
    uncovered: Vec<String>,
}

/// Split the global Kahn levels per phase, dropping empty levels.
fn phase_plans(
    config: &EngineConfig,
    levels: &[Vec<IssueId>],
    phase_of: &BTreeMap<IssueId, String>,
    categories_of: &BTreeMap<IssueId, String>,
) -> Vec<PhasePlan> {
    config
        .phase_specs()
        .into_iter()
        .map(|phase| {
            let in_phase = |id: &IssueId| phase_of.get(id) == Some(&phase.name);
            let levels: Vec<Vec<IssueId>> = levels
                .iter()
                .map(|level| level.iter().filter(|id| in_phase(id)).cloned().collect::<Vec<_>>())
                .filter(|level| !level.is_empty())
                .collect();

            let mut uncovered: Vec<String> = levels
                .iter()
                .flatten()
                .filter_map(|id| categories_of.get(id))
                .filter(|category| {
                    !config
                        .agents
                        .iter()
                        .any(|a| a.capabilities.iter().any(|c| c == *category))
                })
                .cloned()
                .collect();
            uncovered.sort();
            uncovered.dedup();

            PhasePlan {
                name: phase.name,
                ordinal: phase.ordinal,
                levels,
                uncovered,
            }
        })
        .collect()
}

async fn cmd_plan(catalog_path: &Path, config_path: &Path, raw: bool) -> Result<()> {
    let (catalog, config) = load_inputs(catalog_path, config_path)?;
    let categories_of: BTreeMap<IssueId, String> = catalog
        .iter()
        .map(|i| (i.id.clone(), i.category.to_string()))
        .collect();

    let mut engine = FixEngine::new(
        config.clone(),
        AgentRegistry::new(),
        Arc::new(CommandValidator::new(BTreeMap::new(), ".")),
        Arc::new(FsWorkTree::new(".")),
    )
    .context("Invalid engine config")?;
    engine
        .submit_issues(catalog)
        .await
        .context("Catalog rejected")?;

    let plan = engine.execution_plan().context("Failed to order issues")?;
    let phase_of: BTreeMap<IssueId, String> = engine
        .get_state()
        .await
        .state
        .issues
        .into_iter()
        .map(|(id, view)| (id, view.phase))
        .collect();
    let phases = phase_plans(&config, &plan.levels, &phase_of, &categories_of);

    if raw {
        println!("{}", serde_json::to_string_pretty(&phases)?);
        return Ok(());
    }

    println!("Plan: {} issues in {} phases", plan.len(), phases.len());
    for phase in &phases {
        println!();
        println!("Phase {} ({})", phase.ordinal, phase.name);
        for (n, level) in phase.levels.iter().enumerate() {
            let ids: Vec<&str> = level.iter().map(IssueId::as_str).collect();
            println!("  level {}: {}", n + 1, ids.join(", "));
        }
        if !phase.uncovered.is_empty() {
            println!("  no agent for: {}", phase.uncovered.join(", "));
        }
    }
    Ok(())
}

async fn cmd_run(
    catalog_path: &Path,
    config_path: &Path,
    root: &Path,
    state_dir: &Path,
    report_dir: &Path,
) -> Result<()> {
    let (catalog, config) = load_inputs(catalog_path, config_path)?;
    let registry = command_registry(&config, root)?;
    let validator = CommandValidator::new(config.validation.commands.clone(), root);

    let cas = FsCasStore::new(state_dir.join("backups"))
        .with_context(|| format!("Failed to open backup store in {}", state_dir.display()))?;
    let engine = FixEngine::new(
        config,
        registry,
        Arc::new(validator),
        Arc::new(FsWorkTree::new(root)),
    )
    .context("Invalid engine config")?;
    let journal_path = state_dir.join("runs").join(engine.run_id()).join("audit.jsonl");
    let journal = JsonlJournal::open(&journal_path)
        .with_context(|| format!("Failed to open audit journal: {}", journal_path.display()))?;
    let mut engine = engine.with_cas(Arc::new(cas)).with_journal(Arc::new(journal));

    engine
        .submit_issues(catalog)
        .await
        .context("Catalog rejected")?;
    info!(run_id = %engine.run_id(), "starting run");

    let outcome = engine.run().await;
    let report = match &outcome {
        Ok(report) => report.clone(),
        Err(e) => {
            warn!(error = %e, "run halted");
            engine.report().await
        }
    };
    let path = write_report(&report, report_dir).context("Failed to write report")?;
    print_summary(&report);
    println!("Report: {}", path.display());

    if let Err(e) = outcome {
        let resumable = matches!(report.outcome, RunOutcome::Halted { resumable: true, .. });
        let hint = if resumable {
            " (resumable: retry or exclude the listed issues)"
        } else {
            ""
        };
        anyhow::bail!("Run {} halted: {e}{hint}", engine.run_id());
    }
    Ok(())
}

fn cmd_report(run_id: &str, report_dir: &Path, raw: bool) -> Result<()> {
    let report = read_report(run_id, report_dir)
        .with_context(|| format!("Failed to load report for run {run_id}"))?;
    if raw {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }
    Ok(())
}

fn print_summary(report: &FixExecutionReport) {
    let outcome = match &report.outcome {
        RunOutcome::NotStarted => "not started".to_string(),
        RunOutcome::InProgress => "in progress".to_string(),
        RunOutcome::Completed => "completed".to_string(),
        RunOutcome::Halted { reason, .. } => format!("halted: {reason}"),
        RunOutcome::RolledBack { reason } => format!("rolled back: {reason}"),
    };
    let s = &report.summary;
    println!("Run {}: {outcome}", report.run_id);
    println!(
        "  {} issues: {} fixed, {} failed, {} rolled back, {} pending, {} excluded",
        s.total, s.fixed, s.failed, s.rolled_back, s.pending, s.excluded
    );
    for phase in &report.phases {
        println!("  phase {} [{}]: {} issues", phase.name, phase.status, phase.issues.len());
    }
    for issue in report.issues.iter().filter(|i| i.failure.is_some()) {
        if let Some(failure) = &issue.failure {
            println!("  {} ({}): {failure}", issue.id, issue.status);
        }
    }
    if !report.rollbacks.is_empty() {
        println!("  {} rollbacks", report.rollbacks.len());
        for event in &report.rollbacks {
            println!("    {} {}: {}", event.level, event.scope, event.reason);
        }
    }
}
