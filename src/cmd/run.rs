//! Migration runs: `porter run`, `porter run --dry-run`, and `porter resume`.

use anyhow::{Context, Result};
use console::style;
use porter_common::{Checkpoint, ConfigError, Project, RunStatus, Strategy, UnitStatus};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use porter::agent::CommandAgent;
use porter::checkpoint::FileCheckpointStore;
use porter::config::PorterConfig;
use porter::gates::GateHarness;
use porter::metrics::{MetricsDb, MetricsHandle};
use porter::orchestrator::{Orchestrator, RunResult, RunSettings};
use porter::strategy;
use porter::ui::OrchestratorUI;

use super::super::{Cli, RunOverrides};

fn load_project(path: &Path) -> Result<Project> {
    Ok(Project::load(path)?)
}

fn load_config(workdir: PathBuf, overrides: &RunOverrides) -> Result<PorterConfig> {
    let config = PorterConfig::with_cli_args(
        workdir,
        overrides.max_retries,
        overrides.failure_policy,
        overrides.gate_mode,
    )?;
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    Ok(config)
}

fn open_metrics(config: &PorterConfig) -> Result<MetricsDb> {
    let path = config.metrics_db_path();
    MetricsDb::new(&path)
        .with_context(|| format!("Failed to open metrics database at {}", path.display()))
}

/// Print the order units would run in, without touching any state.
pub fn cmd_dry_run(
    workdir: PathBuf,
    project_path: &Path,
    target_name: &str,
    strategy: Strategy,
) -> Result<()> {
    let project = load_project(project_path)?;
    let config = load_config(workdir, &RunOverrides::default())?;
    let target = config.target(target_name, &project.name)?;
    let units = strategy::order(&project, strategy)?;

    println!();
    println!(
        "{} -> {} ({}), {} unit(s)",
        style(&project.name).bold(),
        style(&target.name).bold(),
        strategy,
        units.len()
    );
    println!("Output directory: {}", config.workdir.join(&target.subdir).display());
    println!();
    println!("{:<4} {:<24} {:<8} Depends on", "#", "Unit", "Kind");
    println!("{:<4} {:<24} {:<8} ----------", "----", "------------------------", "--------");
    for (i, unit) in units.iter().enumerate() {
        let deps: Vec<&str> = unit.depends_on.iter().map(String::as_str).collect();
        println!(
            "{:<4} {:<24} {:<8} {}",
            i + 1,
            unit.id,
            unit.kind,
            if deps.is_empty() { "-".to_string() } else { deps.join(", ") }
        );
    }
    println!();
    println!("Gates:");
    for gate in &target.gates {
        println!("  {:<10} {} ({}s)", gate.name, gate.command, gate.timeout_secs);
    }
    println!();
    Ok(())
}

pub async fn cmd_run(
    cli: &Cli,
    workdir: PathBuf,
    project_path: &Path,
    target_name: &str,
    strategy: Strategy,
    overrides: &RunOverrides,
    cancel: CancellationToken,
) -> Result<RunStatus> {
    let project = load_project(project_path)?;
    let config = load_config(workdir, overrides)?;
    let db = open_metrics(&config)?;
    execute(cli, &config, &project, target_name, strategy, None, db, cancel).await
}

/// Resume from a checkpoint file. Target and strategy fall back to the run
/// row recorded in the metrics database.
#[allow(clippy::too_many_arguments)]
pub async fn cmd_resume(
    cli: &Cli,
    workdir: PathBuf,
    checkpoint_path: &Path,
    project_path: &Path,
    target_name: Option<&str>,
    strategy: Option<Strategy>,
    overrides: &RunOverrides,
    cancel: CancellationToken,
) -> Result<RunStatus> {
    let checkpoint = FileCheckpointStore::load_file(checkpoint_path)
        .with_context(|| format!("Failed to load checkpoint {}", checkpoint_path.display()))?;
    let project = load_project(project_path)?;
    let config = load_config(workdir, overrides)?;
    let db = open_metrics(&config)?;

    let recorded = db.get_run(&checkpoint.run_id)?;
    let target_name = match (target_name, &recorded) {
        (Some(name), _) => name.to_string(),
        (None, Some(run)) => run.target_language.clone(),
        (None, None) => {
            return Err(ConfigError::Invalid(format!(
                "Run '{}' has no recorded target; pass --target",
                checkpoint.run_id
            ))
            .into());
        }
    };
    let strategy = match (strategy, &recorded) {
        (Some(strategy), _) => strategy,
        (None, Some(run)) => run.strategy,
        (None, None) => {
            return Err(ConfigError::Invalid(format!(
                "Run '{}' has no recorded strategy; pass --strategy",
                checkpoint.run_id
            ))
            .into());
        }
    };

    println!(
        "Resuming run {} ({} unit(s) already done)",
        style(&checkpoint.run_id).cyan(),
        checkpoint.completed_unit_ids.len()
    );
    execute(
        cli,
        &config,
        &project,
        &target_name,
        strategy,
        Some(checkpoint),
        db,
        cancel,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn execute(
    cli: &Cli,
    config: &PorterConfig,
    project: &Project,
    target_name: &str,
    strategy: Strategy,
    checkpoint: Option<Checkpoint>,
    db: MetricsDb,
    cancel: CancellationToken,
) -> Result<RunStatus> {
    let target = config.target(target_name, &project.name)?;
    let unit_count = strategy::graph_for(project, strategy)?.len();

    let store = Arc::new(FileCheckpointStore::new(config.checkpoint_dir()));
    let agent = Arc::new(CommandAgent::from_config(config));
    let gates = Arc::new(GateHarness::new(config.workdir.join(&target.subdir)));

    let mut orchestrator = Orchestrator::new(
        RunSettings::from_config(config),
        agent,
        gates,
        store.clone(),
    )
    .with_metrics(MetricsHandle::new(db))
    .with_cancellation(cancel);
    if !cli.quiet && std::io::stderr().is_terminal() {
        orchestrator =
            orchestrator.with_ui(Arc::new(OrchestratorUI::new(unit_count as u64, cli.verbose)));
    }

    let result = orchestrator
        .run(project, &target, strategy, checkpoint)
        .await?;
    print_summary(&result, &store.path_for(&result.run.run_id));
    Ok(result.status())
}

fn print_summary(result: &RunResult, checkpoint_path: &Path) {
    let status = result.status();
    let styled = match status {
        RunStatus::Succeeded => style(status.as_str()).green().bold(),
        RunStatus::Failed => style(status.as_str()).red().bold(),
        RunStatus::Aborted | RunStatus::Running => style(status.as_str()).yellow().bold(),
    };
    let count = |s: UnitStatus| result.units.iter().filter(|u| u.status == s).count();

    println!();
    println!("Run:     {}", result.run.run_id);
    println!("Status:  {}", styled);
    println!(
        "Units:   {} done, {} failed, {} pending of {}",
        count(UnitStatus::Done),
        count(UnitStatus::Failed),
        count(UnitStatus::Pending) + count(UnitStatus::InProgress),
        result.units.len()
    );
    for (unit, reason) in &result.failure_reasons {
        println!("  {} {}: {}", style("x").red(), unit, reason);
    }
    if let Some(failure) = &result.last_failure {
        println!(
            "Failed:  {} in {}: {}",
            style(&failure.unit_id).red(),
            failure.phase,
            failure.message
        );
    }
    println!("Journal: {}", result.journal_path.display());
    if status != RunStatus::Succeeded {
        println!(
            "Resume with: porter resume --checkpoint {} --project <project.yaml>",
            checkpoint_path.display()
        );
    }
    println!();
}
