use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use console::style;
use porter::config::FailurePolicy;
use porter::errors::{CheckpointError, OrchestratorError};
use porter_common::{ConfigError, GateMode, RunStatus, Strategy};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "porter")]
#[command(
    version,
    about = "Migration orchestrator: drives dependent work units through agent phases and quality gates"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress progress output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Directory holding `.porter/` state (defaults to the current directory)
    #[arg(long, global = true)]
    pub workdir: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Per-invocation overrides of `[defaults]` in porter.toml.
#[derive(Args, Debug, Clone, Default)]
pub struct RunOverrides {
    /// Retries per unit after the first attempt
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// continue-independent or halt
    #[arg(long)]
    pub failure_policy: Option<FailurePolicy>,

    /// fail-fast or all
    #[arg(long)]
    pub gate_mode: Option<GateMode>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Migrate a project unit by unit
    Run {
        /// Project definition (YAML)
        #[arg(long)]
        project: PathBuf,

        /// Target language: rust, go, java, or a [targets.<name>] table
        #[arg(long)]
        target: String,

        /// module-by-module or feature-by-feature
        #[arg(long)]
        strategy: Strategy,

        /// Print the execution order without running anything
        #[arg(long)]
        dry_run: bool,

        #[command(flatten)]
        overrides: RunOverrides,
    },
    /// Continue a failed or interrupted run from its checkpoint
    Resume {
        /// Checkpoint file written by a previous run
        #[arg(long)]
        checkpoint: PathBuf,

        #[arg(long)]
        project: PathBuf,

        /// Defaults to the target recorded for the run
        #[arg(long)]
        target: Option<String>,

        /// Defaults to the strategy recorded for the run
        #[arg(long)]
        strategy: Option<Strategy>,

        #[command(flatten)]
        overrides: RunOverrides,
    },
    /// List retained checkpoints
    Status,
    /// Query, aggregate, compare, and backfill run metrics
    Metrics {
        #[command(subcommand)]
        command: MetricsCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum MetricsCommands {
    /// List recorded runs
    Query {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        strategy: Option<Strategy>,
        #[arg(long)]
        json: bool,
    },
    /// Mean and standard deviation of one metric per group
    Aggregate {
        /// project, target, strategy, or status
        #[arg(long)]
        group_by: porter::metrics::GroupBy,
        /// Metric as <category>.<key>, e.g. run.cost_usd
        #[arg(long)]
        metric: String,
        #[arg(long)]
        json: bool,
    },
    /// Per-metric differences between two runs
    Compare {
        run_a: String,
        run_b: String,
        #[arg(long)]
        json: bool,
    },
    /// Recorded projects with their run counts
    Projects {
        #[arg(long)]
        json: bool,
    },
    /// Remove a run with its metrics and gate results
    Delete { run_id: String },
    /// Load journals or legacy text logs into the metrics database
    Backfill {
        /// Log files or glob patterns
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

fn init_tracing(cli: &Cli) {
    let default_directive = if cli.verbose {
        "porter=debug"
    } else if cli.quiet {
        "porter=warn"
    } else {
        "porter=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match cli.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping at the next phase boundary");
            signal.cancel();
        }
    });
    cancel
}

/// Errors that end the process with exit code 2.
fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<ConfigError>().is_some()
            || cause
                .downcast_ref::<OrchestratorError>()
                .is_some_and(OrchestratorError::is_fatal)
            || matches!(
                cause.downcast_ref::<CheckpointError>(),
                Some(CheckpointError::Corrupt { .. })
            )
    })
}

fn exit_code(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Succeeded => ExitCode::SUCCESS,
        RunStatus::Aborted => ExitCode::from(130),
        RunStatus::Failed | RunStatus::Running => ExitCode::FAILURE,
    }
}

async fn dispatch(cli: &Cli) -> Result<Option<RunStatus>> {
    let workdir = match cli.workdir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            project,
            target,
            strategy,
            dry_run,
            overrides,
        } => {
            if *dry_run {
                cmd::cmd_dry_run(workdir, project, target, *strategy)?;
                return Ok(None);
            }
            let status = cmd::cmd_run(
                cli,
                workdir,
                project,
                target,
                *strategy,
                overrides,
                interrupt_token(),
            )
            .await?;
            Ok(Some(status))
        }
        Commands::Resume {
            checkpoint,
            project,
            target,
            strategy,
            overrides,
        } => {
            let status = cmd::cmd_resume(
                cli,
                workdir,
                checkpoint,
                project,
                target.as_deref(),
                *strategy,
                overrides,
                interrupt_token(),
            )
            .await?;
            Ok(Some(status))
        }
        Commands::Status => {
            cmd::cmd_status(workdir)?;
            Ok(None)
        }
        Commands::Metrics { command } => {
            cmd::cmd_metrics(workdir, command.clone()).await?;
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli);

    match dispatch(&cli).await {
        Ok(Some(status)) => exit_code(status),
        Ok(None) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {:#}", style("Error:").red().bold(), err);
            if is_fatal(&err) {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
