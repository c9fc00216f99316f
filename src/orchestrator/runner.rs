use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use porter_common::{
    Checkpoint, FailureRecord, GateMode, MigrationRun, Project, RunStatus, Strategy, UnitPhase,
    UnitStatus, WorkUnit,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::state::{AttemptStep, DEPENDENCY_FAILED, RunState, after_failed_attempt, backoff_delay};
use crate::agent::{AgentCall, AgentExecutor, Feedback, InstructionContext, build_instructions};
use crate::checkpoint::CheckpointStore;
use crate::config::{FailurePolicy, PorterConfig, ResolvedTarget};
use crate::errors::{AgentError, OrchestratorError};
use crate::gates::GateEvaluator;
use crate::journal::{self, Journal, RunEvent, UsageRecord};
use crate::metrics::{MetricsHandle, persist_events};
use crate::strategy::{self, UnitIndex};
use crate::ui::OrchestratorUI;

/// Knobs of one orchestrator instance.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_retries: u32,
    pub failure_policy: FailurePolicy,
    pub gate_mode: GateMode,
    pub backoff: Duration,
    pub max_backoff: Duration,
    pub agent_timeout: Duration,
    pub workdir: PathBuf,
    pub log_dir: PathBuf,
}

impl RunSettings {
    pub fn from_config(config: &PorterConfig) -> Self {
        Self {
            max_retries: config.max_retries(),
            failure_policy: config.failure_policy(),
            gate_mode: config.gate_mode(),
            backoff: config.backoff(),
            max_backoff: config.max_backoff(),
            agent_timeout: config.agent_timeout(),
            workdir: config.workdir.clone(),
            log_dir: config.log_dir(),
        }
    }
}

/// Outcome of `Orchestrator::run`.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run: MigrationRun,
    /// Units in execution order with their final status.
    pub units: Vec<WorkUnit>,
    /// Unit that failed through its own attempts, most recent first.
    pub failed_unit: Option<String>,
    pub last_failure: Option<FailureRecord>,
    /// `(unit id, reason)` for every `Failed` unit, in execution order.
    pub failure_reasons: Vec<(String, String)>,
    pub journal_path: PathBuf,
}

impl RunResult {
    pub fn status(&self) -> RunStatus {
        self.run.status
    }
}

enum UnitOutcome {
    Done,
    Failed(FailureRecord),
    Aborted,
}

enum AttemptResult {
    Passed,
    Failed {
        phase: UnitPhase,
        message: String,
        feedback: Feedback,
    },
    Cancelled,
}

/// Mutable state of one `run` call.
struct RunContext<'a> {
    project: &'a Project,
    target: &'a ResolvedTarget,
    run: MigrationRun,
    state: RunState,
    checkpoint: Checkpoint,
    journal: Journal,
    events: Vec<RunEvent>,
    /// Highest attempt number already journaled per unit
    attempt_offsets: HashMap<String, u32>,
    last_failure: Option<FailureRecord>,
}

impl RunContext<'_> {
    fn record(&mut self, event: RunEvent) -> Result<(), OrchestratorError> {
        self.journal.record(&event)?;
        self.events.push(event);
        Ok(())
    }
}

fn attempt_offsets(events: &[RunEvent]) -> HashMap<String, u32> {
    let mut offsets: HashMap<String, u32> = HashMap::new();
    for event in events {
        let (unit_id, attempt) = match event {
            RunEvent::PhaseCompleted {
                unit_id, attempt, ..
            } => (unit_id, *attempt),
            RunEvent::GateEvaluated { result } => (&result.unit_id, result.attempt),
            _ => continue,
        };
        let entry = offsets.entry(unit_id.clone()).or_default();
        *entry = (*entry).max(attempt);
    }
    offsets
}

/// Drives every unit of a run through the phase pipeline.
pub struct Orchestrator {
    settings: RunSettings,
    agent: Arc<dyn AgentExecutor>,
    gates: Arc<dyn GateEvaluator>,
    checkpoints: Arc<dyn CheckpointStore>,
    metrics: Option<MetricsHandle>,
    cancel: CancellationToken,
    ui: Option<Arc<OrchestratorUI>>,
}

impl Orchestrator {
    pub fn new(
        settings: RunSettings,
        agent: Arc<dyn AgentExecutor>,
        gates: Arc<dyn GateEvaluator>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            settings,
            agent,
            gates,
            checkpoints,
            metrics: None,
            cancel: CancellationToken::new(),
            ui: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_ui(mut self, ui: Arc<OrchestratorUI>) -> Self {
        self.ui = Some(ui);
        self
    }

    /// Run `project` to a terminal status.
    ///
    /// Fatal errors (configuration, cycles, an inconsistent checkpoint) are
    /// returned before anything is written. Unit failures are not errors:
    /// they end in a `Failed` run result.
    pub async fn run(
        &self,
        project: &Project,
        target: &ResolvedTarget,
        strategy: Strategy,
        resume_from: Option<Checkpoint>,
    ) -> Result<RunResult, OrchestratorError> {
        let invocation_start = Instant::now();
        let graph = strategy::graph_for(project, strategy)?;
        let order = strategy::execution_order(&graph);
        let mut state = RunState::new(graph);

        let (checkpoint, resumed) = match resume_from {
            Some(checkpoint) => {
                let restored = state.rehydrate(&checkpoint)?;
                info!(run_id = %checkpoint.run_id, restored, "resuming run");
                (checkpoint, true)
            }
            None => (Checkpoint::new(MigrationRun::generate_id()), false),
        };
        let run_id = checkpoint.run_id.clone();

        let target_dir = self.settings.workdir.join(&target.subdir);
        std::fs::create_dir_all(&target_dir).map_err(|e| {
            OrchestratorError::Other(anyhow::anyhow!(
                "Failed to create target directory {}: {}",
                target_dir.display(),
                e
            ))
        })?;

        let journal_path = Journal::path_for(&self.settings.log_dir, &run_id);
        let events = if resumed {
            journal::recover_events(&journal_path)?
        } else {
            Vec::new()
        };
        let mut run = MigrationRun::start(&run_id, &project.name, &target.name, strategy);
        if let Some(previous) = crate::metrics::derive::run_info(&events) {
            run.started_at = previous.started_at;
        }

        let mut ctx = RunContext {
            project,
            target,
            run,
            attempt_offsets: attempt_offsets(&events),
            state,
            checkpoint,
            journal: Journal::open(&journal_path)?,
            events,
            last_failure: None,
        };

        let unit_ids: Vec<String> = order
            .iter()
            .map(|&i| ctx.state.unit(i).id.clone())
            .collect();
        info!(
            run_id = %run_id,
            project = %project.name,
            target = %target.name,
            strategy = %strategy,
            units = unit_ids.len(),
            "run started"
        );
        ctx.record(RunEvent::RunStarted {
            run_id: run_id.clone(),
            project: project.name.clone(),
            target: target.name.clone(),
            strategy,
            started_at: ctx.run.started_at,
            units: unit_ids,
            resumed,
        })?;

        if let Some(metrics) = &self.metrics {
            let run = ctx.run.clone();
            metrics
                .call(move |db| db.upsert_run(&run))
                .await
                .map_err(OrchestratorError::Metrics)?;
        }
        // Zero-unit boundary: an interrupt before the first unit finishes
        // still leaves a checkpoint to resume from.
        self.checkpoints.save(&ctx.checkpoint)?;
        if let Some(ui) = &self.ui {
            ui.restore_completed(ctx.state.count(UnitStatus::Done) as u64);
        }

        let aborted = self.schedule(&mut ctx, &order).await?;

        let status = if aborted {
            RunStatus::Aborted
        } else if ctx.state.all_done() {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        ctx.run.finish(status);
        ctx.record(RunEvent::RunFinished {
            status,
            ended_at: ctx.run.ended_at.unwrap_or_else(Utc::now),
            wall_clock_ms: invocation_start.elapsed().as_millis() as u64,
        })?;
        self.persist_metrics(&ctx).await;

        if status == RunStatus::Succeeded {
            self.checkpoints.clear(&run_id)?;
        }
        if let Some(ui) = &self.ui {
            ui.finish(status);
        }
        info!(
            run_id = %run_id,
            status = %status,
            done = ctx.state.count(UnitStatus::Done),
            failed = ctx.state.count(UnitStatus::Failed),
            "run finished"
        );

        let units = order.iter().map(|&i| ctx.state.unit(i).clone()).collect();
        let failure_reasons = order
            .iter()
            .filter(|&&i| ctx.state.unit(i).status == UnitStatus::Failed)
            .filter_map(|&i| {
                let reason = ctx.state.reason(i)?;
                Some((ctx.state.unit(i).id.clone(), reason.to_string()))
            })
            .collect();
        Ok(RunResult {
            failure_reasons,
            failed_unit: ctx.last_failure.as_ref().map(|f| f.unit_id.clone()),
            last_failure: ctx.last_failure,
            run: ctx.run,
            units,
            journal_path,
        })
    }

    /// Process units in order. Returns whether the run was cancelled.
    async fn schedule(
        &self,
        ctx: &mut RunContext<'_>,
        order: &[UnitIndex],
    ) -> Result<bool, OrchestratorError> {
        let mut halted = false;
        for &index in order {
            if self.cancel.is_cancelled() {
                return Ok(true);
            }
            let unit_id = ctx.state.unit(index).id.clone();
            if ctx.state.unit(index).status == UnitStatus::Done {
                continue;
            }

            if ctx.state.any_dependency_failed(index) {
                ctx.state.mark_failed(index, DEPENDENCY_FAILED);
                ctx.record(RunEvent::UnitFinished {
                    unit_id: unit_id.clone(),
                    status: UnitStatus::Failed,
                    attempts: 0,
                    duration_ms: 0,
                    reason: Some(DEPENDENCY_FAILED.to_string()),
                })?;
                warn!(unit = %unit_id, "skipping unit: {}", DEPENDENCY_FAILED);
                if let Some(ui) = &self.ui {
                    ui.unit_skipped(&unit_id, DEPENDENCY_FAILED);
                }
                self.boundary(ctx).await?;
                continue;
            }
            if halted || !ctx.state.dependencies_done(index) {
                debug!(unit = %unit_id, "unit left pending");
                continue;
            }

            let span = info_span!("unit", run_id = %ctx.run.run_id, unit = %unit_id);
            match self.run_unit(ctx, index).instrument(span).await? {
                UnitOutcome::Done => {
                    ctx.checkpoint.mark_completed(&unit_id);
                    if ctx.checkpoint.current_unit_id.as_deref() == Some(unit_id.as_str()) {
                        ctx.checkpoint.current_unit_id = None;
                    }
                    self.boundary(ctx).await?;
                }
                UnitOutcome::Failed(record) => {
                    ctx.checkpoint.current_unit_id = Some(unit_id.clone());
                    ctx.checkpoint.last_failure = Some(record.clone());
                    ctx.last_failure = Some(record);
                    self.boundary(ctx).await?;
                    if self.settings.failure_policy == FailurePolicy::Halt {
                        info!(unit = %unit_id, "halting: no new units will start");
                        halted = true;
                    }
                }
                UnitOutcome::Aborted => return Ok(true),
            }
        }
        Ok(false)
    }

    /// Persist the checkpoint and metrics after a unit reached `Done` or
    /// `Failed`.
    async fn boundary(&self, ctx: &mut RunContext<'_>) -> Result<(), OrchestratorError> {
        ctx.checkpoint.saved_at = Utc::now();
        self.checkpoints.save(&ctx.checkpoint)?;
        self.persist_metrics(ctx).await;
        Ok(())
    }

    async fn persist_metrics(&self, ctx: &RunContext<'_>) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let events = ctx.events.clone();
        let run = ctx.run.clone();
        let result = metrics
            .call(move |db| {
                persist_events(db, &events)?;
                db.upsert_run(&run)
            })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "failed to record metrics");
        }
    }

    async fn run_unit(
        &self,
        ctx: &mut RunContext<'_>,
        index: UnitIndex,
    ) -> Result<UnitOutcome, OrchestratorError> {
        let start = Instant::now();
        let max_attempts = self.settings.max_retries + 1;
        let offset = ctx
            .attempt_offsets
            .get(&ctx.state.unit(index).id)
            .copied()
            .unwrap_or(0);
        let mut feedback: Option<Feedback> = None;

        loop {
            let local_attempt = ctx.state.start_attempt(index);
            let attempt = offset + local_attempt;
            let unit = ctx.state.unit(index).clone();
            info!(attempt, local_attempt, max_attempts, "unit attempt started");
            if let Some(ui) = &self.ui {
                ui.start_unit(&unit.id, local_attempt, max_attempts);
            }

            match self.attempt(ctx, &unit, attempt, feedback.as_ref()).await? {
                AttemptResult::Passed => {
                    ctx.state.mark_done(index);
                    ctx.record(RunEvent::UnitFinished {
                        unit_id: unit.id.clone(),
                        status: UnitStatus::Done,
                        attempts: local_attempt,
                        duration_ms: start.elapsed().as_millis() as u64,
                        reason: None,
                    })?;
                    info!(attempts = local_attempt, "unit done");
                    if let Some(ui) = &self.ui {
                        ui.unit_done(&unit.id, local_attempt);
                    }
                    return Ok(UnitOutcome::Done);
                }
                AttemptResult::Cancelled => {
                    ctx.state.reset(index);
                    info!("unit interrupted by cancellation");
                    return Ok(UnitOutcome::Aborted);
                }
                AttemptResult::Failed {
                    phase,
                    message,
                    feedback: next_feedback,
                } => match after_failed_attempt(local_attempt, self.settings.max_retries) {
                    AttemptStep::Retry(n) => {
                        let delay =
                            backoff_delay(self.settings.backoff, self.settings.max_backoff, n);
                        warn!(%phase, error = %message, retry = n, "attempt failed, retrying");
                        if let Some(ui) = &self.ui {
                            ui.retry(&unit.id, local_attempt + 1, delay);
                        }
                        feedback = Some(next_feedback);
                        tokio::select! {
                            _ = self.cancel.cancelled() => {
                                ctx.state.reset(index);
                                return Ok(UnitOutcome::Aborted);
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    AttemptStep::Exhausted => {
                        let failure = OrchestratorError::UnitFailed {
                            unit: unit.id.clone(),
                            attempts: local_attempt,
                            reason: message.clone(),
                        };
                        warn!(error = %failure, "unit failed");
                        ctx.state.mark_failed(index, message.clone());
                        ctx.record(RunEvent::UnitFinished {
                            unit_id: unit.id.clone(),
                            status: UnitStatus::Failed,
                            attempts: local_attempt,
                            duration_ms: start.elapsed().as_millis() as u64,
                            reason: Some(message.clone()),
                        })?;
                        if let Some(ui) = &self.ui {
                            ui.unit_failed(&unit.id, &message);
                        }
                        return Ok(UnitOutcome::Failed(FailureRecord {
                            unit_id: unit.id,
                            phase,
                            message,
                        }));
                    }
                },
            }
        }
    }

    /// One pass through the four agent phases and the gate check.
    async fn attempt(
        &self,
        ctx: &mut RunContext<'_>,
        unit: &WorkUnit,
        attempt: u32,
        feedback: Option<&Feedback>,
    ) -> Result<AttemptResult, OrchestratorError> {
        let mut artifacts: Vec<PathBuf> = Vec::new();

        for phase in UnitPhase::AGENT_PHASES {
            if self.cancel.is_cancelled() {
                return Ok(AttemptResult::Cancelled);
            }
            if let Some(ui) = &self.ui {
                ui.start_phase(&unit.id, phase);
            }

            let instructions = build_instructions(&InstructionContext {
                project: ctx.project,
                target: &ctx.target.name,
                target_dir: &ctx.target.subdir,
                unit,
                phase,
                attempt,
                feedback: if phase == UnitPhase::Contracting {
                    feedback
                } else {
                    None
                },
            });
            let call = AgentCall {
                run_id: ctx.run.run_id.clone(),
                unit_id: unit.id.clone(),
                phase,
                attempt,
                instructions,
                continuation_token: ctx.checkpoint.continuation_token.clone(),
            };

            let phase_start = Instant::now();
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(AttemptResult::Cancelled),
                r = tokio::time::timeout(self.settings.agent_timeout, self.agent.invoke(&call)) => r,
            };
            let outcome = match outcome {
                Ok(Ok(output)) if output.artifacts.is_empty() => Err(AgentError::NoArtifacts),
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(AgentError::Timeout {
                    secs: self.settings.agent_timeout.as_secs(),
                }),
            };
            let duration_ms = phase_start.elapsed().as_millis() as u64;

            match outcome {
                Ok(output) => {
                    ctx.record(RunEvent::PhaseCompleted {
                        unit_id: unit.id.clone(),
                        phase,
                        attempt,
                        ok: true,
                        duration_ms,
                        usage: UsageRecord {
                            cost_usd: output.usage.cost_usd,
                            input_tokens: output.usage.input_tokens,
                            output_tokens: output.usage.output_tokens,
                            turns: output.usage.turns,
                        },
                        error: None,
                    })?;
                    if output.continuation_token.is_some() {
                        ctx.checkpoint.continuation_token = output.continuation_token;
                    }
                    artifacts = output.artifacts;
                    debug!(%phase, duration_ms, "phase completed");
                }
                Err(source) => {
                    let message = source.to_string();
                    ctx.record(RunEvent::PhaseCompleted {
                        unit_id: unit.id.clone(),
                        phase,
                        attempt,
                        ok: false,
                        duration_ms,
                        usage: UsageRecord::default(),
                        error: Some(message.clone()),
                    })?;
                    let err = OrchestratorError::AgentExecution {
                        unit: unit.id.clone(),
                        phase,
                        source,
                    };
                    warn!(error = %err, "agent call failed");
                    return Ok(AttemptResult::Failed {
                        phase,
                        message: err.to_string(),
                        feedback: Feedback::Agent { phase, message },
                    });
                }
            }
        }

        if self.cancel.is_cancelled() {
            return Ok(AttemptResult::Cancelled);
        }
        if let Some(ui) = &self.ui {
            ui.start_phase(&unit.id, UnitPhase::GateCheck);
        }
        let report = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(AttemptResult::Cancelled),
            r = self.gates.evaluate(unit, attempt, &artifacts, &ctx.target.gates, self.settings.gate_mode) => r,
        };
        let report = match report {
            Ok(report) => report,
            Err(e) => {
                let message = format!("gate harness error: {}", e);
                warn!(error = %e, "gate harness could not run");
                return Ok(AttemptResult::Failed {
                    phase: UnitPhase::GateCheck,
                    feedback: Feedback::Agent {
                        phase: UnitPhase::GateCheck,
                        message: message.clone(),
                    },
                    message,
                });
            }
        };

        for result in &report.results {
            if let Some(ui) = &self.ui {
                ui.gate_result(result);
            }
            ctx.record(RunEvent::GateEvaluated {
                result: result.clone(),
            })?;
        }

        if report.passed {
            return Ok(AttemptResult::Passed);
        }
        let Some(failed) = report.first_failure() else {
            return Ok(AttemptResult::Passed);
        };
        let err = OrchestratorError::QualityGateFailure {
            unit: unit.id.clone(),
            gate: failed.gate_name.clone(),
            excerpt: failed.output_excerpt.clone(),
        };
        warn!(error = %err, "quality gate failed");
        let reason = failed
            .failure
            .as_ref()
            .map(|f| f.to_string())
            .unwrap_or_else(|| "failed".to_string());
        Ok(AttemptResult::Failed {
            phase: UnitPhase::GateCheck,
            message: format!("gate '{}' failed: {}", failed.gate_name, reason),
            feedback: Feedback::Gate {
                gate_name: failed.gate_name.clone(),
                excerpt: failed.output_excerpt.clone(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use porter_common::{GateFailure, GateSpec, ModuleDef, QualityGateResult};
    use tempfile::{TempDir, tempdir};

    use crate::agent::{AgentOutput, AgentUsage};
    use crate::checkpoint::FileCheckpointStore;
    use crate::errors::{CheckpointError, GateError};
    use crate::gates::GateReport;
    use crate::metrics::MetricsDb;

    /// Agent double: fails the listed (unit, phase, attempt) calls, sleeps
    /// on request, and can trip a cancellation token when it reaches a unit.
    #[derive(Default)]
    struct ScriptedAgent {
        calls: Mutex<Vec<AgentCall>>,
        failures: HashSet<(String, UnitPhase, u32)>,
        slow_units: HashSet<String>,
        cancel_on: Option<(String, CancellationToken)>,
    }

    impl ScriptedAgent {
        fn failing(mut self, unit: &str, phase: UnitPhase, attempt: u32) -> Self {
            self.failures.insert((unit.to_string(), phase, attempt));
            self
        }

        fn calls(&self) -> Vec<AgentCall> {
            self.calls.lock().unwrap().clone()
        }

        fn calls_for(&self, unit: &str) -> usize {
            self.calls().iter().filter(|c| c.unit_id == unit).count()
        }
    }

    #[async_trait]
    impl AgentExecutor for ScriptedAgent {
        async fn invoke(&self, call: &AgentCall) -> Result<AgentOutput, AgentError> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(call.clone());
                calls.len()
            };
            if let Some((unit, token)) = &self.cancel_on
                && unit == &call.unit_id
            {
                token.cancel();
                std::future::pending::<()>().await;
            }
            if self.slow_units.contains(&call.unit_id) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self
                .failures
                .contains(&(call.unit_id.clone(), call.phase, call.attempt))
            {
                return Err(AgentError::NonZeroExit { exit_code: 1 });
            }
            Ok(AgentOutput {
                artifacts: vec![PathBuf::from(format!("{}-{}.log", call.unit_id, call.phase))],
                continuation_token: Some(format!("tok-{}", n)),
                usage: AgentUsage {
                    cost_usd: 0.01,
                    input_tokens: 10,
                    output_tokens: 5,
                    turns: 1,
                    duration_ms: 1,
                },
            })
        }
    }

    /// Gate double: per unit, a sequence of pass/fail verdicts consumed one
    /// per evaluation. Units without a script pass; an exhausted script
    /// repeats its last verdict.
    #[derive(Default)]
    struct ScriptedGates {
        verdicts: Mutex<HashMap<String, Vec<bool>>>,
        evaluations: Mutex<Vec<(String, u32)>>,
    }

    impl ScriptedGates {
        fn script(self, unit: &str, verdicts: &[bool]) -> Self {
            self.verdicts
                .lock()
                .unwrap()
                .insert(unit.to_string(), verdicts.to_vec());
            self
        }
    }

    #[async_trait]
    impl GateEvaluator for ScriptedGates {
        async fn evaluate(
            &self,
            unit: &WorkUnit,
            attempt: u32,
            _artifacts: &[PathBuf],
            _gates: &[GateSpec],
            _mode: GateMode,
        ) -> Result<GateReport, GateError> {
            self.evaluations
                .lock()
                .unwrap()
                .push((unit.id.clone(), attempt));
            let passed = {
                let mut verdicts = self.verdicts.lock().unwrap();
                match verdicts.get_mut(&unit.id) {
                    Some(list) if list.len() > 1 => list.remove(0),
                    Some(list) => list.first().copied().unwrap_or(true),
                    None => true,
                }
            };
            let result = QualityGateResult {
                unit_id: unit.id.clone(),
                gate_name: "test".into(),
                attempt,
                passed,
                failure: (!passed).then_some(GateFailure::ExitCode { code: 101 }),
                duration_ms: 3,
                output_excerpt: if passed {
                    String::new()
                } else {
                    "assertion failed: left == right".into()
                },
            };
            Ok(GateReport {
                passed,
                results: vec![result],
            })
        }
    }

    struct Harness {
        dir: TempDir,
        metrics: MetricsHandle,
        store: Arc<FileCheckpointStore>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let store = Arc::new(FileCheckpointStore::new(dir.path().join("checkpoints")));
            Self {
                metrics: MetricsHandle::new(MetricsDb::new_in_memory().unwrap()),
                store,
                dir,
            }
        }

        fn settings(&self, max_retries: u32, policy: FailurePolicy) -> RunSettings {
            RunSettings {
                max_retries,
                failure_policy: policy,
                gate_mode: GateMode::FailFast,
                backoff: Duration::ZERO,
                max_backoff: Duration::ZERO,
                agent_timeout: Duration::from_secs(30),
                workdir: self.dir.path().to_path_buf(),
                log_dir: self.dir.path().join("logs"),
            }
        }

        fn orchestrator(
            &self,
            settings: RunSettings,
            agent: Arc<ScriptedAgent>,
            gates: Arc<ScriptedGates>,
        ) -> Orchestrator {
            Orchestrator::new(settings, agent, gates, self.store.clone())
                .with_metrics(self.metrics.clone())
        }
    }

    fn target() -> ResolvedTarget {
        ResolvedTarget {
            name: "rust".into(),
            subdir: "calc-rs".into(),
            gates: vec![GateSpec::new("test", "true", 60)],
        }
    }

    fn project(modules: &[(&str, &[&str])]) -> Project {
        Project::with_modules(
            "calc",
            modules
                .iter()
                .map(|(name, deps)| ModuleDef::new(name, &format!("{}.py", name), deps))
                .collect(),
        )
    }

    fn status_of(result: &RunResult, id: &str) -> UnitStatus {
        result
            .units
            .iter()
            .find(|u| u.id == id)
            .map(|u| u.status)
            .unwrap()
    }

    #[tokio::test]
    async fn gate_failure_then_recovery() {
        let h = Harness::new();
        let agent = Arc::new(ScriptedAgent::default());
        let gates = Arc::new(ScriptedGates::default().script("x", &[false, true]));
        let orch = h.orchestrator(
            h.settings(2, FailurePolicy::ContinueIndependent),
            agent.clone(),
            gates,
        );

        let result = orch
            .run(&project(&[("x", &[])]), &target(), Strategy::ModuleByModule, None)
            .await
            .unwrap();

        assert_eq!(result.status(), RunStatus::Succeeded);
        assert_eq!(status_of(&result, "x"), UnitStatus::Done);
        assert_eq!(agent.calls().len(), 8);

        let retry_contract = &agent.calls()[4];
        assert_eq!(retry_contract.phase, UnitPhase::Contracting);
        assert_eq!(retry_contract.attempt, 2);
        assert!(retry_contract.instructions.contains("FEEDBACK FROM PREVIOUS ATTEMPT"));
        assert!(retry_contract.instructions.contains("assertion failed"));
        assert!(!agent.calls()[5].instructions.contains("FEEDBACK"));

        let run_id = result.run.run_id.clone();
        let db = h.metrics.lock_sync().unwrap();
        let gate_rows = db.gate_results(&run_id).unwrap();
        assert_eq!(gate_rows.len(), 2);
        assert!(!gate_rows[0].passed);
        assert!(gate_rows[1].passed);
        let attempts = db
            .metrics_for(&run_id)
            .unwrap()
            .into_iter()
            .find(|m| m.category == "unit:x" && m.key == "attempts")
            .unwrap();
        assert_eq!(attempts.value, 2.0);
        assert_eq!(
            db.get_run(&run_id).unwrap().unwrap().status,
            RunStatus::Succeeded
        );
        drop(db);

        assert!(matches!(
            h.store.load(&run_id),
            Err(CheckpointError::NotFound { .. })
        ));
        assert!(h.dir.path().join("calc-rs").is_dir());
    }

    #[tokio::test]
    async fn retry_bound_is_max_retries_plus_one() {
        let h = Harness::new();
        let agent = Arc::new(ScriptedAgent::default());
        let gates = Arc::new(ScriptedGates::default().script("x", &[false]));
        let orch = h.orchestrator(
            h.settings(2, FailurePolicy::ContinueIndependent),
            agent.clone(),
            gates.clone(),
        );

        let result = orch
            .run(&project(&[("x", &[])]), &target(), Strategy::ModuleByModule, None)
            .await
            .unwrap();

        assert_eq!(result.status(), RunStatus::Failed);
        assert_eq!(result.failed_unit.as_deref(), Some("x"));
        assert_eq!(gates.evaluations.lock().unwrap().len(), 3);
        assert_eq!(agent.calls().len(), 12);
        assert_eq!(result.units[0].attempts, 3);

        let failure = result.last_failure.unwrap();
        assert_eq!(failure.phase, UnitPhase::GateCheck);
        assert!(failure.message.contains("gate 'test' failed"));

        let checkpoint = h.store.load(&result.run.run_id).unwrap();
        assert_eq!(checkpoint.current_unit_id.as_deref(), Some("x"));
        assert!(checkpoint.completed_unit_ids.is_empty());
        assert_eq!(checkpoint.continuation_token.as_deref(), Some("tok-12"));
    }

    #[tokio::test]
    async fn agent_errors_share_the_attempt_budget() {
        let h = Harness::new();
        let agent = Arc::new(ScriptedAgent::default().failing("x", UnitPhase::Migrating, 1));
        let gates = Arc::new(ScriptedGates::default());
        let orch = h.orchestrator(
            h.settings(1, FailurePolicy::ContinueIndependent),
            agent.clone(),
            gates,
        );

        let result = orch
            .run(&project(&[("x", &[])]), &target(), Strategy::ModuleByModule, None)
            .await
            .unwrap();

        assert_eq!(result.status(), RunStatus::Succeeded);
        assert_eq!(result.units[0].attempts, 2);
        // contracting, analyzing, failed migrating, then a full second attempt
        assert_eq!(agent.calls().len(), 7);
        assert!(agent.calls()[3].instructions.contains("The migrating phase failed"));
    }

    #[tokio::test]
    async fn agent_timeout_fails_the_attempt() {
        let h = Harness::new();
        let mut agent = ScriptedAgent::default();
        agent.slow_units.insert("x".into());
        let agent = Arc::new(agent);
        let mut settings = h.settings(0, FailurePolicy::ContinueIndependent);
        settings.agent_timeout = Duration::from_millis(50);
        let orch = h.orchestrator(settings, agent.clone(), Arc::new(ScriptedGates::default()));

        let result = orch
            .run(&project(&[("x", &[])]), &target(), Strategy::ModuleByModule, None)
            .await
            .unwrap();

        assert_eq!(result.status(), RunStatus::Failed);
        let failure = result.last_failure.unwrap();
        assert_eq!(failure.phase, UnitPhase::Contracting);
        assert!(failure.message.contains("timed out"));
        assert_eq!(agent.calls().len(), 1);
    }

    #[tokio::test]
    async fn dependency_failure_propagates() {
        let h = Harness::new();
        let agent = Arc::new(ScriptedAgent::default());
        let gates = Arc::new(ScriptedGates::default().script("a", &[false]));
        let orch = h.orchestrator(
            h.settings(1, FailurePolicy::ContinueIndependent),
            agent.clone(),
            gates,
        );

        let result = orch
            .run(
                &project(&[("a", &[]), ("b", &["a"]), ("c", &[])]),
                &target(),
                Strategy::ModuleByModule,
                None,
            )
            .await
            .unwrap();

        assert_eq!(result.status(), RunStatus::Failed);
        assert_eq!(status_of(&result, "a"), UnitStatus::Failed);
        assert_eq!(status_of(&result, "b"), UnitStatus::Failed);
        assert_eq!(status_of(&result, "c"), UnitStatus::Done);
        assert_eq!(agent.calls_for("b"), 0);
        assert_eq!(result.failed_unit.as_deref(), Some("a"));

        let reasons: HashMap<&str, &str> = result
            .failure_reasons
            .iter()
            .map(|(unit, reason)| (unit.as_str(), reason.as_str()))
            .collect();
        assert_eq!(reasons.len(), 2);
        assert_eq!(reasons["b"], DEPENDENCY_FAILED);
        assert!(reasons["a"].contains("gate 'test' failed"));

        let events = journal::read_events(&result.journal_path).unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            RunEvent::UnitFinished { unit_id, reason: Some(reason), attempts: 0, .. }
                if unit_id == "b" && reason == DEPENDENCY_FAILED
        )));

        let checkpoint = h.store.load(&result.run.run_id).unwrap();
        assert_eq!(checkpoint.completed_unit_ids, vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn halt_policy_leaves_independent_units_pending() {
        let h = Harness::new();
        let agent = Arc::new(ScriptedAgent::default());
        let gates = Arc::new(ScriptedGates::default().script("a", &[false]));
        let orch = h.orchestrator(h.settings(0, FailurePolicy::Halt), agent.clone(), gates);

        let result = orch
            .run(
                &project(&[("a", &[]), ("b", &["a"]), ("c", &[])]),
                &target(),
                Strategy::ModuleByModule,
                None,
            )
            .await
            .unwrap();

        assert_eq!(result.status(), RunStatus::Failed);
        assert_eq!(status_of(&result, "b"), UnitStatus::Failed);
        assert_eq!(status_of(&result, "c"), UnitStatus::Pending);
        assert_eq!(agent.calls_for("c"), 0);
    }

    #[tokio::test]
    async fn resume_reaches_the_same_end_state() {
        let modules: &[(&str, &[&str])] = &[("a", &[]), ("b", &["a"]), ("c", &["b"])];

        let baseline = {
            let h = Harness::new();
            let orch = h.orchestrator(
                h.settings(2, FailurePolicy::ContinueIndependent),
                Arc::new(ScriptedAgent::default()),
                Arc::new(ScriptedGates::default()),
            );
            orch.run(&project(modules), &target(), Strategy::ModuleByModule, None)
                .await
                .unwrap()
        };

        let h = Harness::new();
        let first = h
            .orchestrator(
                h.settings(2, FailurePolicy::ContinueIndependent),
                Arc::new(ScriptedAgent::default()),
                Arc::new(ScriptedGates::default().script("b", &[false])),
            )
            .run(&project(modules), &target(), Strategy::ModuleByModule, None)
            .await
            .unwrap();
        assert_eq!(first.status(), RunStatus::Failed);

        let checkpoint = h.store.load(&first.run.run_id).unwrap();
        assert_eq!(checkpoint.completed_unit_ids, vec!["a".to_string()]);
        assert_eq!(checkpoint.current_unit_id.as_deref(), Some("b"));

        let agent = Arc::new(ScriptedAgent::default());
        let second = h
            .orchestrator(
                h.settings(2, FailurePolicy::ContinueIndependent),
                agent.clone(),
                Arc::new(ScriptedGates::default()),
            )
            .run(
                &project(modules),
                &target(),
                Strategy::ModuleByModule,
                Some(checkpoint.clone()),
            )
            .await
            .unwrap();

        assert_eq!(second.status(), baseline.status());
        assert_eq!(second.run.run_id, first.run.run_id);
        let done = |r: &RunResult| -> HashSet<String> {
            r.units
                .iter()
                .filter(|u| u.status == UnitStatus::Done)
                .map(|u| u.id.clone())
                .collect()
        };
        assert_eq!(done(&second), done(&baseline));
        assert_eq!(agent.calls_for("a"), 0);

        // The token survives the restart, and attempt numbers continue.
        let first_call = &agent.calls()[0];
        assert_eq!(first_call.continuation_token, checkpoint.continuation_token);
        assert_eq!(first_call.unit_id, "b");
        assert_eq!(first_call.attempt, 4);

        let db = h.metrics.lock_sync().unwrap();
        let b_attempts: Vec<u32> = db
            .gate_results(&first.run.run_id)
            .unwrap()
            .into_iter()
            .filter(|r| r.unit_id == "b")
            .map(|r| r.attempt)
            .collect();
        assert_eq!(b_attempts, vec![1, 2, 3, 4]);
        drop(db);

        assert!(matches!(
            h.store.load(&first.run.run_id),
            Err(CheckpointError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn resume_keeps_strategy_order() {
        let modules: &[(&str, &[&str])] = &[("x", &[]), ("a", &[])];
        let h = Harness::new();
        let first = h
            .orchestrator(
                h.settings(0, FailurePolicy::ContinueIndependent),
                Arc::new(ScriptedAgent::default()),
                Arc::new(
                    ScriptedGates::default()
                        .script("x", &[false])
                        .script("a", &[false]),
                ),
            )
            .run(&project(modules), &target(), Strategy::ModuleByModule, None)
            .await
            .unwrap();
        assert_eq!(first.status(), RunStatus::Failed);
        let first_order: Vec<&str> = first.units.iter().map(|u| u.id.as_str()).collect();

        let checkpoint = h.store.load(&first.run.run_id).unwrap();
        assert!(checkpoint.completed_unit_ids.is_empty());
        let current = checkpoint.current_unit_id.clone().unwrap();
        assert_eq!(current, first_order[1]);

        let agent = Arc::new(ScriptedAgent::default());
        let gates = Arc::new(ScriptedGates::default());
        let second = h
            .orchestrator(
                h.settings(0, FailurePolicy::ContinueIndependent),
                agent.clone(),
                gates.clone(),
            )
            .run(
                &project(modules),
                &target(),
                Strategy::ModuleByModule,
                Some(checkpoint),
            )
            .await
            .unwrap();
        assert_eq!(second.status(), RunStatus::Succeeded);

        // The last unit to fail is not pulled ahead of earlier ones.
        let evaluated: Vec<String> = gates
            .evaluations
            .lock()
            .unwrap()
            .iter()
            .map(|(unit, _)| unit.clone())
            .collect();
        assert_eq!(evaluated, first_order);
        assert_eq!(agent.calls()[0].unit_id, first_order[0]);
    }

    #[tokio::test]
    async fn resume_survives_torn_journal_tail() {
        let modules: &[(&str, &[&str])] = &[("a", &[]), ("b", &["a"])];
        let h = Harness::new();
        let first = h
            .orchestrator(
                h.settings(0, FailurePolicy::ContinueIndependent),
                Arc::new(ScriptedAgent::default()),
                Arc::new(ScriptedGates::default().script("b", &[false])),
            )
            .run(&project(modules), &target(), Strategy::ModuleByModule, None)
            .await
            .unwrap();
        assert_eq!(first.status(), RunStatus::Failed);

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&first.journal_path)
            .unwrap();
        std::io::Write::write_all(&mut file, b"{\"event\":\"phase_compl").unwrap();
        drop(file);

        let checkpoint = h.store.load(&first.run.run_id).unwrap();
        let second = h
            .orchestrator(
                h.settings(0, FailurePolicy::ContinueIndependent),
                Arc::new(ScriptedAgent::default()),
                Arc::new(ScriptedGates::default()),
            )
            .run(
                &project(modules),
                &target(),
                Strategy::ModuleByModule,
                Some(checkpoint),
            )
            .await
            .unwrap();
        assert_eq!(second.status(), RunStatus::Succeeded);

        let events = journal::read_events(&second.journal_path).unwrap();
        let starts = events
            .iter()
            .filter(|e| matches!(e, RunEvent::RunStarted { .. }))
            .count();
        assert_eq!(starts, 2);
    }

    #[tokio::test]
    async fn cancellation_before_start_aborts() {
        let h = Harness::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let agent = Arc::new(ScriptedAgent::default());
        let orch = h
            .orchestrator(
                h.settings(2, FailurePolicy::ContinueIndependent),
                agent.clone(),
                Arc::new(ScriptedGates::default()),
            )
            .with_cancellation(cancel);

        let result = orch
            .run(&project(&[("a", &[])]), &target(), Strategy::ModuleByModule, None)
            .await
            .unwrap();

        assert_eq!(result.status(), RunStatus::Aborted);
        assert!(agent.calls().is_empty());
        let checkpoint = h.store.load(&result.run.run_id).unwrap();
        assert!(checkpoint.completed_unit_ids.is_empty());
        assert!(checkpoint.current_unit_id.is_none());
    }

    #[tokio::test]
    async fn cancellation_mid_unit_keeps_last_boundary() {
        let h = Harness::new();
        let cancel = CancellationToken::new();
        let agent = Arc::new(ScriptedAgent {
            cancel_on: Some(("b".into(), cancel.clone())),
            ..Default::default()
        });
        let orch = h
            .orchestrator(
                h.settings(2, FailurePolicy::ContinueIndependent),
                agent.clone(),
                Arc::new(ScriptedGates::default()),
            )
            .with_cancellation(cancel);

        let result = orch
            .run(
                &project(&[("a", &[]), ("b", &["a"])]),
                &target(),
                Strategy::ModuleByModule,
                None,
            )
            .await
            .unwrap();

        assert_eq!(result.status(), RunStatus::Aborted);
        assert_eq!(status_of(&result, "a"), UnitStatus::Done);
        assert_eq!(status_of(&result, "b"), UnitStatus::Pending);

        let checkpoint = h.store.load(&result.run.run_id).unwrap();
        assert_eq!(checkpoint.completed_unit_ids, vec!["a".to_string()]);
        assert!(checkpoint.current_unit_id.is_none());
    }

    #[tokio::test]
    async fn inconsistent_checkpoint_is_fatal_and_writes_nothing() {
        let h = Harness::new();
        let mut checkpoint = Checkpoint::new("run-x");
        checkpoint.mark_completed("ghost");
        let orch = h.orchestrator(
            h.settings(2, FailurePolicy::ContinueIndependent),
            Arc::new(ScriptedAgent::default()),
            Arc::new(ScriptedGates::default()),
        );

        let err = orch
            .run(
                &project(&[("a", &[])]),
                &target(),
                Strategy::ModuleByModule,
                Some(checkpoint),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::CheckpointCorruption { .. }));
        assert!(!h.dir.path().join("logs").exists());
        assert!(h.store.load("run-x").is_err());
    }

    #[tokio::test]
    async fn cycle_is_fatal() {
        let h = Harness::new();
        let orch = h.orchestrator(
            h.settings(2, FailurePolicy::ContinueIndependent),
            Arc::new(ScriptedAgent::default()),
            Arc::new(ScriptedGates::default()),
        );
        let err = orch
            .run(
                &project(&[("a", &["b"]), ("b", &["a"])]),
                &target(),
                Strategy::ModuleByModule,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::CyclicDependency { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn offsets_take_highest_attempt() {
        let events = vec![
            RunEvent::PhaseCompleted {
                unit_id: "a".into(),
                phase: UnitPhase::Contracting,
                attempt: 2,
                ok: true,
                duration_ms: 1,
                usage: UsageRecord::default(),
                error: None,
            },
            RunEvent::PhaseCompleted {
                unit_id: "a".into(),
                phase: UnitPhase::Contracting,
                attempt: 1,
                ok: true,
                duration_ms: 1,
                usage: UsageRecord::default(),
                error: None,
            },
        ];
        assert_eq!(attempt_offsets(&events).get("a"), Some(&2));
    }
}
