use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use porter_common::{GateFailure, GateMode, GateSpec, QualityGateResult, WorkUnit};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::errors::GateError;

/// Maximum number of characters kept from a gate's combined output.
pub const EXCERPT_CHARS: usize = 2000;

/// Results of one evaluation, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateReport {
    pub passed: bool,
    pub results: Vec<QualityGateResult>,
}

impl GateReport {
    pub fn first_failure(&self) -> Option<&QualityGateResult> {
        self.results.iter().find(|r| !r.passed)
    }
}

/// Runs a unit's gates. Real implementation: [`GateHarness`].
#[async_trait]
pub trait GateEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        unit: &WorkUnit,
        attempt: u32,
        artifacts: &[PathBuf],
        gates: &[GateSpec],
        mode: GateMode,
    ) -> Result<GateReport, GateError>;
}

/// Runs gates as `sh -c <command>` in the target directory.
///
/// Each gate sees `PORTER_UNIT`, `PORTER_ATTEMPT` and `PORTER_ARTIFACTS`
/// (colon-separated paths) in its environment.
pub struct GateHarness {
    working_dir: PathBuf,
}

impl GateHarness {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
        }
    }

    async fn run_gate(
        &self,
        unit: &WorkUnit,
        attempt: u32,
        artifacts: &str,
        gate: &GateSpec,
    ) -> QualityGateResult {
        let start = Instant::now();
        let mut result = QualityGateResult {
            unit_id: unit.id.clone(),
            gate_name: gate.name.clone(),
            attempt,
            passed: false,
            failure: None,
            duration_ms: 0,
            output_excerpt: String::new(),
        };

        debug!(gate = %gate.name, command = %gate.command, "running gate");
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&gate.command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("PORTER_UNIT", &unit.id)
            .env("PORTER_ATTEMPT", attempt.to_string())
            .env("PORTER_ARTIFACTS", artifacts)
            .kill_on_drop(true);
        // Own process group, so a timeout reaches everything the gate spawned.
        #[cfg(unix)]
        command.process_group(0);
        let child = command.spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                result.failure = Some(GateFailure::SpawnFailed {
                    message: e.to_string(),
                });
                result.duration_ms = start.elapsed().as_millis() as u64;
                return result;
            }
        };

        let pgid = child.id();
        match timeout(gate.timeout(), child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.is_empty() {
                    if !combined.is_empty() && !combined.ends_with('\n') {
                        combined.push('\n');
                    }
                    combined.push_str(&stderr);
                }
                result.output_excerpt = excerpt(&combined, EXCERPT_CHARS);
                result.passed = output.status.success();
                if !result.passed {
                    result.failure = Some(match output.status.code() {
                        Some(code) => GateFailure::ExitCode { code },
                        None => GateFailure::Terminated,
                    });
                }
            }
            Ok(Err(e)) => {
                result.failure = Some(GateFailure::SpawnFailed {
                    message: e.to_string(),
                });
            }
            Err(_) => {
                // Dropping the wait future kills the shell (kill_on_drop);
                // the rest of its group goes here.
                if let Some(pgid) = pgid {
                    kill_process_group(pgid);
                }
                result.failure = Some(GateFailure::Timeout {
                    after_secs: gate.timeout_secs,
                });
                result.output_excerpt = format!("gate timed out after {}s", gate.timeout_secs);
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        result
    }
}

#[async_trait]
impl GateEvaluator for GateHarness {
    async fn evaluate(
        &self,
        unit: &WorkUnit,
        attempt: u32,
        artifacts: &[PathBuf],
        gates: &[GateSpec],
        mode: GateMode,
    ) -> Result<GateReport, GateError> {
        if !self.working_dir.is_dir() {
            return Err(GateError::MissingWorkdir {
                path: self.working_dir.clone(),
            });
        }

        let artifacts = artifacts
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");

        let mut report = GateReport {
            passed: true,
            results: Vec::with_capacity(gates.len()),
        };
        for gate in gates {
            let result = self.run_gate(unit, attempt, &artifacts, gate).await;
            if result.passed {
                info!(gate = %gate.name, duration_ms = result.duration_ms, "gate passed");
            } else {
                warn!(
                    gate = %gate.name,
                    reason = %result.failure.as_ref().map(|f| f.to_string()).unwrap_or_default(),
                    "gate failed"
                );
                report.passed = false;
            }
            let failed = !result.passed;
            report.results.push(result);
            if failed && mode == GateMode::FailFast {
                break;
            }
        }
        Ok(report)
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    // SAFETY: killpg takes no pointers; the group was created for this gate.
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

/// The last `max_chars` characters of `text`, prefixed with `...` when cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim_end();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(count - max_chars).collect();
    format!("...{}", tail)
}
