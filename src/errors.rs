//! Typed error hierarchy for the Porter orchestrator.
//!
//! - `OrchestratorError`: run-level failures, fatal or terminal
//! - `AgentError`: one failed agent invocation (retryable)
//! - `GateError`: the gate harness itself could not run
//! - `CheckpointError`: checkpoint store failures

use porter_common::{CheckpointInconsistency, ConfigError, UnitPhase};
use thiserror::Error;

/// Errors from the orchestrator and the stores it drives.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Cyclic dependency between units: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Agent execution failed for unit '{unit}' in {phase}: {source}")]
    AgentExecution {
        unit: String,
        phase: UnitPhase,
        #[source]
        source: AgentError,
    },

    #[error("Quality gate '{gate}' failed for unit '{unit}': {excerpt}")]
    QualityGateFailure {
        unit: String,
        gate: String,
        excerpt: String,
    },

    #[error("Unit '{unit}' failed after {attempts} attempts: {reason}")]
    UnitFailed {
        unit: String,
        attempts: u32,
        reason: String,
    },

    #[error("Checkpoint for run '{run_id}' is corrupt: {reason}")]
    CheckpointCorruption { run_id: String, reason: String },

    #[error("Checkpoint store error: {0}")]
    Checkpoint(#[source] anyhow::Error),

    #[error("Metrics store error: {0}")]
    Metrics(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn corruption(run_id: &str, inconsistency: CheckpointInconsistency) -> Self {
        OrchestratorError::CheckpointCorruption {
            run_id: run_id.to_string(),
            reason: inconsistency.to_string(),
        }
    }

    /// Fatal errors stop a run before or as soon as they are detected and are
    /// never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Config(_)
                | OrchestratorError::CyclicDependency { .. }
                | OrchestratorError::CheckpointCorruption { .. }
        )
    }
}

/// Errors from a single agent invocation.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to spawn agent command '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent exited with non-zero code {exit_code}")]
    NonZeroExit { exit_code: i32 },

    #[error("Agent timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Agent reported an error: {0}")]
    Reported(String),

    #[error("Agent produced no artifacts")]
    NoArtifacts,

    #[error("Agent I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that prevent the gate harness from evaluating at all.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Gate working directory {path} does not exist")]
    MissingWorkdir { path: std::path::PathBuf },
}

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("No checkpoint found for run '{run_id}'")]
    NotFound { run_id: String },

    #[error("Checkpoint at {path} cannot be parsed: {reason}")]
    Corrupt {
        path: std::path::PathBuf,
        reason: String,
    },

    #[error("Checkpoint I/O failed at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<CheckpointError> for OrchestratorError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::Corrupt { path, reason } => OrchestratorError::CheckpointCorruption {
                run_id: path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                reason,
            },
            other => OrchestratorError::Checkpoint(other.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_units_in_order() {
        let err = OrchestratorError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency between units: a -> b -> a");
        assert!(err.is_fatal());
    }

    #[test]
    fn agent_execution_keeps_source() {
        let err = OrchestratorError::AgentExecution {
            unit: "lexer".into(),
            phase: UnitPhase::Migrating,
            source: AgentError::NonZeroExit { exit_code: 3 },
        };
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("migrating"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn config_error_converts() {
        let err: OrchestratorError = ConfigError::EmptyName.into();
        match &err {
            OrchestratorError::Config(ConfigError::EmptyName) => {}
            _ => panic!("Expected Config(EmptyName)"),
        }
        assert!(err.is_fatal());
    }

    #[test]
    fn corruption_carries_inconsistency_reason() {
        let err = OrchestratorError::corruption(
            "run-1",
            CheckpointInconsistency::UnknownCurrent("ghost".into()),
        );
        assert!(err.to_string().contains("ghost"));
        assert!(err.is_fatal());
    }

    #[test]
    fn corrupt_checkpoint_is_fatal() {
        let err: OrchestratorError = CheckpointError::Corrupt {
            path: std::path::PathBuf::from("/x/checkpoints/run-7.json"),
            reason: "expected value".into(),
        }
        .into();
        match &err {
            OrchestratorError::CheckpointCorruption { run_id, .. } => assert_eq!(run_id, "run-7"),
            other => panic!("Expected CheckpointCorruption, got {other:?}"),
        }
        assert!(err.is_fatal());
    }

    #[test]
    fn missing_checkpoint_is_not_fatal() {
        let err: OrchestratorError = CheckpointError::NotFound {
            run_id: "run-7".into(),
        }
        .into();
        assert!(matches!(err, OrchestratorError::Checkpoint(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn agent_timeout_names_duration() {
        let err = AgentError::Timeout { secs: 30 };
        assert!(err.to_string().contains("30s"));
    }
}
