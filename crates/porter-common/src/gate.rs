use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One external validation command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSpec {
    pub name: String,
    pub command: String,
    #[serde(default = "default_gate_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_gate_timeout_secs() -> u64 {
    600
}

impl GateSpec {
    pub fn new(name: &str, command: &str, timeout_secs: u64) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            timeout_secs,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateMode {
    /// Stop at the first failing gate.
    #[default]
    FailFast,
    /// Run every gate and report all results.
    All,
}

impl std::str::FromStr for GateMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail-fast" | "fail_fast" => Ok(GateMode::FailFast),
            "all" => Ok(GateMode::All),
            other => Err(format!(
                "Unknown gate mode '{}': expected fail-fast or all",
                other
            )),
        }
    }
}

/// Why a gate did not pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum GateFailure {
    ExitCode { code: i32 },
    /// Killed by a signal, no exit code.
    Terminated,
    Timeout { after_secs: u64 },
    SpawnFailed { message: String },
}

impl fmt::Display for GateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateFailure::ExitCode { code } => write!(f, "exit code {}", code),
            GateFailure::Terminated => write!(f, "terminated by signal"),
            GateFailure::Timeout { after_secs } => write!(f, "timed out after {}s", after_secs),
            GateFailure::SpawnFailed { message } => write!(f, "failed to start: {}", message),
        }
    }
}

/// Outcome of one gate on one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityGateResult {
    pub unit_id: String,
    pub gate_name: String,
    pub attempt: u32,
    pub passed: bool,
    #[serde(default)]
    pub failure: Option<GateFailure>,
    pub duration_ms: u64,
    pub output_excerpt: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_spec_defaults_timeout() {
        let spec: GateSpec =
            serde_json::from_str(r#"{"name": "build", "command": "cargo check"}"#).unwrap();
        assert_eq!(spec.timeout_secs, 600);
        assert_eq!(spec.timeout(), Duration::from_secs(600));
    }

    #[test]
    fn failure_serializes_with_reason_tag() {
        let json = serde_json::to_value(GateFailure::Timeout { after_secs: 5 }).unwrap();
        assert_eq!(json["reason"], "timeout");
        assert_eq!(json["after_secs"], 5);
    }

    #[test]
    fn gate_mode_defaults_to_fail_fast() {
        assert_eq!(GateMode::default(), GateMode::FailFast);
        assert_eq!("all".parse::<GateMode>().unwrap(), GateMode::All);
        assert!("some".parse::<GateMode>().is_err());
    }

    #[test]
    fn failure_display_is_readable() {
        assert_eq!(GateFailure::ExitCode { code: 101 }.to_string(), "exit code 101");
    }
}
