//! Orchestrator configuration read from `.porter/porter.toml`.
//!
//! Layered file → environment → CLI:
//!
//! ```toml
//! [defaults]
//! max_retries = 2
//! failure_policy = "continue-independent"
//! gate_mode = "fail-fast"
//! backoff_ms = 2000
//! max_backoff_ms = 60000
//! agent_timeout_secs = 1800
//!
//! [agent]
//! command = "claude"
//! args = ["--print", "--output-format", "stream-json", "--verbose"]
//! resume_flag = "--resume"
//!
//! [metrics]
//! db_path = ".porter/metrics.db"
//!
//! [targets.rust]
//! subdir = "{project}-rs"
//!
//! [[targets.rust.gates]]
//! name = "build"
//! command = "cargo check"
//! timeout_secs = 600
//! ```
//!
//! `rust`, `go` and `java` ship as built-in targets; a `[targets.<name>]`
//! table replaces the preset's fields it sets.

use anyhow::{Context, Result};
use porter_common::{ConfigError, GateMode, GateSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const AGENT_CMD_ENV: &str = "PORTER_AGENT_CMD";
pub const METRICS_DB_ENV: &str = "PORTER_METRICS_DB";

/// What happens to the rest of a run after a unit fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Keep running units whose whole dependency closure is done.
    #[default]
    ContinueIndependent,
    /// Start no new units after the first failure.
    Halt,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::ContinueIndependent => write!(f, "continue-independent"),
            FailurePolicy::Halt => write!(f, "halt"),
        }
    }
}

impl std::str::FromStr for FailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "continue-independent" | "continue" => Ok(FailurePolicy::ContinueIndependent),
            "halt" => Ok(FailurePolicy::Halt),
            _ => anyhow::bail!(
                "Invalid failure policy '{}'. Valid values: continue-independent, halt",
                s
            ),
        }
    }
}

/// Run defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Retries per unit after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub gate_mode: GateMode,
    /// Base retry delay; doubles per retry
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Upper bound on a single agent call
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    2000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_agent_timeout_secs() -> u64 {
    1800
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            failure_policy: FailurePolicy::default(),
            gate_mode: GateMode::default(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            agent_timeout_secs: default_agent_timeout_secs(),
        }
    }
}

/// How the agent command is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    /// Flag placed before the continuation token
    #[serde(default = "default_resume_flag")]
    pub resume_flag: String,
}

fn default_agent_args() -> Vec<String> {
    ["--print", "--output-format", "stream-json", "--verbose"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_resume_flag() -> String {
    "--resume".to_string()
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: None,
            args: default_agent_args(),
            resume_flag: default_resume_flag(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSection {
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

/// One `[targets.<name>]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Output directory pattern; `{project}` is substituted
    #[serde(default)]
    pub subdir: Option<String>,
    #[serde(default)]
    pub gates: Vec<GateSpec>,
}

/// A target with its preset and overrides merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub name: String,
    pub subdir: String,
    pub gates: Vec<GateSpec>,
}

/// Built-in gate sets for the supported target languages.
pub fn builtin_target(name: &str) -> Option<TargetConfig> {
    let (subdir, gates): (&str, Vec<GateSpec>) = match name {
        "rust" => (
            "{project}-rs",
            vec![
                GateSpec::new("build", "cargo check && cargo clippy -- -D warnings", 600),
                GateSpec::new("format", "cargo fmt --check", 120),
                GateSpec::new("test", "cargo test", 900),
            ],
        ),
        "go" => (
            "{project}-go",
            vec![
                GateSpec::new("build", "go build ./...", 600),
                GateSpec::new("vet", "go vet ./...", 300),
                GateSpec::new("format", "gofmt -l . | xargs -r test -z", 120),
                GateSpec::new("test", "go test ./...", 900),
            ],
        ),
        "java" => (
            "{project}-java",
            vec![
                GateSpec::new("build", "./gradlew compileJava", 900),
                GateSpec::new("lint", "./gradlew checkstyleMain || true", 600),
                GateSpec::new("test", "./gradlew test", 1200),
            ],
        ),
        _ => return None,
    };
    Some(TargetConfig {
        subdir: Some(subdir.to_string()),
        gates,
    })
}

/// The complete porter.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PorterToml {
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub metrics: MetricsSection,
    #[serde(default)]
    pub targets: HashMap<String, TargetConfig>,
}

impl PorterToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse porter.toml")
    }

    /// Load `.porter/porter.toml`, or defaults when the file is absent.
    pub fn load_or_default(porter_dir: &Path) -> Result<Self> {
        let config_path = porter_dir.join("porter.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Agent command: environment, then file, then `claude`.
    pub fn agent_cmd(&self) -> String {
        std::env::var(AGENT_CMD_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.agent.command.clone())
            .unwrap_or_else(|| "claude".to_string())
    }

    /// Merge a `[targets.<name>]` table over the built-in preset of the same
    /// name.
    pub fn target(&self, name: &str, project: &str) -> Result<ResolvedTarget, ConfigError> {
        let preset = builtin_target(name);
        let table = self.targets.get(name);
        if preset.is_none() && table.is_none() {
            let mut known: Vec<&str> = vec!["rust", "go", "java"];
            known.extend(self.targets.keys().map(String::as_str));
            return Err(ConfigError::Invalid(format!(
                "Unknown target '{}'. Known targets: {}",
                name,
                known.join(", ")
            )));
        }

        let preset = preset.unwrap_or_default();
        let table = table.cloned().unwrap_or_default();
        let subdir = table
            .subdir
            .or(preset.subdir)
            .unwrap_or_else(|| format!("{{project}}-{}", name));
        let gates = if table.gates.is_empty() {
            preset.gates
        } else {
            table.gates
        };

        Ok(ResolvedTarget {
            name: name.to_string(),
            subdir: subdir.replace("{project}", project),
            gates,
        })
    }

    /// Return warnings for suspicious but loadable settings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.defaults.max_backoff_ms < self.defaults.backoff_ms {
            warnings.push(format!(
                "max_backoff_ms ({}) is below backoff_ms ({}); retries will wait max_backoff_ms",
                self.defaults.max_backoff_ms, self.defaults.backoff_ms
            ));
        }
        if self.defaults.agent_timeout_secs == 0 {
            warnings.push("agent_timeout_secs is 0; every agent call will time out".to_string());
        }
        for (name, target) in &self.targets {
            for gate in &target.gates {
                if gate.command.trim().is_empty() {
                    warnings.push(format!(
                        "Gate '{}' in target '{}' has an empty command",
                        gate.name, name
                    ));
                }
            }
        }

        warnings
    }
}

/// Resolved configuration for one invocation.
#[derive(Debug, Clone)]
pub struct PorterConfig {
    /// Directory the run operates in
    pub workdir: PathBuf,
    /// `<workdir>/.porter`
    pub porter_dir: PathBuf,
    pub toml: PorterToml,
    pub cli_max_retries: Option<u32>,
    pub cli_failure_policy: Option<FailurePolicy>,
    pub cli_gate_mode: Option<GateMode>,
}

impl PorterConfig {
    pub fn new(workdir: PathBuf) -> Result<Self> {
        let workdir = workdir
            .canonicalize()
            .with_context(|| format!("Failed to resolve working directory {}", workdir.display()))?;
        let porter_dir = workdir.join(".porter");
        let toml = PorterToml::load_or_default(&porter_dir)?;

        Ok(Self {
            workdir,
            porter_dir,
            toml,
            cli_max_retries: None,
            cli_failure_policy: None,
            cli_gate_mode: None,
        })
    }

    pub fn with_cli_args(
        workdir: PathBuf,
        max_retries: Option<u32>,
        failure_policy: Option<FailurePolicy>,
        gate_mode: Option<GateMode>,
    ) -> Result<Self> {
        let mut config = Self::new(workdir)?;
        config.cli_max_retries = max_retries;
        config.cli_failure_policy = failure_policy;
        config.cli_gate_mode = gate_mode;
        Ok(config)
    }

    pub fn max_retries(&self) -> u32 {
        self.cli_max_retries
            .unwrap_or(self.toml.defaults.max_retries)
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.cli_failure_policy
            .unwrap_or(self.toml.defaults.failure_policy)
    }

    pub fn gate_mode(&self) -> GateMode {
        self.cli_gate_mode.unwrap_or(self.toml.defaults.gate_mode)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.toml.defaults.backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.toml.defaults.max_backoff_ms)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.defaults.agent_timeout_secs)
    }

    pub fn agent_cmd(&self) -> String {
        self.toml.agent_cmd()
    }

    pub fn target(&self, name: &str, project: &str) -> Result<ResolvedTarget, ConfigError> {
        self.toml.target(name, project)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.porter_dir.join("checkpoints")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.porter_dir.join("logs")
    }

    /// Metrics database: environment, then file, then `.porter/metrics.db`.
    /// Relative file paths resolve against the working directory.
    pub fn metrics_db_path(&self) -> PathBuf {
        if let Ok(path) = std::env::var(METRICS_DB_ENV)
            && !path.trim().is_empty()
        {
            return PathBuf::from(path);
        }
        match &self.toml.metrics.db_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.workdir.join(path),
            None => self.porter_dir.join("metrics.db"),
        }
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
