use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Module,
    Feature,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKind::Module => write!(f, "module"),
            UnitKind::Feature => write!(f, "feature"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl UnitStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitStatus::Done | UnitStatus::Failed)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitStatus::Pending => "pending",
            UnitStatus::InProgress => "in_progress",
            UnitStatus::Done => "done",
            UnitStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Production phases a unit passes through on every attempt, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitPhase {
    Contracting,
    Analyzing,
    Migrating,
    Reviewing,
    GateCheck,
}

impl UnitPhase {
    /// Phases backed by one agent call each.
    pub const AGENT_PHASES: [UnitPhase; 4] = [
        UnitPhase::Contracting,
        UnitPhase::Analyzing,
        UnitPhase::Migrating,
        UnitPhase::Reviewing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            UnitPhase::Contracting => "contracting",
            UnitPhase::Analyzing => "analyzing",
            UnitPhase::Migrating => "migrating",
            UnitPhase::Reviewing => "reviewing",
            UnitPhase::GateCheck => "gate_check",
        }
    }
}

impl fmt::Display for UnitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A schedulable module or feature.
///
/// `attempts` counts started attempts for the current run; it is reset when a
/// unit is restarted on resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: String,
    pub kind: UnitKind,
    pub depends_on: BTreeSet<String>,
    pub status: UnitStatus,
    #[serde(default)]
    pub attempts: u32,
    /// Source files the unit covers.
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub description: String,
}

impl WorkUnit {
    pub fn new(id: impl Into<String>, kind: UnitKind) -> Self {
        Self {
            id: id.into(),
            kind,
            depends_on: BTreeSet::new(),
            status: UnitStatus::Pending,
            attempts: 0,
            sources: Vec::new(),
            description: String::new(),
        }
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = sources;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_phases_exclude_gate_check() {
        assert_eq!(UnitPhase::AGENT_PHASES.len(), 4);
        assert!(!UnitPhase::AGENT_PHASES.contains(&UnitPhase::GateCheck));
        assert_eq!(UnitPhase::AGENT_PHASES[0], UnitPhase::Contracting);
    }

    #[test]
    fn phase_serializes_snake_case() {
        let json = serde_json::to_string(&UnitPhase::GateCheck).unwrap();
        assert_eq!(json, "\"gate_check\"");
        assert_eq!(UnitPhase::GateCheck.to_string(), "gate_check");
    }

    #[test]
    fn new_unit_is_pending() {
        let unit = WorkUnit::new("lexer", UnitKind::Module).with_deps(["tokens"]);
        assert_eq!(unit.status, UnitStatus::Pending);
        assert!(!unit.status.is_terminal());
        assert!(unit.depends_on.contains("tokens"));
        assert_eq!(unit.attempts, 0);
    }
}
