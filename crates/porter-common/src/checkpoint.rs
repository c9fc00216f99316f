//! The resume record written at every unit boundary.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::unit::UnitPhase;

/// Why the last failed unit failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub unit_id: String,
    pub phase: UnitPhase,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    /// Completion order is preserved; entries are unique.
    pub completed_unit_ids: Vec<String>,
    pub current_unit_id: Option<String>,
    pub continuation_token: Option<String>,
    pub last_failure: Option<FailureRecord>,
    pub saved_at: DateTime<Utc>,
}

/// A checkpoint that does not fit the project it is resumed against.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointInconsistency {
    #[error("unit '{0}' is listed as completed more than once")]
    DuplicateCompleted(String),
    #[error("completed unit '{0}' is not part of the project")]
    UnknownCompleted(String),
    #[error("current unit '{0}' is not part of the project")]
    UnknownCurrent(String),
    #[error("current unit '{0}' is also listed as completed")]
    CurrentAlreadyCompleted(String),
    #[error("last failure names unknown unit '{0}'")]
    UnknownFailedUnit(String),
}

impl Checkpoint {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            completed_unit_ids: Vec::new(),
            current_unit_id: None,
            continuation_token: None,
            last_failure: None,
            saved_at: Utc::now(),
        }
    }

    pub fn is_completed(&self, unit_id: &str) -> bool {
        self.completed_unit_ids.iter().any(|id| id == unit_id)
    }

    /// Append `unit_id` unless already present.
    pub fn mark_completed(&mut self, unit_id: &str) {
        if !self.is_completed(unit_id) {
            self.completed_unit_ids.push(unit_id.to_string());
        }
    }

    /// Check internal consistency against the unit ids of the project being
    /// resumed.
    pub fn validate_against<'a, I>(&self, unit_ids: I) -> Result<(), CheckpointInconsistency>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let known: HashSet<&str> = unit_ids.into_iter().collect();

        let mut seen = HashSet::new();
        for id in &self.completed_unit_ids {
            if !seen.insert(id.as_str()) {
                return Err(CheckpointInconsistency::DuplicateCompleted(id.clone()));
            }
            if !known.contains(id.as_str()) {
                return Err(CheckpointInconsistency::UnknownCompleted(id.clone()));
            }
        }

        if let Some(current) = &self.current_unit_id {
            if !known.contains(current.as_str()) {
                return Err(CheckpointInconsistency::UnknownCurrent(current.clone()));
            }
            if seen.contains(current.as_str()) {
                return Err(CheckpointInconsistency::CurrentAlreadyCompleted(
                    current.clone(),
                ));
            }
        }

        if let Some(failure) = &self.last_failure
            && !known.contains(failure.unit_id.as_str())
        {
            return Err(CheckpointInconsistency::UnknownFailedUnit(
                failure.unit_id.clone(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNITS: [&str; 3] = ["tokens", "lexer", "parser"];

    #[test]
    fn mark_completed_is_idempotent() {
        let mut cp = Checkpoint::new("run-1");
        cp.mark_completed("tokens");
        cp.mark_completed("lexer");
        cp.mark_completed("tokens");
        assert_eq!(cp.completed_unit_ids, vec!["tokens", "lexer"]);
    }

    #[test]
    fn consistent_checkpoint_validates() {
        let mut cp = Checkpoint::new("run-1");
        cp.mark_completed("tokens");
        cp.current_unit_id = Some("lexer".into());
        cp.last_failure = Some(FailureRecord {
            unit_id: "lexer".into(),
            phase: UnitPhase::GateCheck,
            message: "gate 'test' failed".into(),
        });
        assert!(cp.validate_against(UNITS).is_ok());
    }

    #[test]
    fn unknown_current_unit_is_inconsistent() {
        let mut cp = Checkpoint::new("run-1");
        cp.current_unit_id = Some("emitter".into());
        assert_eq!(
            cp.validate_against(UNITS),
            Err(CheckpointInconsistency::UnknownCurrent("emitter".into()))
        );
    }

    #[test]
    fn current_unit_cannot_be_completed() {
        let mut cp = Checkpoint::new("run-1");
        cp.mark_completed("lexer");
        cp.current_unit_id = Some("lexer".into());
        assert!(matches!(
            cp.validate_against(UNITS),
            Err(CheckpointInconsistency::CurrentAlreadyCompleted(_))
        ));
    }

    #[test]
    fn duplicate_completed_from_disk_is_inconsistent() {
        let mut cp = Checkpoint::new("run-1");
        cp.completed_unit_ids = vec!["tokens".into(), "tokens".into()];
        assert!(matches!(
            cp.validate_against(UNITS),
            Err(CheckpointInconsistency::DuplicateCompleted(_))
        ));
    }

    #[test]
    fn json_round_trip_preserves_all_fields() {
        let mut cp = Checkpoint::new("run-1");
        cp.mark_completed("tokens");
        cp.continuation_token = Some("session-abc".into());
        let json = serde_json::to_string(&cp).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cp);
    }
}
