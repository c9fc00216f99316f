//! Per-run unit state and the retry transition.

use std::time::Duration;

use porter_common::{Checkpoint, UnitStatus, WorkUnit};

use crate::errors::OrchestratorError;
use crate::strategy::UnitGraph;

/// Reason recorded on units skipped because a dependency failed.
pub const DEPENDENCY_FAILED: &str = "dependency failed";

/// What follows a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStep {
    /// Start over from `Contracting` as retry number `n` (1-based).
    Retry(u32),
    /// Budget spent; the unit is `Failed`.
    Exhausted,
}

/// `attempts_used` counts attempts already made in this invocation,
/// including the one that just failed.
pub fn after_failed_attempt(attempts_used: u32, max_retries: u32) -> AttemptStep {
    if attempts_used <= max_retries {
        AttemptStep::Retry(attempts_used)
    } else {
        AttemptStep::Exhausted
    }
}

/// Exponential backoff before retry `n`: `base * 2^(n-1)`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, retry: u32) -> Duration {
    let shift = retry.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift).min(max)
}

/// Unit statuses of one run, indexed like the graph they came from.
pub struct RunState {
    graph: UnitGraph,
    reasons: Vec<Option<String>>,
}

impl RunState {
    pub fn new(graph: UnitGraph) -> Self {
        let reasons = vec![None; graph.len()];
        Self { graph, reasons }
    }

    pub fn units(&self) -> &[WorkUnit] {
        self.graph.units()
    }

    pub fn unit(&self, index: usize) -> &WorkUnit {
        &self.graph.units()[index]
    }

    pub fn reason(&self, index: usize) -> Option<&str> {
        self.reasons[index].as_deref()
    }

    /// Mark every unit the checkpoint lists as completed `Done`.
    ///
    /// An inconsistent checkpoint is fatal and leaves the state untouched.
    pub fn rehydrate(&mut self, checkpoint: &Checkpoint) -> Result<usize, OrchestratorError> {
        checkpoint
            .validate_against(self.graph.units().iter().map(|u| u.id.as_str()))
            .map_err(|e| OrchestratorError::corruption(&checkpoint.run_id, e))?;

        let mut restored = 0;
        for id in &checkpoint.completed_unit_ids {
            if let Some(index) = self.graph.get_index(id) {
                self.set_status(index, UnitStatus::Done);
                restored += 1;
            }
        }
        Ok(restored)
    }

    fn set_status(&mut self, index: usize, status: UnitStatus) {
        if let Some(unit) = self.graph.units_mut().get_mut(index) {
            unit.status = status;
        }
    }

    pub fn start_attempt(&mut self, index: usize) -> u32 {
        let units = self.graph.units_mut();
        let unit = &mut units[index];
        unit.status = UnitStatus::InProgress;
        unit.attempts += 1;
        unit.attempts
    }

    pub fn mark_done(&mut self, index: usize) {
        self.set_status(index, UnitStatus::Done);
        self.reasons[index] = None;
    }

    pub fn mark_failed(&mut self, index: usize, reason: impl Into<String>) {
        self.set_status(index, UnitStatus::Failed);
        self.reasons[index] = Some(reason.into());
    }

    /// Return an interrupted unit to `Pending`; nothing of the attempt is kept.
    pub fn reset(&mut self, index: usize) {
        self.set_status(index, UnitStatus::Pending);
    }

    pub fn any_dependency_failed(&self, index: usize) -> bool {
        self.graph
            .dependencies(index)
            .iter()
            .any(|&dep| self.unit(dep).status == UnitStatus::Failed)
    }

    /// True when every dependency has reached `Done`.
    pub fn dependencies_done(&self, index: usize) -> bool {
        self.graph
            .dependencies(index)
            .iter()
            .all(|&dep| self.unit(dep).status == UnitStatus::Done)
    }

    pub fn all_done(&self) -> bool {
        self.units().iter().all(|u| u.status == UnitStatus::Done)
    }

    pub fn count(&self, status: UnitStatus) -> usize {
        self.units().iter().filter(|u| u.status == status).count()
    }
}
