//! Run driver: unit state machine, retries, checkpoints and live metrics.

pub mod runner;
pub mod state;

pub use runner::{Orchestrator, RunResult, RunSettings};
pub use state::{AttemptStep, DEPENDENCY_FAILED, RunState};
