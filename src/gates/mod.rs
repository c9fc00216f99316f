//! Quality gate harness.
//!
//! Gates are opaque shell commands: exit code 0 passes, anything else fails.
//! The harness never interprets what a gate checks.

pub mod harness;

pub use harness::{GateEvaluator, GateHarness, GateReport, excerpt};
