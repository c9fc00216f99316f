//! Shared domain types for the Porter migration orchestrator.
//!
//! Everything here is plain data: the project definition a run is driven
//! from, the work units the strategy engine produces, the run record, the
//! checkpoint persisted at unit boundaries, gate results, and metrics rows.
//! Behaviour lives in the `porter` crate.

pub mod checkpoint;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod project;
pub mod run;
pub mod unit;

pub use checkpoint::{Checkpoint, CheckpointInconsistency, FailureRecord};
pub use error::ConfigError;
pub use gate::{GateFailure, GateMode, GateSpec, QualityGateResult};
pub use metrics::{MetricValue, MetricsRecord, RUN_CATEGORY, unit_category};
pub use project::{FeatureDef, ModuleDef, Project, SourceSection, TestCase};
pub use run::{MigrationRun, RunStatus, Strategy};
pub use unit::{UnitKind, UnitPhase, UnitStatus, WorkUnit};
