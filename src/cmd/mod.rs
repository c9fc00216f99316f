//! CLI command implementations.
//!
//! | Module    | Commands handled                                           |
//! |-----------|------------------------------------------------------------|
//! | `run`     | `Run` (including `--dry-run`), `Resume`                    |
//! | `status`  | `Status`                                                   |
//! | `metrics` | `Metrics query/aggregate/compare/projects/delete/backfill` |

pub mod metrics;
pub mod run;
pub mod status;

pub use metrics::cmd_metrics;
pub use run::{cmd_dry_run, cmd_resume, cmd_run};
pub use status::cmd_status;
