//! Metrics store, aggregation, and backfill.

pub mod backfill;
pub mod db;
pub mod derive;

pub use backfill::{BackfillSummary, backfill};
pub use db::{AggregateRow, GroupBy, MetricDelta, MetricsDb, MetricsHandle, RunFilter, RunWithMetrics};
pub use derive::{derive_categories, derive_records};

use anyhow::{Result, bail};

use crate::journal::RunEvent;

/// Write the run row, gate results, and derived metrics of one journal.
///
/// Returns the run id and the number of metric rows written, or `None` when
/// the events contain no `RunStarted`.
pub fn persist_events(db: &MetricsDb, events: &[RunEvent]) -> Result<Option<(String, usize)>> {
    let Some(run) = derive::run_info(events) else {
        return Ok(None);
    };
    db.upsert_run(&run)?;

    for event in events {
        if let RunEvent::GateEvaluated { result } = event {
            db.record_gate_result(&run.run_id, result)?;
        }
    }

    let mut written = 0;
    for (category, metrics) in derive_categories(events) {
        db.insert(&run.run_id, &category, &metrics)?;
        written += metrics.len();
    }
    Ok(Some((run.run_id, written)))
}

/// Split a `category.key` metric name. The key is the part after the last
/// dot, so unit categories with dots in their ids still parse.
pub fn split_metric(name: &str) -> Result<(&str, &str)> {
    match name.rsplit_once('.') {
        Some((category, key)) if !category.is_empty() && !key.is_empty() => Ok((category, key)),
        _ => bail!(
            "Invalid metric '{}': expected <category>.<key>, e.g. run.cost_usd",
            name
        ),
    }
}
