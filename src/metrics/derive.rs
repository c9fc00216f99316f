//! Metrics derivation from journal events.
//!
//! Both the live run and `metrics backfill` call [`derive_records`] on the
//! same event sequence, so the two paths cannot drift apart.

use std::collections::BTreeMap;

use porter_common::{
    MetricValue, MetricsRecord, MigrationRun, RUN_CATEGORY, RunStatus, UnitStatus, unit_category,
};

use crate::journal::RunEvent;

pub type MetricSet = BTreeMap<String, MetricValue>;

/// Figures for one unit across every attempt recorded in the journal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitFigures {
    pub attempts: u64,
    pub duration_ms: u64,
    pub agent_calls: u64,
    pub gate_failures: u64,
    pub cost_usd: f64,
    pub succeeded: bool,
}

impl UnitFigures {
    pub fn to_metrics(&self) -> MetricSet {
        let mut m = MetricSet::new();
        m.insert("attempts".into(), MetricValue::count(self.attempts));
        m.insert("duration_ms".into(), MetricValue::millis(self.duration_ms));
        m.insert("agent_calls".into(), MetricValue::count(self.agent_calls));
        m.insert("gate_failures".into(), MetricValue::count(self.gate_failures));
        m.insert("cost_usd".into(), MetricValue::usd(self.cost_usd));
        m.insert("succeeded".into(), MetricValue::flag(self.succeeded));
        m
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunFigures {
    pub wall_clock_ms: u64,
    pub units_total: u64,
    pub units_done: u64,
    pub units_failed: u64,
    pub attempts_total: u64,
    pub agent_calls: u64,
    pub gate_failures: u64,
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub turns: u64,
    pub success: bool,
}

impl RunFigures {
    pub fn to_metrics(&self) -> MetricSet {
        let mut m = MetricSet::new();
        m.insert("wall_clock_ms".into(), MetricValue::millis(self.wall_clock_ms));
        m.insert("units_total".into(), MetricValue::count(self.units_total));
        m.insert("units_done".into(), MetricValue::count(self.units_done));
        m.insert("units_failed".into(), MetricValue::count(self.units_failed));
        m.insert("attempts_total".into(), MetricValue::count(self.attempts_total));
        m.insert("agent_calls".into(), MetricValue::count(self.agent_calls));
        m.insert("gate_failures".into(), MetricValue::count(self.gate_failures));
        m.insert("cost_usd".into(), MetricValue::usd(self.cost_usd));
        m.insert("input_tokens".into(), MetricValue::tokens(self.input_tokens));
        m.insert("output_tokens".into(), MetricValue::tokens(self.output_tokens));
        m.insert("turns".into(), MetricValue::count(self.turns));
        m.insert("success".into(), MetricValue::flag(self.success));
        m
    }
}

pub fn derive_unit(events: &[RunEvent], unit_id: &str) -> UnitFigures {
    let mut figures = UnitFigures::default();
    for event in events {
        match event {
            RunEvent::PhaseCompleted {
                unit_id: id, usage, ..
            } if id == unit_id => {
                figures.agent_calls += 1;
                figures.cost_usd += usage.cost_usd;
            }
            RunEvent::GateEvaluated { result } if result.unit_id == unit_id => {
                if !result.passed {
                    figures.gate_failures += 1;
                }
            }
            RunEvent::UnitFinished {
                unit_id: id,
                status,
                attempts,
                duration_ms,
                ..
            } if id == unit_id => {
                figures.attempts += u64::from(*attempts);
                figures.duration_ms += duration_ms;
                figures.succeeded = *status == UnitStatus::Done;
            }
            _ => {}
        }
    }
    figures
}

pub fn derive_run(events: &[RunEvent]) -> RunFigures {
    let mut figures = RunFigures::default();
    let mut last_status: BTreeMap<&str, UnitStatus> = BTreeMap::new();
    let mut final_status = None;

    for event in events {
        match event {
            RunEvent::RunStarted { units, .. } => {
                figures.units_total = units.len() as u64;
            }
            RunEvent::PhaseCompleted { usage, .. } => {
                figures.agent_calls += 1;
                figures.cost_usd += usage.cost_usd;
                figures.input_tokens += usage.input_tokens;
                figures.output_tokens += usage.output_tokens;
                figures.turns += usage.turns;
            }
            RunEvent::GateEvaluated { result } => {
                if !result.passed {
                    figures.gate_failures += 1;
                }
            }
            RunEvent::UnitFinished {
                unit_id,
                status,
                attempts,
                ..
            } => {
                figures.attempts_total += u64::from(*attempts);
                last_status.insert(unit_id.as_str(), *status);
            }
            RunEvent::RunFinished {
                status,
                wall_clock_ms,
                ..
            } => {
                figures.wall_clock_ms += wall_clock_ms;
                final_status = Some(*status);
            }
        }
    }

    figures.units_done = last_status
        .values()
        .filter(|s| **s == UnitStatus::Done)
        .count() as u64;
    figures.units_failed = last_status
        .values()
        .filter(|s| **s == UnitStatus::Failed)
        .count() as u64;
    figures.success = final_status == Some(RunStatus::Succeeded);
    figures
}

/// Unit ids that reached a boundary, in first-finished order.
fn finished_units(events: &[RunEvent]) -> Vec<&str> {
    let mut ids: Vec<&str> = Vec::new();
    for event in events {
        if let RunEvent::UnitFinished { unit_id, .. } = event
            && !ids.contains(&unit_id.as_str())
        {
            ids.push(unit_id);
        }
    }
    ids
}

/// Every metric category the events support, keyed by category name.
pub fn derive_categories(events: &[RunEvent]) -> BTreeMap<String, MetricSet> {
    let mut categories = BTreeMap::new();
    for unit_id in finished_units(events) {
        categories.insert(unit_category(unit_id), derive_unit(events, unit_id).to_metrics());
    }
    categories.insert(RUN_CATEGORY.to_string(), derive_run(events).to_metrics());
    categories
}

pub fn derive_records(run_id: &str, events: &[RunEvent]) -> Vec<MetricsRecord> {
    derive_categories(events)
        .into_iter()
        .flat_map(|(category, metrics)| {
            metrics.into_iter().map(move |(key, metric)| MetricsRecord {
                run_id: run_id.to_string(),
                category: category.clone(),
                key,
                value: metric.value,
                unit_of_measure: metric.unit_of_measure,
            })
        })
        .collect()
}

/// The run row described by the events, taken from the first `RunStarted`
/// and the last `RunFinished`.
pub fn run_info(events: &[RunEvent]) -> Option<MigrationRun> {
    let mut run = events.iter().find_map(|event| match event {
        RunEvent::RunStarted {
            run_id,
            project,
            target,
            strategy,
            started_at,
            ..
        } => Some(MigrationRun {
            run_id: run_id.clone(),
            project: project.clone(),
            target_language: target.clone(),
            strategy: *strategy,
            started_at: *started_at,
            ended_at: None,
            status: RunStatus::Running,
        }),
        _ => None,
    })?;

    if let Some((status, ended_at)) = events.iter().rev().find_map(|event| match event {
        RunEvent::RunFinished {
            status, ended_at, ..
        } => Some((*status, *ended_at)),
        _ => None,
    }) {
        run.status = status;
        run.ended_at = Some(ended_at);
    }
    Some(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::UsageRecord;
    use chrono::Utc;
    use porter_common::{GateFailure, QualityGateResult, Strategy, UnitPhase};

    fn phase(unit: &str, attempt: u32, cost: f64) -> RunEvent {
        RunEvent::PhaseCompleted {
            unit_id: unit.into(),
            phase: UnitPhase::Migrating,
            attempt,
            ok: true,
            duration_ms: 10,
            usage: UsageRecord {
                cost_usd: cost,
                input_tokens: 100,
                output_tokens: 20,
                turns: 2,
            },
            error: None,
        }
    }

    fn gate(unit: &str, attempt: u32, passed: bool) -> RunEvent {
        RunEvent::GateEvaluated {
            result: QualityGateResult {
                unit_id: unit.into(),
                gate_name: "test".into(),
                attempt,
                passed,
                failure: (!passed).then_some(GateFailure::ExitCode { code: 1 }),
                duration_ms: 5,
                output_excerpt: String::new(),
            },
        }
    }

    fn finished(unit: &str, status: UnitStatus, attempts: u32) -> RunEvent {
        RunEvent::UnitFinished {
            unit_id: unit.into(),
            status,
            attempts,
            duration_ms: 100,
            reason: None,
        }
    }

    fn started(units: &[&str]) -> RunEvent {
        RunEvent::RunStarted {
            run_id: "run-1".into(),
            project: "calc".into(),
            target: "rust".into(),
            strategy: Strategy::ModuleByModule,
            started_at: Utc::now(),
            units: units.iter().map(|u| u.to_string()).collect(),
            resumed: false,
        }
    }

    fn gate_retry_journal() -> Vec<RunEvent> {
        vec![
            started(&["x"]),
            phase("x", 1, 0.5),
            gate("x", 1, false),
            phase("x", 2, 0.25),
            gate("x", 2, true),
            finished("x", UnitStatus::Done, 2),
            RunEvent::RunFinished {
                status: RunStatus::Succeeded,
                ended_at: Utc::now(),
                wall_clock_ms: 900,
            },
        ]
    }

    #[test]
    fn test_unit_figures_count_attempts_and_gate_failures() {
        let figures = derive_unit(&gate_retry_journal(), "x");
        assert_eq!(figures.attempts, 2);
        assert_eq!(figures.agent_calls, 2);
        assert_eq!(figures.gate_failures, 1);
        assert!((figures.cost_usd - 0.75).abs() < 1e-9);
        assert!(figures.succeeded);
    }

    #[test]
    fn test_run_figures() {
        let figures = derive_run(&gate_retry_journal());
        assert_eq!(figures.units_total, 1);
        assert_eq!(figures.units_done, 1);
        assert_eq!(figures.units_failed, 0);
        assert_eq!(figures.input_tokens, 200);
        assert_eq!(figures.wall_clock_ms, 900);
        assert!(figures.success);
    }

    #[test]
    fn test_resumed_unit_uses_last_status() {
        let events = vec![
            started(&["a", "b"]),
            finished("a", UnitStatus::Failed, 3),
            RunEvent::RunFinished {
                status: RunStatus::Failed,
                ended_at: Utc::now(),
                wall_clock_ms: 100,
            },
            started(&["a", "b"]),
            finished("a", UnitStatus::Done, 1),
            finished("b", UnitStatus::Done, 1),
            RunEvent::RunFinished {
                status: RunStatus::Succeeded,
                ended_at: Utc::now(),
                wall_clock_ms: 50,
            },
        ];
        let run = derive_run(&events);
        assert_eq!(run.units_done, 2);
        assert_eq!(run.units_failed, 0);
        assert_eq!(run.attempts_total, 5);
        assert_eq!(run.wall_clock_ms, 150);
        assert!(run.success);
        assert_eq!(derive_unit(&events, "a").attempts, 4);
    }

    #[test]
    fn test_records_cover_run_and_finished_units() {
        let records = derive_records("run-1", &gate_retry_journal());
        let categories: std::collections::BTreeSet<_> =
            records.iter().map(|r| r.category.as_str()).collect();
        assert_eq!(categories.into_iter().collect::<Vec<_>>(), vec!["run", "unit:x"]);
        let attempts = records
            .iter()
            .find(|r| r.category == "unit:x" && r.key == "attempts")
            .unwrap();
        assert_eq!(attempts.value, 2.0);
        assert!(records.iter().all(|r| r.run_id == "run-1"));
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let events = gate_retry_journal();
        assert_eq!(derive_records("r", &events), derive_records("r", &events));
    }

    #[test]
    fn test_run_info_takes_last_finish() {
        let run = run_info(&gate_retry_journal()).unwrap();
        assert_eq!(run.run_id, "run-1");
        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.ended_at.is_some());
        assert!(run_info(&[]).is_none());
    }

    #[test]
    fn test_unfinished_run_is_running() {
        let run = run_info(&[started(&["a"])]).unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(!derive_run(&[started(&["a"])]).success);
    }
}
