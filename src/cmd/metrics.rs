//! `porter metrics`: query, aggregate, compare, projects, delete, backfill.

use anyhow::{Context, Result, bail};
use console::style;
use porter_common::RUN_CATEGORY;
use std::path::PathBuf;

use porter::config::PorterConfig;
use porter::metrics::{
    AggregateRow, MetricDelta, MetricsDb, MetricsHandle, RunFilter, RunWithMetrics, backfill,
    split_metric,
};

use super::super::MetricsCommands;

pub async fn cmd_metrics(workdir: PathBuf, command: MetricsCommands) -> Result<()> {
    let config = PorterConfig::new(workdir)?;
    let path = config.metrics_db_path();
    let db = MetricsDb::new(&path)
        .with_context(|| format!("Failed to open metrics database at {}", path.display()))?;
    let handle = MetricsHandle::new(db);

    match command {
        MetricsCommands::Query {
            project,
            target,
            strategy,
            json,
        } => {
            let filter = RunFilter {
                project,
                target,
                strategy,
            };
            let rows = handle.call(move |db| db.query(&filter)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print_runs(&rows);
            }
        }
        MetricsCommands::Aggregate {
            group_by,
            metric,
            json,
        } => {
            let (category, key) = split_metric(&metric)?;
            let (category, key) = (category.to_string(), key.to_string());
            let rows = handle
                .call(move |db| db.aggregate(group_by, &category, &key))
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print_aggregate(&metric, &rows);
            }
        }
        MetricsCommands::Compare { run_a, run_b, json } => {
            let (a, b) = (run_a.clone(), run_b.clone());
            let deltas = handle.call(move |db| db.compare(&a, &b)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&deltas)?);
            } else {
                print_deltas(&run_a, &run_b, &deltas);
            }
        }
        MetricsCommands::Projects { json } => {
            let projects = handle
                .call(|db| {
                    db.list_projects()?
                        .into_iter()
                        .map(|project| {
                            let filter = RunFilter {
                                project: Some(project.clone()),
                                ..Default::default()
                            };
                            Ok((project, db.count(&filter)?))
                        })
                        .collect::<Result<Vec<(String, u64)>>>()
                })
                .await?;
            if json {
                let map: serde_json::Map<String, serde_json::Value> = projects
                    .into_iter()
                    .map(|(project, runs)| (project, runs.into()))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&map)?);
            } else {
                print_projects(&projects);
            }
        }
        MetricsCommands::Delete { run_id } => {
            let id = run_id.clone();
            if !handle.call(move |db| db.delete_run(&id)).await? {
                bail!("Run '{}' not found", run_id);
            }
            println!("Deleted run {}", style(&run_id).cyan());
        }
        MetricsCommands::Backfill { paths } => {
            let summary = handle.call(move |db| backfill(db, &paths)).await?;
            println!();
            println!(
                "Backfilled {} run(s), {} metric row(s) from {} file(s)",
                summary.runs.len(),
                summary.records,
                summary.files
            );
            for run_id in &summary.runs {
                println!("  {} {}", style("+").green(), run_id);
            }
            for (path, reason) in &summary.skipped {
                println!("  {} {}: {}", style("skipped").yellow(), path.display(), reason);
            }
            println!();
        }
    }
    Ok(())
}

fn run_metric(row: &RunWithMetrics, key: &str) -> Option<f64> {
    row.metrics
        .iter()
        .find(|m| m.category == RUN_CATEGORY && m.key == key)
        .map(|m| m.value)
}

fn print_runs(rows: &[RunWithMetrics]) {
    println!();
    if rows.is_empty() {
        println!("No runs recorded.");
        println!();
        return;
    }
    println!(
        "{:<26} {:<14} {:<8} {:<19} {:<10} {:>6} {:>10} {:>9}",
        "Run", "Project", "Target", "Strategy", "Status", "Units", "Wall (s)", "Cost ($)"
    );
    for row in rows {
        let units = match (run_metric(row, "units_done"), run_metric(row, "units_total")) {
            (Some(done), Some(total)) => format!("{}/{}", done, total),
            _ => "-".to_string(),
        };
        let wall = run_metric(row, "wall_clock_ms")
            .map(|ms| format!("{:.1}", ms / 1000.0))
            .unwrap_or_else(|| "-".to_string());
        let cost = run_metric(row, "cost_usd")
            .map(|usd| format!("{:.4}", usd))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<26} {:<14} {:<8} {:<19} {:<10} {:>6} {:>10} {:>9}",
            row.run.run_id,
            row.run.project,
            row.run.target_language,
            row.run.strategy,
            row.run.status,
            units,
            wall,
            cost
        );
    }
    println!();
}

fn print_projects(projects: &[(String, u64)]) {
    println!();
    if projects.is_empty() {
        println!("No runs recorded.");
        println!();
        return;
    }
    println!("{:<24} {:>6}", "Project", "Runs");
    for (project, runs) in projects {
        println!("{:<24} {:>6}", project, runs);
    }
    println!();
}

fn print_aggregate(metric: &str, rows: &[AggregateRow]) {
    println!();
    println!("{}", style(metric).bold());
    if rows.is_empty() {
        println!("No values recorded.");
        println!();
        return;
    }
    println!("{:<24} {:>5} {:>14} {:>14}", "Group", "N", "Mean", "Std dev");
    for row in rows {
        println!(
            "{:<24} {:>5} {:>14.4} {:>14.4}",
            row.group, row.n, row.mean, row.stddev
        );
    }
    println!();
}

fn print_deltas(run_a: &str, run_b: &str, deltas: &[MetricDelta]) {
    println!();
    println!("{} vs {}", style(run_a).cyan(), style(run_b).cyan());
    if deltas.is_empty() {
        println!("No metrics in common.");
        println!();
        return;
    }
    println!(
        "{:<32} {:>12} {:>12} {:>12} {:>9}",
        "Metric", "A", "B", "Delta", "Change"
    );
    for d in deltas {
        let change = d
            .percent_change
            .map(|p| format!("{:+.1}%", p))
            .unwrap_or_else(|| "n/a".to_string());
        println!(
            "{:<32} {:>12.2} {:>12.2} {:>+12.2} {:>9}",
            format!("{}.{}", d.category, d.key),
            d.value_a,
            d.value_b,
            d.delta,
            change
        );
    }
    println!();
}
