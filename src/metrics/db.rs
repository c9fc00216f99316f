use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use porter_common::{
    GateFailure, MetricValue, MetricsRecord, MigrationRun, QualityGateResult, RunStatus, Strategy,
};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

/// Async-safe handle to the metrics database.
///
/// Wraps `MetricsDb` behind `Arc<Mutex>` and runs every access on tokio's
/// blocking pool via `spawn_blocking`.
#[derive(Clone)]
pub struct MetricsHandle {
    inner: Arc<std::sync::Mutex<MetricsDb>>,
}

impl MetricsHandle {
    pub fn new(db: MetricsDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure against the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&MetricsDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("Metrics DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("Metrics DB task panicked")?
    }

    /// Lock synchronously. For CLI commands and tests, not async hot paths.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, MetricsDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("Metrics DB lock poisoned: {}", e))
    }
}

/// Optional run filters for [`MetricsDb::query`] and [`MetricsDb::count`].
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub project: Option<String>,
    pub target: Option<String>,
    pub strategy: Option<Strategy>,
}

impl RunFilter {
    fn where_clause(&self) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(project) = &self.project {
            clauses.push(format!("project = ?{}", values.len() + 1));
            values.push(project.clone());
        }
        if let Some(target) = &self.target {
            clauses.push(format!("target = ?{}", values.len() + 1));
            values.push(target.clone());
        }
        if let Some(strategy) = self.strategy {
            clauses.push(format!("strategy = ?{}", values.len() + 1));
            values.push(strategy.to_string());
        }
        if clauses.is_empty() {
            (String::new(), values)
        } else {
            (format!(" WHERE {}", clauses.join(" AND ")), values)
        }
    }
}

/// Run columns that can be grouped on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Project,
    Target,
    Strategy,
    Status,
}

impl GroupBy {
    fn column(self) -> &'static str {
        match self {
            GroupBy::Project => "r.project",
            GroupBy::Target => "r.target",
            GroupBy::Strategy => "r.strategy",
            GroupBy::Status => "r.status",
        }
    }
}

impl FromStr for GroupBy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "project" => Ok(GroupBy::Project),
            "target" => Ok(GroupBy::Target),
            "strategy" => Ok(GroupBy::Strategy),
            "status" => Ok(GroupBy::Status),
            _ => bail!(
                "Invalid group-by field '{}'. Valid values: project, target, strategy, status",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunWithMetrics {
    pub run: MigrationRun,
    pub metrics: Vec<MetricsRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateRow {
    pub group: String,
    pub mean: f64,
    /// Sample standard deviation; 0 for a single run.
    pub stddev: f64,
    pub n: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricDelta {
    pub category: String,
    pub key: String,
    pub value_a: f64,
    pub value_b: f64,
    pub delta: f64,
    /// None when the baseline value is zero.
    pub percent_change: Option<f64>,
}

pub struct MetricsDb {
    conn: Connection,
}

impl MetricsDb {
    /// Open (or create) the database at `path` and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create metrics directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open metrics database {}", path.display()))?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.conn
            .busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                project TEXT NOT NULL,
                target TEXT NOT NULL,
                strategy TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                status TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS metrics (
                run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                category TEXT NOT NULL,
                key TEXT NOT NULL,
                value REAL NOT NULL,
                unit_of_measure TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (run_id, category, key)
            );

            CREATE TABLE IF NOT EXISTS gate_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                unit_id TEXT NOT NULL,
                gate_name TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                passed INTEGER NOT NULL,
                failure TEXT,
                duration_ms INTEGER NOT NULL,
                output_excerpt TEXT NOT NULL DEFAULT '',
                UNIQUE (run_id, unit_id, gate_name, attempt)
            );

            CREATE INDEX IF NOT EXISTS idx_runs_project ON runs(project);
            CREATE INDEX IF NOT EXISTS idx_runs_target ON runs(target);
            CREATE INDEX IF NOT EXISTS idx_runs_strategy ON runs(strategy);
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
            CREATE INDEX IF NOT EXISTS idx_gate_results_run ON gate_results(run_id, unit_id);
            ",
        )?;
        Ok(())
    }

    // ── Runs ────────────────────────────────────────────────────────────

    pub fn upsert_run(&self, run: &MigrationRun) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO runs (run_id, project, target, strategy, started_at, ended_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(run_id) DO UPDATE SET
                    project = excluded.project,
                    target = excluded.target,
                    strategy = excluded.strategy,
                    started_at = excluded.started_at,
                    ended_at = excluded.ended_at,
                    status = excluded.status",
                params![
                    run.run_id,
                    run.project,
                    run.target_language,
                    run.strategy.as_str(),
                    run.started_at.to_rfc3339(),
                    run.ended_at.map(|t| t.to_rfc3339()),
                    run.status.as_str(),
                ],
            )
            .with_context(|| format!("Failed to upsert run {}", run.run_id))?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<MigrationRun>> {
        let raw = self
            .conn
            .query_row(
                "SELECT run_id, project, target, strategy, started_at, ended_at, status
                 FROM runs WHERE run_id = ?1",
                params![run_id],
                RawRun::from_row,
            )
            .optional()
            .context("Failed to query run")?;
        raw.map(RawRun::into_run).transpose()
    }

    pub fn list_projects(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT project FROM runs ORDER BY project")
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?);
        }
        Ok(projects)
    }

    pub fn count(&self, filter: &RunFilter) -> Result<u64> {
        let (clause, values) = filter.where_clause();
        let sql = format!("SELECT COUNT(*) FROM runs{}", clause);
        let count: i64 = self
            .conn
            .query_row(&sql, rusqlite::params_from_iter(values.iter()), |row| {
                row.get(0)
            })
            .context("Failed to count runs")?;
        Ok(count as u64)
    }

    /// Delete a run with its metrics and gate results. Returns whether it
    /// existed.
    pub fn delete_run(&self, run_id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM runs WHERE run_id = ?1", params![run_id])
            .context("Failed to delete run")?;
        Ok(affected > 0)
    }

    // ── Metrics ─────────────────────────────────────────────────────────

    /// Replace the metric set of `(run_id, category)` in one transaction.
    /// Inserting the same set twice leaves one identical set behind.
    pub fn insert(
        &self,
        run_id: &str,
        category: &str,
        metrics: &BTreeMap<String, MetricValue>,
    ) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin metrics transaction")?;
        tx.execute(
            "DELETE FROM metrics WHERE run_id = ?1 AND category = ?2",
            params![run_id, category],
        )
        .context("Failed to clear previous metrics")?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO metrics (run_id, category, key, value, unit_of_measure)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .context("Failed to prepare metrics insert")?;
            for (key, metric) in metrics {
                stmt.execute(params![
                    run_id,
                    category,
                    key,
                    metric.value,
                    metric.unit_of_measure
                ])
                .with_context(|| format!("Failed to insert metric {}.{}", category, key))?;
            }
        }
        tx.commit().context("Failed to commit metrics")?;
        Ok(())
    }

    pub fn metrics_for(&self, run_id: &str) -> Result<Vec<MetricsRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT run_id, category, key, value, unit_of_measure FROM metrics
                 WHERE run_id = ?1 ORDER BY category, key",
            )
            .context("Failed to prepare metrics_for")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(MetricsRecord {
                    run_id: row.get(0)?,
                    category: row.get(1)?,
                    key: row.get(2)?,
                    value: row.get(3)?,
                    unit_of_measure: row.get(4)?,
                })
            })
            .context("Failed to query metrics")?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("Failed to read metric row")?);
        }
        Ok(records)
    }

    // ── Gate results ────────────────────────────────────────────────────

    /// Record one gate outcome. Replaying the same attempt replaces its row.
    pub fn record_gate_result(&self, run_id: &str, result: &QualityGateResult) -> Result<()> {
        let failure = result
            .failure
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize gate failure")?;
        self.conn
            .execute(
                "INSERT INTO gate_results
                    (run_id, unit_id, gate_name, attempt, passed, failure, duration_ms, output_excerpt)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(run_id, unit_id, gate_name, attempt) DO UPDATE SET
                    passed = excluded.passed,
                    failure = excluded.failure,
                    duration_ms = excluded.duration_ms,
                    output_excerpt = excluded.output_excerpt",
                params![
                    run_id,
                    result.unit_id,
                    result.gate_name,
                    result.attempt,
                    result.passed,
                    failure,
                    result.duration_ms as i64,
                    result.output_excerpt,
                ],
            )
            .context("Failed to record gate result")?;
        Ok(())
    }

    pub fn gate_results(&self, run_id: &str) -> Result<Vec<QualityGateResult>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT unit_id, gate_name, attempt, passed, failure, duration_ms, output_excerpt
                 FROM gate_results WHERE run_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare gate_results")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .context("Failed to query gate results")?;
        let mut results = Vec::new();
        for row in rows {
            let (unit_id, gate_name, attempt, passed, failure, duration_ms, output_excerpt) =
                row.context("Failed to read gate result row")?;
            let failure: Option<GateFailure> = failure
                .map(|f| serde_json::from_str(&f))
                .transpose()
                .context("Failed to parse stored gate failure")?;
            results.push(QualityGateResult {
                unit_id,
                gate_name,
                attempt,
                passed,
                failure,
                duration_ms: duration_ms.max(0) as u64,
                output_excerpt,
            });
        }
        Ok(results)
    }

    // ── Analysis ────────────────────────────────────────────────────────

    /// Runs matching `filter`, newest first, each with its metrics.
    pub fn query(&self, filter: &RunFilter) -> Result<Vec<RunWithMetrics>> {
        let (clause, values) = filter.where_clause();
        let sql = format!(
            "SELECT run_id, project, target, strategy, started_at, ended_at, status
             FROM runs{} ORDER BY started_at DESC, run_id",
            clause
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare query")?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), RawRun::from_row)
            .context("Failed to query runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read run row")?.into_run()?);
        }

        let mut out = Vec::with_capacity(runs.len());
        for run in runs {
            let metrics = self.metrics_for(&run.run_id)?;
            out.push(RunWithMetrics { run, metrics });
        }
        Ok(out)
    }

    /// Mean, sample standard deviation and count of one metric per group.
    pub fn aggregate(&self, group_by: GroupBy, category: &str, key: &str) -> Result<Vec<AggregateRow>> {
        let column = group_by.column();
        let sql = format!(
            "SELECT {col}, COUNT(m.value), AVG(m.value), SUM(m.value * m.value)
             FROM runs r JOIN metrics m ON m.run_id = r.run_id
             WHERE m.category = ?1 AND m.key = ?2
             GROUP BY {col} ORDER BY {col}",
            col = column
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare aggregate")?;
        let rows = stmt
            .query_map(params![category, key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                ))
            })
            .context("Failed to aggregate metrics")?;

        let mut out = Vec::new();
        for row in rows {
            let (group, n, mean, sum_sq) = row.context("Failed to read aggregate row")?;
            let n = n.max(0) as u64;
            let stddev = if n > 1 {
                let variance = (sum_sq - n as f64 * mean * mean) / (n as f64 - 1.0);
                variance.max(0.0).sqrt()
            } else {
                0.0
            };
            out.push(AggregateRow {
                group,
                mean,
                stddev,
                n,
            });
        }
        Ok(out)
    }

    /// Per-metric difference `b - a` for metrics both runs recorded.
    pub fn compare(&self, run_a: &str, run_b: &str) -> Result<Vec<MetricDelta>> {
        for run_id in [run_a, run_b] {
            if self.get_run(run_id)?.is_none() {
                bail!("Run '{}' not found", run_id);
            }
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT a.category, a.key, a.value, b.value, b.value - a.value,
                        CASE WHEN a.value != 0 THEN (b.value - a.value) * 100.0 / ABS(a.value) END
                 FROM metrics a JOIN metrics b ON a.category = b.category AND a.key = b.key
                 WHERE a.run_id = ?1 AND b.run_id = ?2
                 ORDER BY a.category, a.key",
            )
            .context("Failed to prepare compare")?;
        let rows = stmt
            .query_map(params![run_a, run_b], |row| {
                Ok(MetricDelta {
                    category: row.get(0)?,
                    key: row.get(1)?,
                    value_a: row.get(2)?,
                    value_b: row.get(3)?,
                    delta: row.get(4)?,
                    percent_change: row.get(5)?,
                })
            })
            .context("Failed to compare runs")?;
        let mut deltas = Vec::new();
        for row in rows {
            deltas.push(row.context("Failed to read comparison row")?);
        }
        Ok(deltas)
    }
}

/// A `runs` row before its text columns are parsed.
struct RawRun {
    run_id: String,
    project: String,
    target: String,
    strategy: String,
    started_at: String,
    ended_at: Option<String>,
    status: String,
}

impl RawRun {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            project: row.get(1)?,
            target: row.get(2)?,
            strategy: row.get(3)?,
            started_at: row.get(4)?,
            ended_at: row.get(5)?,
            status: row.get(6)?,
        })
    }

    fn into_run(self) -> Result<MigrationRun> {
        let parse_time = |s: &str| -> Result<DateTime<Utc>> {
            Ok(DateTime::parse_from_rfc3339(s)
                .with_context(|| format!("Invalid timestamp '{}' for run {}", s, self.run_id))?
                .with_timezone(&Utc))
        };
        let started_at = parse_time(&self.started_at)?;
        let ended_at = self.ended_at.as_deref().map(parse_time).transpose()?;
        let strategy = Strategy::from_str(&self.strategy).map_err(anyhow::Error::msg)?;
        let status = RunStatus::from_str(&self.status).map_err(anyhow::Error::msg)?;
        Ok(MigrationRun {
            run_id: self.run_id,
            project: self.project,
            target_language: self.target,
            strategy,
            started_at,
            ended_at,
            status,
        })
    }
}
