//! Offline metrics reconstruction from captured logs.
//!
//! `.jsonl` files are porter journals and are replayed as-is. Anything else
//! is treated as a legacy text log and parsed into the same event shape, so
//! both end up in [`super::persist_events`] exactly like a live run.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use porter_common::{RunStatus, Strategy, UnitPhase, UnitStatus};
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::db::MetricsDb;
use crate::journal::{self, RunEvent, UsageRecord};

static RESULT_MESSAGE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"ResultMessage\(.*?duration_ms=(\d+).*?duration_api_ms=(\d+).*?num_turns=(\d+).*?total_cost_usd=([\d.]+)",
    )
    .unwrap()
});

static USAGE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"'input_tokens': (\d+).*?'cache_creation_input_tokens': (\d+).*?'cache_read_input_tokens': (\d+)",
    )
    .unwrap()
});

static OUTPUT_TOKENS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'output_tokens': (\d+)").unwrap());

static START_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Starting Migration: (\w+) -> (\w+)").unwrap());

static STRATEGY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Strategy: ([\w-]+)").unwrap());

static SESSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"session_id='([^']+)'").unwrap());

static TIMESTAMP_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([\d:]+)\]").unwrap());

static FILENAME_DATE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"migration_(\d{8})_(\d{6})").unwrap());

/// Header lines searched for the project and strategy.
const HEADER_LINES: usize = 20;

#[derive(Debug, Default)]
pub struct BackfillSummary {
    pub files: usize,
    pub runs: Vec<String>,
    pub records: usize,
    pub skipped: Vec<(PathBuf, String)>,
}

/// Expand each argument as a glob; plain paths pass through unchanged.
pub fn expand_paths(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for pattern in patterns {
        if pattern.contains(['*', '?', '[']) {
            let matches =
                glob::glob(pattern).with_context(|| format!("Invalid glob pattern '{}'", pattern))?;
            let before = paths.len();
            for entry in matches {
                match entry {
                    Ok(path) if path.is_file() => paths.push(path),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "unreadable glob match"),
                }
            }
            if paths.len() == before {
                warn!(pattern = %pattern, "pattern matched no files");
            }
        } else {
            paths.push(PathBuf::from(pattern));
        }
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}

/// Turn one captured log into journal events.
pub fn load_events(path: &Path) -> Result<Vec<RunEvent>> {
    if path.extension().is_some_and(|ext| ext == "jsonl") {
        return journal::read_events(path);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read log {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(parse_legacy_log(&content, &file_name))
}

/// Backfill every file the patterns name. A file that cannot be parsed is
/// reported in the summary and does not stop the others.
pub fn backfill(db: &MetricsDb, patterns: &[String]) -> Result<BackfillSummary> {
    let mut summary = BackfillSummary::default();
    for path in expand_paths(patterns)? {
        summary.files += 1;
        let outcome = load_events(&path).and_then(|events| super::persist_events(db, &events));
        match outcome {
            Ok(Some((run_id, records))) => {
                info!(path = %path.display(), run_id = %run_id, records, "backfilled");
                summary.records += records;
                summary.runs.push(run_id);
            }
            Ok(None) => {
                summary
                    .skipped
                    .push((path, "no run start found".to_string()));
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "backfill failed");
                summary.skipped.push((path, format!("{:#}", e)));
            }
        }
    }
    Ok(summary)
}

/// What a legacy text log says about its single run.
#[derive(Debug, Default, PartialEq)]
struct LegacyLog {
    project: Option<String>,
    target: Option<String>,
    strategy: Option<String>,
    session_id: Option<String>,
    duration_ms: u64,
    turns: u64,
    cost_usd: f64,
    input_tokens: u64,
    output_tokens: u64,
    success: bool,
    first_timestamp: Option<String>,
}

fn capture_u64(caps: &regex::Captures<'_>, i: usize) -> u64 {
    caps.get(i)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

fn scan_legacy(content: &str) -> LegacyLog {
    let mut log = LegacyLog::default();

    for line in content.lines().take(HEADER_LINES) {
        if let Some(caps) = START_REGEX.captures(line) {
            log.project = Some(caps[1].to_string());
            log.target = Some(caps[2].to_string());
        }
        if let Some(caps) = STRATEGY_REGEX.captures(line) {
            log.strategy = Some(caps[1].to_string());
        }
    }

    for line in content.lines().filter(|l| l.contains("ResultMessage")) {
        if let Some(caps) = RESULT_MESSAGE_REGEX.captures(line) {
            log.duration_ms = capture_u64(&caps, 1);
            log.turns = capture_u64(&caps, 3);
            log.cost_usd = caps[4].parse().unwrap_or(0.0);
        }
        if let Some(caps) = USAGE_REGEX.captures(line) {
            log.input_tokens = capture_u64(&caps, 1) + capture_u64(&caps, 2) + capture_u64(&caps, 3);
        }
        if let Some(caps) = OUTPUT_TOKENS_REGEX.captures(line) {
            log.output_tokens = capture_u64(&caps, 1);
        }
        if line.contains("subtype='success'") {
            log.success = true;
        }
    }

    log.session_id = SESSION_REGEX.captures(content).map(|c| c[1].to_string());
    log.first_timestamp = TIMESTAMP_REGEX.captures(content).map(|c| c[1].to_string());
    log
}

/// Start time from the `migration_YYYYMMDD_HHMMSS` file name, refined by the
/// first `[HH:MM:SS]` stamp in the log. The epoch when neither is present.
fn started_at(file_name: &str, first_timestamp: Option<&str>) -> DateTime<Utc> {
    let Some(caps) = FILENAME_DATE_REGEX.captures(file_name) else {
        return DateTime::<Utc>::UNIX_EPOCH;
    };
    let Ok(date) = NaiveDate::parse_from_str(&caps[1], "%Y%m%d") else {
        return DateTime::<Utc>::UNIX_EPOCH;
    };
    let time = first_timestamp
        .and_then(|t| NaiveTime::parse_from_str(t, "%H:%M:%S").ok())
        .or_else(|| NaiveTime::parse_from_str(&caps[2], "%H%M%S").ok())
        .unwrap_or_default();
    date.and_time(time).and_utc()
}

fn legacy_run_id(session_id: Option<&str>, content: &str) -> String {
    match session_id {
        Some(id) => id.to_string(),
        None => {
            let digest = Sha256::digest(content.as_bytes());
            let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
            format!("legacy-{}", hex)
        }
    }
}

/// Parse a legacy text log into the event sequence of a one-unit run.
///
/// The unit is named after the project and carries the whole log's usage.
pub fn parse_legacy_log(content: &str, file_name: &str) -> Vec<RunEvent> {
    let log = scan_legacy(content);
    let project = log.project.clone().unwrap_or_else(|| "unknown".to_string());
    let target = log
        .target
        .as_deref()
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| "unknown".to_string());
    let strategy = log
        .strategy
        .as_deref()
        .and_then(|s| s.parse::<Strategy>().ok())
        .unwrap_or(Strategy::ModuleByModule);
    let started_at = started_at(file_name, log.first_timestamp.as_deref());
    let run_id = legacy_run_id(log.session_id.as_deref(), content);
    let (unit_status, run_status) = if log.success {
        (UnitStatus::Done, RunStatus::Succeeded)
    } else {
        (UnitStatus::Failed, RunStatus::Failed)
    };

    vec![
        RunEvent::RunStarted {
            run_id,
            project: project.clone(),
            target,
            strategy,
            started_at,
            units: vec![project.clone()],
            resumed: false,
        },
        RunEvent::PhaseCompleted {
            unit_id: project.clone(),
            phase: UnitPhase::Migrating,
            attempt: 1,
            ok: log.success,
            duration_ms: log.duration_ms,
            usage: UsageRecord {
                cost_usd: log.cost_usd,
                input_tokens: log.input_tokens,
                output_tokens: log.output_tokens,
                turns: log.turns,
            },
            error: (!log.success).then(|| "no successful result in log".to_string()),
        },
        RunEvent::UnitFinished {
            unit_id: project,
            status: unit_status,
            attempts: 1,
            duration_ms: log.duration_ms,
            reason: None,
        },
        RunEvent::RunFinished {
            status: run_status,
            ended_at: started_at + Duration::milliseconds(log.duration_ms as i64),
            wall_clock_ms: log.duration_ms,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use crate::metrics::derive::derive_records;
    use chrono::{Datelike, Timelike};
    use tempfile::tempdir;

    const LEGACY: &str = "\
[14:02:11] ============================================================
[14:02:11] Starting Migration: rpn2tex -> Rust
[14:02:11] Strategy: feature-by-feature
[14:02:12] MSG #1
[14:40:03] ResultMessage(subtype='success', duration_ms=2271000, duration_api_ms=1900000, is_error=False, num_turns=57, session_id='sess-123', total_cost_usd=4.25, usage={'input_tokens': 1000, 'cache_creation_input_tokens': 200, 'cache_read_input_tokens': 30, 'output_tokens': 4500})
";

    #[test]
    fn test_scan_legacy_fields() {
        let log = scan_legacy(LEGACY);
        assert_eq!(log.project.as_deref(), Some("rpn2tex"));
        assert_eq!(log.target.as_deref(), Some("Rust"));
        assert_eq!(log.strategy.as_deref(), Some("feature-by-feature"));
        assert_eq!(log.session_id.as_deref(), Some("sess-123"));
        assert_eq!(log.duration_ms, 2_271_000);
        assert_eq!(log.turns, 57);
        assert_eq!(log.cost_usd, 4.25);
        assert_eq!(log.input_tokens, 1230);
        assert_eq!(log.output_tokens, 4500);
        assert!(log.success);
    }

    #[test]
    fn test_legacy_events_shape() {
        let events = parse_legacy_log(LEGACY, "migration_20250114_140211.log");
        assert_eq!(events.len(), 4);
        match &events[0] {
            RunEvent::RunStarted {
                run_id,
                target,
                strategy,
                started_at,
                ..
            } => {
                assert_eq!(run_id, "sess-123");
                assert_eq!(target, "rust");
                assert_eq!(*strategy, Strategy::FeatureByFeature);
                assert_eq!(started_at.day(), 14);
                assert_eq!(started_at.hour(), 14);
            }
            other => panic!("Expected RunStarted, got {other:?}"),
        }
        assert!(matches!(
            events[3],
            RunEvent::RunFinished {
                status: RunStatus::Succeeded,
                wall_clock_ms: 2_271_000,
                ..
            }
        ));
    }

    #[test]
    fn test_failed_legacy_log_without_session_has_stable_id() {
        let content = "Starting Migration: calc -> Go\nsomething broke\n";
        let a = parse_legacy_log(content, "run.log");
        let b = parse_legacy_log(content, "run.log");
        assert_eq!(a, b);
        match &a[0] {
            RunEvent::RunStarted {
                run_id, started_at, ..
            } => {
                assert!(run_id.starts_with("legacy-"));
                assert_eq!(*started_at, DateTime::<Utc>::UNIX_EPOCH);
            }
            other => panic!("Expected RunStarted, got {other:?}"),
        }
        assert!(matches!(
            a[2],
            RunEvent::UnitFinished {
                status: UnitStatus::Failed,
                ..
            }
        ));
    }

    #[test]
    fn test_backfill_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let log = dir.path().join("migration_20250114_140211.log");
        std::fs::write(&log, LEGACY)?;
        let db = MetricsDb::new_in_memory()?;
        let patterns = vec![dir.path().join("*.log").to_string_lossy().into_owned()];

        let first = backfill(&db, &patterns)?;
        assert_eq!(first.runs, vec!["sess-123".to_string()]);
        let rows = db.metrics_for("sess-123")?;
        backfill(&db, &patterns)?;
        assert_eq!(db.metrics_for("sess-123")?, rows);
        assert_eq!(db.list_projects()?, vec!["rpn2tex".to_string()]);
        Ok(())
    }

    #[test]
    fn test_journal_backfill_matches_live_derivation() -> Result<()> {
        let dir = tempdir()?;
        let path = Journal::path_for(dir.path(), "run-9");
        let events = parse_legacy_log(LEGACY, "migration_20250114_140211.log");
        let mut journal = Journal::open(&path)?;
        for event in &events {
            journal.record(event)?;
        }

        let db = MetricsDb::new_in_memory()?;
        backfill(&db, &[path.to_string_lossy().into_owned()])?;
        let mut expected = derive_records("sess-123", &events);
        expected.sort_by(|a, b| (&a.category, &a.key).cmp(&(&b.category, &b.key)));
        assert_eq!(db.metrics_for("sess-123")?, expected);
        Ok(())
    }

    #[test]
    fn test_bad_file_is_skipped() -> Result<()> {
        let dir = tempdir()?;
        let bad = dir.path().join("broken.jsonl");
        std::fs::write(&bad, "{not json}\n")?;
        let db = MetricsDb::new_in_memory()?;
        let summary = backfill(&db, &[bad.to_string_lossy().into_owned()])?;
        assert_eq!(summary.files, 1);
        assert!(summary.runs.is_empty());
        assert_eq!(summary.skipped.len(), 1);
        Ok(())
    }

    #[test]
    fn test_expand_paths_dedups() -> Result<()> {
        let dir = tempdir()?;
        std::fs::write(dir.path().join("a.log"), "")?;
        let literal = dir.path().join("a.log").to_string_lossy().into_owned();
        let pattern = dir.path().join("*.log").to_string_lossy().into_owned();
        assert_eq!(expand_paths(&[literal, pattern])?.len(), 1);
        Ok(())
    }
}
