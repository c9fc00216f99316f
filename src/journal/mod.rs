//! Append-only execution journal, one JSONL file per run.
//!
//! The journal is the single record both metrics paths read: the live run
//! derives its metrics from the events it has journaled, and `metrics
//! backfill` derives them from the file afterwards.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use porter_common::{QualityGateResult, RunStatus, Strategy, UnitPhase, UnitStatus};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub turns: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        project: String,
        target: String,
        strategy: Strategy,
        started_at: DateTime<Utc>,
        /// Unit ids in execution order
        units: Vec<String>,
        #[serde(default)]
        resumed: bool,
    },
    PhaseCompleted {
        unit_id: String,
        phase: UnitPhase,
        attempt: u32,
        ok: bool,
        duration_ms: u64,
        #[serde(default)]
        usage: UsageRecord,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    GateEvaluated {
        result: QualityGateResult,
    },
    UnitFinished {
        unit_id: String,
        status: UnitStatus,
        attempts: u32,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    RunFinished {
        status: RunStatus,
        ended_at: DateTime<Utc>,
        wall_clock_ms: u64,
    },
}

/// Writer for `<log_dir>/<run_id>.jsonl`.
pub struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    pub fn path_for(log_dir: &Path, run_id: &str) -> PathBuf {
        log_dir.join(format!("{}.jsonl", run_id))
    }

    /// Open for appending, creating the file and its directory if needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create journal directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open journal {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn record(&mut self, event: &RunEvent) -> Result<()> {
        let mut line = serde_json::to_string(event).context("Failed to serialize journal event")?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .with_context(|| format!("Failed to append to journal {}", self.path.display()))?;
        self.file.flush().context("Failed to flush journal")?;
        Ok(())
    }
}

/// Read every event of a journal. Blank lines are skipped; a malformed line
/// is an error naming its line number.
pub fn read_events(path: &Path) -> Result<Vec<RunEvent>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open journal {}", path.display()))?;
    let mut events = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read journal {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RunEvent>(&line) {
            Ok(event) => events.push(event),
            Err(e) => bail!(
                "Malformed journal line {} in {}: {}",
                index + 1,
                path.display(),
                e
            ),
        }
    }
    Ok(events)
}

/// Read a journal before appending to it again on resume.
///
/// A missing file yields no events. A malformed final line is the tail of an
/// interrupted append: it is dropped with a warning and cut from the file, so
/// the next record starts on a line of its own. Malformed lines before the
/// last are errors, as in [`read_events`].
pub fn recover_events(path: &Path) -> Result<Vec<RunEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content =
        fs::read(path).with_context(|| format!("Failed to read journal {}", path.display()))?;
    let lines: Vec<&[u8]> = content.split_inclusive(|&b| b == b'\n').collect();

    let mut events = Vec::new();
    let mut offset = 0;
    let mut keep = content.len();
    for (index, raw) in lines.iter().enumerate() {
        let start = offset;
        offset += raw.len();
        let line = raw.trim_ascii();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<RunEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) if lines[index + 1..].iter().all(|l| l.trim_ascii().is_empty()) => {
                warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %e,
                    "dropping torn journal tail"
                );
                keep = start;
            }
            Err(e) => bail!(
                "Malformed journal line {} in {}: {}",
                index + 1,
                path.display(),
                e
            ),
        }
    }

    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open journal {}", path.display()))?;
    if keep < content.len() {
        file.set_len(keep as u64)
            .and_then(|_| file.sync_all())
            .with_context(|| format!("Failed to truncate journal {}", path.display()))?;
    } else if content.last().is_some_and(|&b| b != b'\n') {
        (&file)
            .seek(SeekFrom::End(0))
            .and_then(|_| (&file).write_all(b"\n"))
            .with_context(|| format!("Failed to repair journal {}", path.display()))?;
    }
    Ok(events)
}
