use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use porter_common::{QualityGateResult, RunStatus, UnitPhase};

use crate::ui::icons::{CHECK, CROSS, GATE, RETRY, SKIP, SPARKLE, STOP};

/// Terminal progress for a migration run.
///
/// Two stacked bars: a unit bar counting units that reached a boundary, and a
/// spinner naming the unit, attempt and phase currently running.
pub struct OrchestratorUI {
    multi: MultiProgress,
    unit_bar: ProgressBar,
    phase_bar: ProgressBar,
    verbose: bool,
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn spinner_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

impl OrchestratorUI {
    pub fn new(total_units: u64, verbose: bool) -> Self {
        Self::with_target(total_units, verbose, ProgressDrawTarget::stderr())
    }

    /// A UI that renders nothing, for `--quiet` and non-terminal output.
    pub fn hidden(total_units: u64) -> Self {
        Self::with_target(total_units, false, ProgressDrawTarget::hidden())
    }

    fn with_target(total_units: u64, verbose: bool, target: ProgressDrawTarget) -> Self {
        let multi = MultiProgress::with_draw_target(target);

        let unit_bar = multi.add(ProgressBar::new(total_units));
        unit_bar.set_style(
            bar_style("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .progress_chars("█▓▒░"),
        );
        unit_bar.set_prefix("Units");

        let phase_bar = multi.add(ProgressBar::new_spinner());
        phase_bar.set_style(spinner_style("{prefix:.bold.dim} {spinner} {msg}"));
        phase_bar.set_prefix(" Phase");

        Self {
            multi,
            unit_bar,
            phase_bar,
            verbose,
        }
    }

    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    /// Count units restored from a checkpoint as already done.
    pub fn restore_completed(&self, completed: u64) {
        self.unit_bar.set_position(completed);
    }

    pub fn start_unit(&self, unit_id: &str, attempt: u32, max_attempts: u32) {
        self.unit_bar.set_message(format!(
            "{} {}",
            style(unit_id).yellow(),
            style(format!("(attempt {}/{})", attempt, max_attempts)).dim()
        ));
        self.phase_bar
            .enable_steady_tick(Duration::from_millis(100));
    }

    pub fn start_phase(&self, unit_id: &str, phase: UnitPhase) {
        self.phase_bar.set_message(format!(
            "{} {}",
            style(unit_id).cyan(),
            style(phase).bold()
        ));
        if self.verbose {
            self.print_line(format!(
                "    {} {} {}",
                style("→").dim(),
                style(unit_id).dim(),
                style(phase).dim()
            ));
        }
    }

    pub fn gate_result(&self, result: &QualityGateResult) {
        if result.passed {
            if self.verbose {
                self.print_line(format!(
                    "    {}{} passed {}",
                    GATE,
                    result.gate_name,
                    style(format!("({}ms)", result.duration_ms)).dim()
                ));
            }
            return;
        }
        let reason = result
            .failure
            .as_ref()
            .map(|f| f.to_string())
            .unwrap_or_else(|| "failed".to_string());
        self.print_line(format!(
            "    {}{} {}",
            GATE,
            style(&result.gate_name).red(),
            style(reason).red()
        ));
    }

    pub fn retry(&self, unit_id: &str, next_attempt: u32, backoff: Duration) {
        self.print_line(format!(
            "  {}{} retrying as attempt {} in {:.1}s",
            RETRY,
            style(unit_id).yellow(),
            next_attempt,
            backoff.as_secs_f64()
        ));
    }

    pub fn unit_done(&self, unit_id: &str, attempts: u32) {
        self.unit_bar.inc(1);
        self.print_line(format!(
            "  {}{} {}",
            CHECK,
            style(unit_id).green(),
            style(format!("({} attempt{})", attempts, if attempts == 1 { "" } else { "s" })).dim()
        ));
    }

    pub fn unit_failed(&self, unit_id: &str, reason: &str) {
        self.unit_bar.inc(1);
        self.print_line(format!("  {}{} {}", CROSS, style(unit_id).red(), reason));
    }

    pub fn unit_skipped(&self, unit_id: &str, reason: &str) {
        self.unit_bar.inc(1);
        self.print_line(format!(
            "  {}{} {}",
            SKIP,
            style(unit_id).dim(),
            style(reason).dim()
        ));
    }

    pub fn finish(&self, status: RunStatus) {
        self.phase_bar.finish_and_clear();
        let msg = match status {
            RunStatus::Succeeded => format!("{}{}", SPARKLE, style("Migration succeeded").green().bold()),
            RunStatus::Failed => format!("{}{}", CROSS, style("Migration failed").red().bold()),
            RunStatus::Aborted => format!("{}{}", STOP, style("Migration aborted").yellow().bold()),
            RunStatus::Running => String::new(),
        };
        self.unit_bar.finish_with_message(msg);
    }
}
