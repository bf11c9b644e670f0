use std::fmt::Write as _;
use std::time::{Duration, SystemTime};

use crossterm::style::{StyledContent, Stylize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use vetpool_core::models::{ReportOptions, RunReport, VerdictStatus, truncate_chars};
use vetpool_core::persistence::{RunSummary, StoredVerdict};

pub fn timestamp(at: SystemTime) -> String {
    OffsetDateTime::from(at)
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown time".to_string())
}

pub fn seconds(duration: Duration) -> String {
    format!("{:.1}s", duration.as_secs_f64())
}

fn status_label(status: VerdictStatus, color: bool) -> String {
    let label = format!("{:<8}", status.as_str());
    if !color {
        return label;
    }
    let styled: StyledContent<String> = match status {
        VerdictStatus::Passed => label.green(),
        VerdictStatus::Failed => label.red().bold(),
        VerdictStatus::Skipped => label.dark_grey(),
    };
    styled.to_string()
}

fn clip(line: &str, options: &ReportOptions) -> String {
    match options.error_char_limit {
        Some(limit) => truncate_chars(line, limit),
        None => line.to_string(),
    }
}

/// Terminal table of a finished run: one line per task in registration
/// order, failure and cleanup details indented underneath.
pub fn run_report(report: &RunReport, options: &ReportOptions, color: bool) -> String {
    let width = report
        .task_names()
        .map(|name| name.as_str().chars().count())
        .max()
        .unwrap_or(0);
    let mut out = String::new();

    let _ = writeln!(
        out,
        "run started {} finished in {}",
        timestamp(report.started_at),
        seconds(report.elapsed())
    );

    for entry in &report.entries {
        let verdict = &entry.verdict;
        let _ = write!(
            out,
            "  {} {:<width$}",
            status_label(verdict.status, color),
            entry.task.as_str()
        );
        if let Some(duration) = verdict.duration() {
            let _ = write!(out, "  {}", seconds(duration));
        }
        if verdict.attempts > 1 {
            let _ = write!(out, "  ({} session attempts)", verdict.attempts);
        }
        out.push('\n');

        for failure in &verdict.failures {
            let _ = writeln!(
                out,
                "      {}: {}",
                failure.kind.as_str(),
                clip(&failure.message, options)
            );
        }
        for cleanup in &verdict.cleanup_errors {
            let _ = writeln!(out, "      cleanup: {}", clip(cleanup, options));
        }
    }

    let counts = report.counts();
    let overall = if report.overall_passed() {
        VerdictStatus::Passed
    } else {
        VerdictStatus::Failed
    };
    let _ = writeln!(
        out,
        "{} {} tasks: {} passed, {} failed, {} skipped",
        status_label(overall, color).trim_end(),
        report.len(),
        counts.passed,
        counts.failed,
        counts.skipped
    );
    out
}

pub fn run_list(runs: &[RunSummary], color: bool) -> String {
    if runs.is_empty() {
        return "no recorded runs\n".to_string();
    }

    let mut out = String::new();
    for run in runs {
        let overall = if run.overall_passed {
            VerdictStatus::Passed
        } else {
            VerdictStatus::Failed
        };
        let _ = write!(
            out,
            "#{:<5} {} {}  {:>7}  {} passed, {} failed, {} skipped",
            run.id,
            status_label(overall, color),
            timestamp(run.started_at),
            seconds(run.elapsed()),
            run.counts.passed,
            run.counts.failed,
            run.counts.skipped
        );
        if run.has_cleanup_errors {
            out.push_str("  (cleanup errors)");
        }
        out.push('\n');
    }
    out
}

pub fn stored_verdicts(verdicts: &[StoredVerdict], color: bool) -> String {
    if verdicts.is_empty() {
        return "no verdicts recorded for this run\n".to_string();
    }

    let mut out = String::new();
    for verdict in verdicts {
        let _ = write!(out, "  {} {}", status_label(verdict.status, color), verdict.task);
        if let Some(duration) = verdict.duration {
            let _ = write!(out, "  {}", seconds(duration));
        }
        out.push('\n');
        for failure in &verdict.failures {
            let _ = writeln!(out, "      {}: {}", failure.kind.as_str(), failure.message);
        }
        for cleanup in &verdict.cleanup_errors {
            let _ = writeln!(out, "      cleanup: {cleanup}");
        }
    }
    out
}
