use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::models::{TaskName, Verdict, VerdictStatus};

pub const DEFAULT_ERROR_CHAR_LIMIT: usize = 40;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportOptions {
    /// Per-item cap applied to error strings in the summary. `None` keeps
    /// them whole.
    pub error_char_limit: Option<usize>,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            error_char_limit: Some(DEFAULT_ERROR_CHAR_LIMIT),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub task: TaskName,
    pub verdict: Verdict,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Every registered task with its verdict, in registration order.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
    pub entries: Vec<ReportEntry>,
}

impl RunReport {
    pub fn new(started_at: SystemTime, finished_at: SystemTime, entries: Vec<ReportEntry>) -> Self {
        Self {
            started_at,
            finished_at,
            entries,
        }
    }

    pub fn get(&self, task: &str) -> Option<&Verdict> {
        self.entries
            .iter()
            .find(|entry| entry.task.as_str() == task)
            .map(|entry| &entry.verdict)
    }

    pub fn task_names(&self) -> impl Iterator<Item = &TaskName> {
        self.entries.iter().map(|entry| &entry.task)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when every task that was not skipped passed. Skipped tasks never
    /// affect the outcome.
    pub fn overall_passed(&self) -> bool {
        self.entries
            .iter()
            .filter(|entry| !entry.verdict.is_skipped())
            .all(|entry| entry.verdict.is_passed())
    }

    pub fn has_cleanup_errors(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.verdict.has_cleanup_errors())
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in &self.entries {
            match entry.verdict.status {
                VerdictStatus::Passed => counts.passed += 1,
                VerdictStatus::Failed => counts.failed += 1,
                VerdictStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    pub fn elapsed(&self) -> Duration {
        self.finished_at
            .duration_since(self.started_at)
            .unwrap_or(Duration::ZERO)
    }

    /// Compact machine-readable form: `"PASSED"` / `"SKIPPED"` for clean
    /// outcomes, otherwise an object carrying the status, truncated error
    /// lines and cleanup errors as a separate list.
    pub fn summary(&self, options: &ReportOptions) -> Value {
        let mut summary = Map::with_capacity(self.entries.len());
        for entry in &self.entries {
            let verdict = &entry.verdict;
            let value = if verdict.failures.is_empty() && verdict.cleanup_errors.is_empty() {
                Value::String(verdict.status.as_str().to_string())
            } else {
                json!({
                    "status": verdict.status.as_str(),
                    "errors": truncate_all(verdict.error_strings(), options),
                    "cleanup_errors": truncate_all(verdict.cleanup_errors.clone(), options),
                })
            };
            summary.insert(entry.task.to_string(), value);
        }
        Value::Object(summary)
    }
}

fn truncate_all(lines: Vec<String>, options: &ReportOptions) -> Vec<String> {
    match options.error_char_limit {
        Some(limit) => lines
            .into_iter()
            .map(|line| truncate_chars(&line, limit))
            .collect(),
        None => lines,
    }
}

pub fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((byte_index, _)) => text[..byte_index].to_string(),
        None => text.to_string(),
    }
}
