use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::models::{FailureKind, TaskFailure, TaskStatus};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictStatus {
    Passed,
    Failed,
    Skipped,
}

impl VerdictStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VerdictStatus::Passed => "PASSED",
            VerdictStatus::Failed => "FAILED",
            VerdictStatus::Skipped => "SKIPPED",
        }
    }

    pub fn task_status(self) -> TaskStatus {
        match self {
            VerdictStatus::Passed => TaskStatus::Passed,
            VerdictStatus::Failed => TaskStatus::Failed,
            VerdictStatus::Skipped => TaskStatus::Skipped,
        }
    }
}

impl std::str::FromStr for VerdictStatus {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "PASSED" => Ok(VerdictStatus::Passed),
            "FAILED" => Ok(VerdictStatus::Failed),
            "SKIPPED" => Ok(VerdictStatus::Skipped),
            _ => Err(()),
        }
    }
}

/// Outcome of one task. Task failures and cleanup errors are kept apart so a
/// reader can tell "the check failed" from "the check passed but teardown
/// left something behind".
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<TaskFailure>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cleanup_errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<SystemTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<SystemTime>,
    /// Session attempts used before the routine ran (or setup gave up).
    #[serde(default)]
    pub attempts: u32,
}

impl Verdict {
    pub fn passed() -> Self {
        Self::with_status(VerdictStatus::Passed)
    }

    pub fn skipped() -> Self {
        Self::with_status(VerdictStatus::Skipped)
    }

    pub fn failed(failures: Vec<TaskFailure>) -> Self {
        Self {
            failures,
            ..Self::with_status(VerdictStatus::Failed)
        }
    }

    /// Builds the verdict from the failures gathered so far: none means
    /// PASSED, anything else FAILED.
    pub fn from_failures(failures: Vec<TaskFailure>) -> Self {
        if failures.is_empty() {
            Self::passed()
        } else {
            Self::failed(failures)
        }
    }

    fn with_status(status: VerdictStatus) -> Self {
        Self {
            status,
            failures: Vec::new(),
            cleanup_errors: Vec::new(),
            started_at: None,
            finished_at: None,
            attempts: 0,
        }
    }

    pub fn is_passed(&self) -> bool {
        self.status == VerdictStatus::Passed
    }

    pub fn is_skipped(&self) -> bool {
        self.status == VerdictStatus::Skipped
    }

    pub fn has_cleanup_errors(&self) -> bool {
        !self.cleanup_errors.is_empty()
    }

    pub fn has_failure_kind(&self, kind: FailureKind) -> bool {
        self.failures.iter().any(|failure| failure.kind == kind)
    }

    /// Failure detail as ordered human-readable lines: each message, then
    /// its trace when one was captured.
    pub fn error_strings(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.failures.len());
        for failure in &self.failures {
            lines.push(failure.message.clone());
            if let Some(trace) = &failure.trace {
                lines.push(trace.clone());
            }
        }
        lines
    }

    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        finished.duration_since(started).ok()
    }
}
