use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, RunReport, StatusCounts, TaskFailure, TaskName, VerdictStatus};

pub type PersistenceResult<T> = Result<T, CoreError>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RunId(pub u64);

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One row of run history.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: RunId,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
    pub overall_passed: bool,
    pub has_cleanup_errors: bool,
    pub counts: StatusCounts,
}

impl RunSummary {
    pub fn elapsed(&self) -> Duration {
        self.finished_at
            .duration_since(self.started_at)
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StoredVerdict {
    pub task: TaskName,
    pub status: VerdictStatus,
    pub failures: Vec<TaskFailure>,
    pub cleanup_errors: Vec<String>,
    pub attempts: u32,
    pub duration: Option<Duration>,
}

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

/// History of finished runs. Writes happen once per run, after the report is
/// final.
pub trait RunStore: Send + Sync {
    fn save_run(&self, report: &RunReport) -> PersistenceResult<RunId>;

    fn list_recent_runs(&self, limit: usize) -> PersistenceResult<Vec<RunSummary>>;

    fn task_verdicts(&self, run: RunId) -> PersistenceResult<Vec<StoredVerdict>>;

    fn prune_runs_older_than(&self, max_age: Duration) -> PersistenceResult<usize>;
}
