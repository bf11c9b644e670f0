use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use crate::models::{
    CoreError, CoreErrorKind, CoreResult, FailureKind, ReportEntry, RunReport, TaskFailure,
    TaskName, TaskStatus, Verdict,
};

/// Shared collection point for verdicts. The lock only guards bookkeeping;
/// task execution never happens while it is held.
pub struct ResultAggregator {
    started_at: SystemTime,
    state: Mutex<AggregatorState>,
}

struct AggregatorState {
    order: Vec<TaskName>,
    statuses: HashMap<TaskName, TaskStatus>,
    verdicts: HashMap<TaskName, Verdict>,
}

impl ResultAggregator {
    pub fn new(tasks: impl IntoIterator<Item = TaskName>) -> CoreResult<Self> {
        let mut order = Vec::new();
        let mut statuses = HashMap::new();
        for task in tasks {
            if statuses.insert(task.clone(), TaskStatus::Pending).is_some() {
                return Err(CoreError::for_task(
                    &task,
                    CoreErrorKind::InvalidInput,
                    format!("task '{task}' is tracked twice"),
                ));
            }
            order.push(task);
        }

        Ok(Self {
            started_at: SystemTime::now(),
            state: Mutex::new(AggregatorState {
                order,
                statuses,
                verdicts: HashMap::new(),
            }),
        })
    }

    pub fn mark_running(&self, task: &TaskName) -> CoreResult<()> {
        let mut state = self.lock_state()?;
        transition(&mut state, task, TaskStatus::Running)
    }

    /// Stores the single verdict for `task`. A second verdict for the same
    /// task is a bookkeeping bug and is reported as such.
    pub fn record(&self, task: &TaskName, verdict: Verdict) -> CoreResult<()> {
        let mut state = self.lock_state()?;
        if state.verdicts.contains_key(task) {
            return Err(CoreError::for_task(
                task,
                CoreErrorKind::Internal,
                format!("task '{task}' already has a recorded verdict"),
            ));
        }

        transition(&mut state, task, verdict.status.task_status())?;
        state.verdicts.insert(task.clone(), verdict);
        Ok(())
    }

    pub fn status(&self, task: &TaskName) -> CoreResult<TaskStatus> {
        let state = self.lock_state()?;
        state
            .statuses
            .get(task)
            .copied()
            .ok_or_else(|| unknown_task(task))
    }

    pub fn snapshot(&self) -> CoreResult<Vec<(TaskName, TaskStatus)>> {
        let state = self.lock_state()?;
        Ok(state
            .order
            .iter()
            .filter_map(|task| state.statuses.get(task).map(|status| (task.clone(), *status)))
            .collect())
    }

    /// Builds the report. Tasks that never got a verdict (their worker died
    /// outside the executor) are filled in as failed so nothing goes missing.
    pub fn finalize(&self) -> CoreResult<RunReport> {
        let mut state = self.lock_state()?;
        let order = state.order.clone();
        let mut entries = Vec::with_capacity(order.len());

        for task in order {
            let verdict = match state.verdicts.get(&task) {
                Some(verdict) => verdict.clone(),
                None => {
                    tracing::error!(task = %task, "no verdict recorded for task");
                    let verdict = Verdict::failed(vec![TaskFailure::new(
                        FailureKind::Infrastructure,
                        "worker exited without recording a verdict",
                    )]);
                    state.statuses.insert(task.clone(), TaskStatus::Failed);
                    state.verdicts.insert(task.clone(), verdict.clone());
                    verdict
                }
            };
            entries.push(ReportEntry { task, verdict });
        }

        Ok(RunReport::new(self.started_at, SystemTime::now(), entries))
    }

    fn lock_state(&self) -> CoreResult<MutexGuard<'_, AggregatorState>> {
        self.state.lock().map_err(|_| {
            CoreError::new(CoreErrorKind::Internal, "result aggregator mutex poisoned")
        })
    }
}

fn transition(state: &mut AggregatorState, task: &TaskName, desired: TaskStatus) -> CoreResult<()> {
    let current = state
        .statuses
        .get_mut(task)
        .ok_or_else(|| unknown_task(task))?;

    if !current.can_transition_to(desired) {
        return Err(CoreError::for_task(
            task,
            CoreErrorKind::Internal,
            format!("task '{task}' cannot transition from '{current:?}' to '{desired:?}'"),
        ));
    }

    *current = desired;
    Ok(())
}

fn unknown_task(task: &TaskName) -> CoreError {
    CoreError::for_task(
        task,
        CoreErrorKind::Internal,
        format!("task '{task}' is not part of this run"),
    )
}
