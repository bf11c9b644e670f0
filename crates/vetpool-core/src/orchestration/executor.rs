use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::FutureExt;
use tracing::Instrument;

use crate::models::{FailureKind, TaskFailure, TaskName, Verdict, VerdictStatus};
use crate::orchestration::{
    CancellationToken, CleanupPolicy, install_panic_trace_hook, panic_message, take_panic_trace,
};
use crate::routine::{Routine, RoutineResult};
use crate::session::{ExecutionContext, ResourceReaper, RetryOutcome, SessionProvisioner};
use crate::task_context;

enum RoutineOutcome {
    Finished(RoutineResult),
    Panicked {
        message: String,
        trace: Option<String>,
    },
    TimedOut(Duration),
    Cancelled,
}

/// Runs one task end to end: session, routine, teardown, verdict.
#[derive(Clone)]
pub struct TaskExecutor {
    provisioner: SessionProvisioner,
    reaper: ResourceReaper,
    task_timeout: Option<Duration>,
    cleanup_policy: CleanupPolicy,
}

impl TaskExecutor {
    pub fn new(provisioner: SessionProvisioner) -> Self {
        install_panic_trace_hook();
        Self {
            provisioner,
            reaper: ResourceReaper::new(),
            task_timeout: None,
            cleanup_policy: CleanupPolicy::default(),
        }
    }

    pub fn task_timeout(mut self, task_timeout: Option<Duration>) -> Self {
        self.task_timeout = task_timeout;
        self
    }

    pub fn cleanup_policy(mut self, cleanup_policy: CleanupPolicy) -> Self {
        self.cleanup_policy = cleanup_policy;
        self
    }

    /// Never fails: every error on every path ends up inside the verdict.
    pub async fn execute(
        &self,
        task: TaskName,
        routine: Arc<dyn Routine>,
        cancellation: CancellationToken,
    ) -> Verdict {
        let span = tracing::info_span!("task", task = %task);
        self.execute_in_span(task, routine, cancellation)
            .instrument(span)
            .await
    }

    async fn execute_in_span(
        &self,
        task: TaskName,
        routine: Arc<dyn Routine>,
        cancellation: CancellationToken,
    ) -> Verdict {
        let started_at = SystemTime::now();
        let mut context = ExecutionContext::new(task.clone(), cancellation.clone());
        let mut failures = Vec::new();
        let mut attempts = 0;

        if cancellation.is_cancelled() {
            failures.push(TaskFailure::new(
                FailureKind::Cancelled,
                "run cancelled before the task started",
            ));
        } else {
            let provisioned = tokio::select! {
                outcome = self.provisioner.provision(&task) => Some(outcome),
                _ = cancellation.cancelled() => None,
            };

            match provisioned {
                None => failures.push(TaskFailure::new(
                    FailureKind::Cancelled,
                    "run cancelled while opening the session",
                )),
                Some(RetryOutcome {
                    result: Err(error),
                    attempts: used,
                }) => {
                    attempts = used;
                    tracing::error!(
                        attempts = used,
                        kind = ?error.kind,
                        message = %error.message,
                        "session setup failed"
                    );
                    failures.push(TaskFailure::new(
                        FailureKind::Setup,
                        format!(
                            "session setup failed after {used} attempt(s): {}",
                            error.message
                        ),
                    ));
                }
                Some(RetryOutcome {
                    result: Ok(session),
                    attempts: used,
                }) => {
                    attempts = used;
                    tracing::debug!(attempts = used, session = session.label(), "session ready");
                    context.attach_session(session);
                    failures.extend(self.run_routine(routine.as_ref(), &mut context).await);
                }
            }
        }

        let cleanup_errors = self.reaper.release(&mut context).await;

        let mut verdict = Verdict::from_failures(failures);
        if self.cleanup_policy == CleanupPolicy::Fail
            && verdict.status == VerdictStatus::Passed
            && !cleanup_errors.is_empty()
        {
            verdict.status = VerdictStatus::Failed;
        }
        verdict.cleanup_errors = cleanup_errors;
        verdict.attempts = attempts;
        verdict.started_at = Some(started_at);
        verdict.finished_at = Some(SystemTime::now());

        log_verdict(&verdict);
        verdict
    }

    async fn run_routine(
        &self,
        routine: &dyn Routine,
        context: &mut ExecutionContext,
    ) -> Vec<TaskFailure> {
        let cancellation = context.cancellation().clone();
        let task = context.task().clone();
        let guarded = AssertUnwindSafe(task_context::with_task(task, routine.run(context)))
            .catch_unwind()
            .map(|result| match result {
                Ok(result) => RoutineOutcome::Finished(result),
                Err(payload) => RoutineOutcome::Panicked {
                    message: panic_message(payload.as_ref()),
                    trace: take_panic_trace(),
                },
            });

        let outcome = match self.task_timeout {
            Some(limit) => tokio::select! {
                finished = tokio::time::timeout(limit, guarded) => {
                    finished.unwrap_or(RoutineOutcome::TimedOut(limit))
                }
                _ = cancellation.cancelled() => RoutineOutcome::Cancelled,
            },
            None => tokio::select! {
                finished = guarded => finished,
                _ = cancellation.cancelled() => RoutineOutcome::Cancelled,
            },
        };

        match outcome {
            RoutineOutcome::Finished(Ok(failed_checks)) => failed_checks
                .into_iter()
                .map(|message| TaskFailure::new(FailureKind::Assertion, message))
                .collect(),
            RoutineOutcome::Finished(Err(error)) => vec![
                TaskFailure::new(FailureKind::Infrastructure, error.message())
                    .with_trace(error.trace()),
            ],
            RoutineOutcome::Panicked { message, trace } => {
                let failure =
                    TaskFailure::new(FailureKind::Panic, format!("routine panicked: {message}"));
                vec![match trace {
                    Some(trace) => failure.with_trace(trace),
                    None => failure,
                }]
            }
            RoutineOutcome::TimedOut(limit) => vec![TaskFailure::new(
                FailureKind::Timeout,
                format!("routine exceeded its {}ms deadline", limit.as_millis()),
            )],
            RoutineOutcome::Cancelled => vec![TaskFailure::new(
                FailureKind::Cancelled,
                "run cancelled while the routine was running",
            )],
        }
    }
}

fn log_verdict(verdict: &Verdict) {
    let duration_ms = verdict
        .duration()
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0);

    match verdict.status {
        VerdictStatus::Passed if verdict.has_cleanup_errors() => tracing::warn!(
            duration_ms,
            cleanup_errors = verdict.cleanup_errors.len(),
            "task passed with cleanup errors"
        ),
        VerdictStatus::Passed => tracing::info!(duration_ms, "task passed"),
        VerdictStatus::Failed => tracing::error!(
            duration_ms,
            failures = verdict.failures.len(),
            cleanup_errors = verdict.cleanup_errors.len(),
            "task failed"
        ),
        VerdictStatus::Skipped => tracing::info!("task skipped"),
    }
}
