use std::future::Future;

use crate::models::TaskName;

tokio::task_local! {
    static CURRENT_TASK: TaskName;
}

/// Name of the task whose routine is currently being polled, if any. Lets
/// helpers deep inside a routine tag their own output without threading the
/// context through.
pub fn current_task() -> Option<TaskName> {
    CURRENT_TASK.try_with(|task| task.clone()).ok()
}

pub(crate) async fn with_task<F: Future>(task: TaskName, operation: F) -> F::Output {
    CURRENT_TASK.scope(task, operation).await
}
