use thiserror::Error;

use crate::models::TaskName;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoreErrorKind {
    InvalidInput,
    InvalidConfig,
    SetupFailure,
    ProcessFailure,
    Timeout,
    Cancelled,
    StorageFailure,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub task: Option<TaskName>,
    pub kind: CoreErrorKind,
    pub message: String,
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            task: None,
            kind,
            message: message.into(),
        }
    }

    pub fn for_task(task: &TaskName, kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            task: Some(task.clone()),
            kind,
            message: message.into(),
        }
    }

    /// Errors worth another session attempt. Input, config and cancellation
    /// errors will fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind,
            CoreErrorKind::InvalidInput | CoreErrorKind::InvalidConfig | CoreErrorKind::Cancelled
        )
    }

    pub(crate) fn attribute(self, task: &TaskName) -> Self {
        Self {
            task: self.task.or_else(|| Some(task.clone())),
            kind: self.kind,
            message: self.message,
        }
    }
}
