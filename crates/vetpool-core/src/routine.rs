use std::backtrace::Backtrace;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::session::ExecutionContext;

/// `Ok(vec![])` passes, `Ok(failures)` reports failed checks, `Err` means the
/// routine could not finish its checks at all.
pub type RoutineResult = Result<Vec<String>, RoutineError>;

pub type RoutineFuture<'a> = Pin<Box<dyn Future<Output = RoutineResult> + Send + 'a>>;

#[derive(Debug, Error)]
#[error("{message}")]
pub struct RoutineError {
    message: String,
    trace: String,
}

impl RoutineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: Backtrace::force_capture().to_string(),
        }
    }

    /// Flattens the error and its `source()` chain into one message.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut message = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self::new(message)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn trace(&self) -> &str {
        &self.trace
    }
}

pub trait Routine: Send + Sync {
    fn run<'a>(&'a self, context: &'a mut ExecutionContext) -> RoutineFuture<'a>;
}

pub struct FnRoutine<F> {
    routine: F,
}

impl<F> Routine for FnRoutine<F>
where
    F: for<'a> Fn(&'a mut ExecutionContext) -> RoutineFuture<'a> + Send + Sync,
{
    fn run<'a>(&'a self, context: &'a mut ExecutionContext) -> RoutineFuture<'a> {
        (self.routine)(context)
    }
}

pub fn routine_fn<F>(routine: F) -> FnRoutine<F>
where
    F: for<'a> Fn(&'a mut ExecutionContext) -> RoutineFuture<'a> + Send + Sync,
{
    FnRoutine { routine }
}
