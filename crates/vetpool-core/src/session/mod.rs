pub mod reaper;
pub mod retry;

pub use reaper::ResourceReaper;
pub use retry::{
    Backoff, DEFAULT_BACKOFF_INITIAL, DEFAULT_BACKOFF_MAX, DEFAULT_MAX_ATTEMPTS, RetryOutcome,
    RetryPolicy,
};

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;

use crate::models::{CoreError, CoreErrorKind, CoreResult, TaskName};
use crate::orchestration::{CancellationToken, panic_message};

pub type SessionFuture<'a, T> = Pin<Box<dyn Future<Output = CoreResult<T>> + Send + 'a>>;

/// An authenticated, isolated interactive session owned by one task.
///
/// `close` may be called on the cleanup path after partial failures, so
/// implementations should treat an already-closed session as success.
pub trait Session: Send + Sync + 'static {
    fn label(&self) -> &str;

    /// Opaque credential handed to routines that shell out (cookie, token).
    fn token(&self) -> Option<&str> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn close(&mut self) -> SessionFuture<'_, ()>;
}

pub trait SessionFactory: Send + Sync {
    fn open<'a>(&'a self, task: &'a TaskName) -> SessionFuture<'a, Box<dyn Session>>;
}

/// Something a task provisioned for itself that must be torn down with it:
/// a scratch directory, a test user, a temporary storage policy.
pub trait ScratchResource: Send + Sync {
    fn label(&self) -> &str;

    fn release(self: Box<Self>) -> SessionFuture<'static, ()>;
}

/// Per-task resource bundle. Created by the executor, handed to exactly one
/// routine, drained by the [`ResourceReaper`].
pub struct ExecutionContext {
    task: TaskName,
    session: Option<Box<dyn Session>>,
    scratch: Vec<Box<dyn ScratchResource>>,
    cancellation: CancellationToken,
    released: bool,
}

impl ExecutionContext {
    pub fn new(task: TaskName, cancellation: CancellationToken) -> Self {
        Self {
            task,
            session: None,
            scratch: Vec::new(),
            cancellation,
            released: false,
        }
    }

    pub fn task(&self) -> &TaskName {
        &self.task
    }

    pub fn attach_session(&mut self, session: Box<dyn Session>) {
        self.session = Some(session);
    }

    pub fn session(&self) -> Option<&dyn Session> {
        self.session.as_deref()
    }

    pub fn session_as<T: Session>(&self) -> Option<&T> {
        self.session
            .as_deref()
            .and_then(|session| session.as_any().downcast_ref::<T>())
    }

    pub fn register_scratch(&mut self, resource: Box<dyn ScratchResource>) {
        tracing::debug!(task = %self.task, resource = resource.label(), "registered scratch resource");
        self.scratch.push(resource);
    }

    pub fn scratch_len(&self) -> usize {
        self.scratch.len()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub(crate) fn take_for_release(
        &mut self,
    ) -> Option<(Vec<Box<dyn ScratchResource>>, Option<Box<dyn Session>>)> {
        if self.released {
            return None;
        }
        self.released = true;
        Some((std::mem::take(&mut self.scratch), self.session.take()))
    }
}

/// Opens sessions through a factory under a retry policy.
#[derive(Clone)]
pub struct SessionProvisioner {
    factory: Arc<dyn SessionFactory>,
    retry: RetryPolicy,
}

impl SessionProvisioner {
    pub fn new(factory: Arc<dyn SessionFactory>, retry: RetryPolicy) -> Self {
        Self { factory, retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// A factory that panics counts as a failed attempt.
    pub async fn provision(&self, task: &TaskName) -> RetryOutcome<Box<dyn Session>> {
        let factory = &self.factory;
        self.retry
            .run(|attempt| async move {
                tracing::debug!(attempt, "opening session");
                match AssertUnwindSafe(async { factory.open(task).await })
                    .catch_unwind()
                    .await
                {
                    Ok(opened) => opened.map_err(|error| error.attribute(task)),
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        tracing::warn!(attempt, message = %message, "session factory panicked");
                        Err(CoreError::for_task(
                            task,
                            CoreErrorKind::SetupFailure,
                            format!("session setup panicked: {message}"),
                        ))
                    }
                }
            })
            .await
    }
}
