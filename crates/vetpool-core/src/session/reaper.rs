use std::panic::AssertUnwindSafe;

use futures::FutureExt;

use crate::orchestration::panic_message;
use crate::session::ExecutionContext;

/// Releases everything an [`ExecutionContext`] holds. Never fails: problems
/// are logged and handed back as cleanup error lines.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResourceReaper;

impl ResourceReaper {
    pub fn new() -> Self {
        Self
    }

    /// Scratch resources go first, newest first, then the session. Calling
    /// this again on the same context is a logged no-op.
    pub async fn release(&self, context: &mut ExecutionContext) -> Vec<String> {
        let task = context.task().clone();
        let Some((scratch, session)) = context.take_for_release() else {
            tracing::debug!(task = %task, "resources already released");
            return Vec::new();
        };

        let mut cleanup_errors = Vec::new();

        for resource in scratch.into_iter().rev() {
            let label = resource.label().to_string();
            match AssertUnwindSafe(resource.release()).catch_unwind().await {
                Ok(Ok(())) => {
                    tracing::debug!(task = %task, resource = %label, "released scratch resource");
                }
                Ok(Err(error)) => {
                    tracing::warn!(
                        task = %task,
                        resource = %label,
                        kind = ?error.kind,
                        message = %error.message,
                        "failed to release scratch resource"
                    );
                    cleanup_errors.push(format!("{label}: {}", error.message));
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::warn!(task = %task, resource = %label, message = %message, "scratch release panicked");
                    cleanup_errors.push(format!("{label}: release panicked: {message}"));
                }
            }
        }

        match session {
            Some(mut session) => {
                let label = session.label().to_string();
                let closed = AssertUnwindSafe(session.close()).catch_unwind().await;
                match closed {
                    Ok(Ok(())) => {
                        tracing::debug!(task = %task, session = %label, "closed session");
                    }
                    Ok(Err(error)) => {
                        tracing::warn!(
                            task = %task,
                            session = %label,
                            kind = ?error.kind,
                            message = %error.message,
                            "failed to close session"
                        );
                        cleanup_errors.push(format!("session {label}: {}", error.message));
                    }
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        tracing::warn!(task = %task, session = %label, message = %message, "session close panicked");
                        cleanup_errors.push(format!("session {label}: close panicked: {message}"));
                    }
                }
            }
            None => {
                tracing::debug!(task = %task, "no session to close");
            }
        }

        cleanup_errors
    }
}
