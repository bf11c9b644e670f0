//! Validators and sessions backed by external commands, so a run can be
//! declared entirely in configuration.
//!
//! Every spawned command sees `VETPOOL_TASK`; routines additionally get
//! `VETPOOL_SCRATCH_DIR`, and `VETPOOL_SESSION` when the open hook printed a
//! token.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::execution::{
    CommandSpec, ProcessExecutor, ProcessExitStatus, ProcessOutput, ProcessSpawnRequest,
    run_to_completion,
};
use crate::models::{CoreError, CoreErrorKind, CoreResult, TaskName};
use crate::routine::{Routine, RoutineError, RoutineFuture};
use crate::session::{ExecutionContext, ScratchResource, Session, SessionFactory, SessionFuture};

pub const TASK_ENV: &str = "VETPOOL_TASK";
pub const SESSION_ENV: &str = "VETPOOL_SESSION";
pub const SCRATCH_DIR_ENV: &str = "VETPOOL_SCRATCH_DIR";

const MAX_STDERR_LINES: usize = 20;

pub struct CommandRoutine {
    command: CommandSpec,
    timeout: Option<Duration>,
    scratch_root: PathBuf,
    executor: Arc<dyn ProcessExecutor>,
}

impl CommandRoutine {
    pub fn new(command: CommandSpec, executor: Arc<dyn ProcessExecutor>) -> Self {
        Self {
            command,
            timeout: None,
            scratch_root: std::env::temp_dir().join("vetpool"),
            executor,
        }
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn scratch_root(mut self, scratch_root: impl Into<PathBuf>) -> Self {
        self.scratch_root = scratch_root.into();
        self
    }

    async fn run_command(&self, context: &mut ExecutionContext) -> Result<Vec<String>, RoutineError> {
        let task = context.task().clone();
        let scratch = ScratchDir::create(&self.scratch_root, &task)
            .await
            .map_err(|error| RoutineError::new(error.message))?;
        let scratch_path = scratch.path().to_path_buf();
        context.register_scratch(Box::new(scratch));

        let mut command = self
            .command
            .clone()
            .env(TASK_ENV, task.as_str())
            .env(SCRATCH_DIR_ENV, scratch_path.to_string_lossy());
        if let Some(token) = context.session().and_then(|session| session.token()) {
            command = command.env(SESSION_ENV, token);
        }
        if command.working_dir.is_none() {
            command = command.working_dir(&scratch_path);
        }

        let mut request = ProcessSpawnRequest::new(task, command);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let output = run_to_completion(self.executor.as_ref(), request)
            .await
            .map_err(|error| RoutineError::new(error.message))?;

        Ok(failed_checks(&output))
    }
}

impl Routine for CommandRoutine {
    fn run<'a>(&'a self, context: &'a mut ExecutionContext) -> RoutineFuture<'a> {
        Box::pin(self.run_command(context))
    }
}

/// Exit 0 means no failed checks; otherwise the exit status followed by the
/// tail of stderr.
pub fn failed_checks(output: &ProcessOutput) -> Vec<String> {
    if output.status.success() {
        return Vec::new();
    }

    let mut checks = vec![describe_status(output.status)];
    checks.extend(stderr_tail(output));
    checks
}

fn describe_status(status: ProcessExitStatus) -> String {
    match status {
        ProcessExitStatus::ExitCode(code) => format!("exit status {code}"),
        ProcessExitStatus::Terminated => "terminated by signal".to_string(),
    }
}

fn stderr_tail(output: &ProcessOutput) -> Vec<String> {
    let stderr = output.stderr_text();
    let lines: Vec<String> = stderr
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect();
    let skip = lines.len().saturating_sub(MAX_STDERR_LINES);
    lines.into_iter().skip(skip).collect()
}

/// Session whose login and logout are external commands. Either hook may be
/// absent, in which case that step is a no-op.
pub struct CommandSessionFactory {
    open: Option<CommandSpec>,
    close: Option<CommandSpec>,
    hook_timeout: Option<Duration>,
    executor: Arc<dyn ProcessExecutor>,
}

impl CommandSessionFactory {
    pub fn new(executor: Arc<dyn ProcessExecutor>) -> Self {
        Self {
            open: None,
            close: None,
            hook_timeout: None,
            executor,
        }
    }

    pub fn open_hook(mut self, command: Option<CommandSpec>) -> Self {
        self.open = command;
        self
    }

    pub fn close_hook(mut self, command: Option<CommandSpec>) -> Self {
        self.close = command;
        self
    }

    pub fn hook_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.hook_timeout = timeout;
        self
    }

    async fn open_session(&self, task: &TaskName) -> CoreResult<Box<dyn Session>> {
        let token = match &self.open {
            Some(command) => {
                let request = hook_request(
                    task,
                    command.clone().env(TASK_ENV, task.as_str()),
                    self.hook_timeout,
                );
                let output = run_to_completion(self.executor.as_ref(), request)
                    .await
                    .map_err(|error| {
                        CoreError::for_task(
                            task,
                            CoreErrorKind::SetupFailure,
                            format!("open hook failed: {}", error.message),
                        )
                    })?;

                if !output.status.success() {
                    return Err(CoreError::for_task(
                        task,
                        CoreErrorKind::SetupFailure,
                        hook_failure_message("open hook", &output),
                    ));
                }

                let token = output.stdout_text().trim().to_string();
                (!token.is_empty()).then_some(token)
            }
            None => None,
        };

        Ok(Box::new(CommandSession {
            task: task.clone(),
            label: format!("command-session:{task}"),
            token,
            close: self.close.clone(),
            hook_timeout: self.hook_timeout,
            executor: self.executor.clone(),
            closed: false,
        }))
    }
}

impl SessionFactory for CommandSessionFactory {
    fn open<'a>(&'a self, task: &'a TaskName) -> SessionFuture<'a, Box<dyn Session>> {
        Box::pin(self.open_session(task))
    }
}

pub struct CommandSession {
    task: TaskName,
    label: String,
    token: Option<String>,
    close: Option<CommandSpec>,
    hook_timeout: Option<Duration>,
    executor: Arc<dyn ProcessExecutor>,
    closed: bool,
}

impl CommandSession {
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close_session(&mut self) -> CoreResult<()> {
        if self.closed {
            tracing::debug!(session = %self.label, "session already closed");
            return Ok(());
        }
        self.closed = true;

        let Some(command) = &self.close else {
            return Ok(());
        };

        let mut command = command.clone().env(TASK_ENV, self.task.as_str());
        if let Some(token) = &self.token {
            command = command.env(SESSION_ENV, token.as_str());
        }

        let output = run_to_completion(
            self.executor.as_ref(),
            hook_request(&self.task, command, self.hook_timeout),
        )
        .await?;

        if !output.status.success() {
            return Err(CoreError::for_task(
                &self.task,
                CoreErrorKind::ProcessFailure,
                hook_failure_message("close hook", &output),
            ));
        }
        Ok(())
    }
}

impl Session for CommandSession {
    fn label(&self) -> &str {
        &self.label
    }

    fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn close(&mut self) -> SessionFuture<'_, ()> {
        Box::pin(self.close_session())
    }
}

fn hook_request(task: &TaskName, command: CommandSpec, timeout: Option<Duration>) -> ProcessSpawnRequest {
    let request = ProcessSpawnRequest::new(task.clone(), command);
    match timeout {
        Some(timeout) => request.timeout(timeout),
        None => request,
    }
}

fn hook_failure_message(hook: &str, output: &ProcessOutput) -> String {
    let mut message = format!("{hook} {}", describe_status(output.status));
    if let Some(last) = stderr_tail(output).last() {
        message.push_str(": ");
        message.push_str(last);
    }
    message
}

/// Per-task working directory, removed with the task.
pub struct ScratchDir {
    path: PathBuf,
    label: String,
}

impl ScratchDir {
    pub async fn create(root: &Path, task: &TaskName) -> CoreResult<Self> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or(0);
        let path = root.join(format!(
            "{}-{}-{nanos}",
            sanitize(task.as_str()),
            std::process::id()
        ));

        tokio::fs::create_dir_all(&path).await.map_err(|error| {
            CoreError::for_task(
                task,
                CoreErrorKind::SetupFailure,
                format!("failed to create scratch dir '{}': {error}", path.display()),
            )
        })?;

        Ok(Self {
            label: format!("scratch-dir:{}", path.display()),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScratchResource for ScratchDir {
    fn label(&self) -> &str {
        &self.label
    }

    fn release(self: Box<Self>) -> SessionFuture<'static, ()> {
        Box::pin(async move {
            match tokio::fs::remove_dir_all(&self.path).await {
                Ok(()) => Ok(()),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(path = %self.path.display(), "scratch dir already gone");
                    Ok(())
                }
                Err(error) => Err(CoreError::new(
                    CoreErrorKind::StorageFailure,
                    format!("failed to remove '{}': {error}", self.path.display()),
                )),
            }
        })
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
