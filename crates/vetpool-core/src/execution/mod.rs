pub mod tokio_process;

pub use tokio_process::TokioProcessExecutor;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreErrorKind, CoreResult, TaskName};

pub type ProcessWaitFuture = Pin<Box<dyn Future<Output = CoreResult<ProcessOutput>> + Send>>;

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    pub fn validate(&self, task: &TaskName) -> CoreResult<()> {
        if self.program.as_os_str().is_empty() {
            return Err(invalid_input(task, "command program path must not be empty"));
        }

        if self.args.iter().any(|arg| arg.contains('\0')) {
            return Err(invalid_input(task, "command args must not contain NUL bytes"));
        }

        if self
            .env
            .iter()
            .any(|(key, value)| key.is_empty() || key.contains('\0') || value.contains('\0'))
        {
            return Err(invalid_input(
                task,
                "environment keys must be non-empty and keys and values must not contain NUL bytes",
            ));
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessSpawnRequest {
    pub task: TaskName,
    pub command: CommandSpec,
    pub timeout: Option<Duration>,
    pub requested_at: SystemTime,
}

impl ProcessSpawnRequest {
    pub fn new(task: TaskName, command: CommandSpec) -> Self {
        Self {
            task,
            command,
            timeout: None,
            requested_at: SystemTime::now(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> CoreResult<()> {
        self.command.validate(&self.task)?;

        if let Some(timeout) = self.timeout
            && timeout.is_zero()
        {
            return Err(invalid_input(
                &self.task,
                "timeout must be greater than zero when provided",
            ));
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessTerminationMode {
    Graceful { grace_period: Duration },
    Immediate,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessExitStatus {
    ExitCode(i32),
    Terminated,
}

impl ProcessExitStatus {
    pub fn success(self) -> bool {
        self == ProcessExitStatus::ExitCode(0)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessOutput {
    pub status: ProcessExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
}

impl ProcessOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

pub trait RunningProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    fn terminate(&self, mode: ProcessTerminationMode) -> CoreResult<()>;

    fn wait(self: Box<Self>) -> ProcessWaitFuture;
}

pub trait ProcessExecutor: Send + Sync {
    fn spawn(&self, request: ProcessSpawnRequest) -> CoreResult<Box<dyn RunningProcess>>;
}

pub fn spawn_validated(
    executor: &dyn ProcessExecutor,
    request: ProcessSpawnRequest,
) -> CoreResult<Box<dyn RunningProcess>> {
    request.validate()?;
    executor.spawn(request)
}

/// Spawns and waits in one step.
pub async fn run_to_completion(
    executor: &dyn ProcessExecutor,
    request: ProcessSpawnRequest,
) -> CoreResult<ProcessOutput> {
    spawn_validated(executor, request)?.wait().await
}

fn invalid_input(task: &TaskName, message: &str) -> CoreError {
    CoreError::for_task(task, CoreErrorKind::InvalidInput, message)
}
