//! Run configuration.
//!
//! Values are layered: defaults, then the JSON file when one is given, then
//! `VETPOOL_*` environment variables. Command-line overrides are applied by
//! the binary on top of the result before [`HarnessConfig::validate`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::commands::{CommandRoutine, CommandSessionFactory};
use crate::execution::{CommandSpec, ProcessExecutor};
use crate::models::{CoreError, CoreErrorKind, CoreResult, ReportOptions, TaskName};
use crate::orchestration::{
    CleanupPolicy, DEFAULT_MAX_CONCURRENCY, HarnessOptions, MAX_CONCURRENCY,
};
use crate::registry::{ExclusionFilter, TaskRegistry};
use crate::session::{
    Backoff, DEFAULT_BACKOFF_INITIAL, DEFAULT_BACKOFF_MAX, DEFAULT_MAX_ATTEMPTS, RetryPolicy,
};

pub const ENV_MAXIMUM_THREADS: &str = "VETPOOL_MAXIMUM_THREADS";
pub const ENV_TASKS_TO_AVOID: &str = "VETPOOL_TASKS_TO_AVOID";
pub const ENV_TASK_TIMEOUT_SECS: &str = "VETPOOL_TASK_TIMEOUT_SECS";

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    pub maximum_threads: usize,
    /// Comma-separated, case-insensitive substrings of task names to skip.
    pub tasks_to_avoid: String,
    pub task_timeout_secs: Option<u64>,
    pub cleanup_policy: CleanupPolicy,
    pub session: SessionConfig,
    pub report: ReportOptions,
    pub history_db: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    /// Parent of the per-task scratch directories. Defaults to a `vetpool`
    /// directory under the system temp dir.
    pub scratch_root: Option<PathBuf>,
    pub tasks: Vec<TaskSpec>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            maximum_threads: DEFAULT_MAX_CONCURRENCY,
            tasks_to_avoid: String::new(),
            task_timeout_secs: None,
            cleanup_policy: CleanupPolicy::default(),
            session: SessionConfig::default(),
            report: ReportOptions::default(),
            history_db: None,
            log_file: None,
            scratch_root: None,
            tasks: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    None,
    Fixed,
    #[default]
    Exponential,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    /// Fixed delay, or the first delay of an exponential schedule.
    pub backoff_ms: u64,
    pub backoff_max_ms: u64,
    pub open: Option<CommandSpec>,
    pub close: Option<CommandSpec>,
    pub hook_timeout_secs: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffKind::default(),
            backoff_ms: duration_millis(DEFAULT_BACKOFF_INITIAL),
            backoff_max_ms: duration_millis(DEFAULT_BACKOFF_MAX),
            open: None,
            close: None,
            hook_timeout_secs: None,
        }
    }
}

impl SessionConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        let backoff = match self.backoff {
            BackoffKind::None => Backoff::None,
            BackoffKind::Fixed => Backoff::Fixed(Duration::from_millis(self.backoff_ms)),
            BackoffKind::Exponential => Backoff::Exponential {
                initial: Duration::from_millis(self.backoff_ms),
                max: Duration::from_millis(self.backoff_max_ms.max(self.backoff_ms)),
            },
        };
        RetryPolicy::new(self.max_attempts, backoff)
    }
}

/// A validator declared as a command line.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    pub name: String,
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Process-level deadline, separate from the harness-wide task timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl TaskSpec {
    pub fn command(&self) -> CommandSpec {
        CommandSpec {
            program: self.program.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            working_dir: self.working_dir.clone(),
        }
    }
}

impl HarnessConfig {
    /// Reads `path` when given, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let mut config = match path {
            Some(path) => {
                let config = Self::load_from_path(path)?;
                tracing::info!(path = %path.display(), tasks = config.tasks.len(), "loaded configuration");
                config
            }
            None => {
                tracing::debug!("no configuration file given, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> CoreResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|error| {
            invalid_config(format!(
                "failed to read configuration '{}': {error}",
                path.display()
            ))
        })?;
        Self::from_json(&contents).map_err(|error| {
            invalid_config(format!("{}: {}", path.display(), error.message))
        })
    }

    pub fn from_json(contents: &str) -> CoreResult<Self> {
        serde_json::from_str(contents)
            .map_err(|error| invalid_config(format!("invalid configuration: {error}")))
    }

    /// `lookup` returns the raw value of an environment variable. Blank
    /// values are ignored.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> CoreResult<()> {
        let value = |key: &str| lookup(key).filter(|raw| !raw.trim().is_empty());

        if let Some(raw) = value(ENV_MAXIMUM_THREADS) {
            self.maximum_threads = parse_env_number(ENV_MAXIMUM_THREADS, &raw)?;
            tracing::debug!(maximum_threads = self.maximum_threads, "environment override");
        }
        if let Some(raw) = lookup(ENV_TASKS_TO_AVOID) {
            tracing::debug!(tasks_to_avoid = %raw, "environment override");
            self.tasks_to_avoid = raw;
        }
        if let Some(raw) = value(ENV_TASK_TIMEOUT_SECS) {
            self.task_timeout_secs = Some(parse_env_number(ENV_TASK_TIMEOUT_SECS, &raw)?);
            tracing::debug!(task_timeout_secs = ?self.task_timeout_secs, "environment override");
        }
        Ok(())
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.maximum_threads == 0 {
            return Err(invalid_config("maximum_threads must be at least 1"));
        }
        if self.maximum_threads > MAX_CONCURRENCY {
            return Err(invalid_config(format!(
                "maximum_threads must not exceed {MAX_CONCURRENCY}"
            )));
        }
        if self.session.max_attempts == 0 {
            return Err(invalid_config("session.max_attempts must be at least 1"));
        }
        if self.task_timeout_secs == Some(0) {
            return Err(invalid_config("task_timeout_secs must be greater than zero"));
        }
        if self.session.hook_timeout_secs == Some(0) {
            return Err(invalid_config(
                "session.hook_timeout_secs must be greater than zero",
            ));
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if task.name.trim().is_empty() {
                return Err(invalid_config("task names must not be empty"));
            }
            if !seen.insert(task.name.as_str()) {
                return Err(invalid_config(format!(
                    "task '{}' is declared more than once",
                    task.name
                )));
            }
            if task.timeout_secs == Some(0) {
                return Err(invalid_config(format!(
                    "task '{}' has a zero timeout_secs",
                    task.name
                )));
            }
            task.command()
                .validate(&TaskName::new(task.name.as_str()))
                .map_err(|error| invalid_config(error.message))?;
        }

        for (hook, command) in [("open", &self.session.open), ("close", &self.session.close)] {
            if let Some(command) = command {
                command
                    .validate(&TaskName::new(format!("session.{hook}")))
                    .map_err(|error| invalid_config(error.message))?;
            }
        }

        Ok(())
    }

    pub fn harness_options(&self) -> HarnessOptions {
        HarnessOptions {
            max_concurrency: self.maximum_threads,
            exclusions: ExclusionFilter::parse(&self.tasks_to_avoid),
            task_timeout: self.task_timeout_secs.map(Duration::from_secs),
            cleanup_policy: self.cleanup_policy,
            session_retry: self.session.retry_policy(),
        }
    }

    /// Registers every declared task as a [`CommandRoutine`], in file order.
    pub fn build_registry(&self, executor: Arc<dyn ProcessExecutor>) -> CoreResult<TaskRegistry> {
        let mut registry = TaskRegistry::new();
        for task in &self.tasks {
            let mut routine = CommandRoutine::new(task.command(), executor.clone())
                .timeout(task.timeout_secs.map(Duration::from_secs));
            if let Some(root) = &self.scratch_root {
                routine = routine.scratch_root(root);
            }
            registry.register(task.name.as_str(), routine)?;
        }
        Ok(registry)
    }

    pub fn session_factory(&self, executor: Arc<dyn ProcessExecutor>) -> CommandSessionFactory {
        CommandSessionFactory::new(executor)
            .open_hook(self.session.open.clone())
            .close_hook(self.session.close.clone())
            .hook_timeout(self.session.hook_timeout_secs.map(Duration::from_secs))
    }
}

fn parse_env_number<T: std::str::FromStr>(key: &str, raw: &str) -> CoreResult<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| invalid_config(format!("{key} must be a non-negative integer, got '{raw}'")))
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn invalid_config(message: impl Into<String>) -> CoreError {
    CoreError::new(CoreErrorKind::InvalidConfig, message)
}
