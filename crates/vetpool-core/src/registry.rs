use std::collections::HashSet;
use std::sync::Arc;

use crate::models::{CoreError, CoreErrorKind, CoreResult, TaskName};
use crate::routine::Routine;

#[derive(Clone)]
pub struct RegisteredTask {
    pub name: TaskName,
    pub routine: Arc<dyn Routine>,
}

/// Explicit, ordered set of named routines for one run.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Vec<RegisteredTask>,
    names: HashSet<TaskName>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<TaskName>,
        routine: impl Routine + 'static,
    ) -> CoreResult<()> {
        self.register_shared(name, Arc::new(routine))
    }

    pub fn register_shared(
        &mut self,
        name: impl Into<TaskName>,
        routine: Arc<dyn Routine>,
    ) -> CoreResult<()> {
        let name = name.into();
        if name.as_str().trim().is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "task names must not be empty",
            ));
        }
        if !self.names.insert(name.clone()) {
            return Err(CoreError::for_task(
                &name,
                CoreErrorKind::InvalidInput,
                format!("duplicate task registration for '{name}'"),
            ));
        }

        self.tasks.push(RegisteredTask { name, routine });
        Ok(())
    }

    pub fn tasks(&self) -> &[RegisteredTask] {
        &self.tasks
    }

    pub fn names(&self) -> impl Iterator<Item = &TaskName> {
        self.tasks.iter().map(|task| &task.name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Case-insensitive substring exclusions, parsed from a comma-separated list
/// such as `"tile_alerts, Jobs"`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExclusionFilter {
    tokens: Vec<String>,
}

impl ExclusionFilter {
    pub fn parse(spec: &str) -> Self {
        Self {
            tokens: spec
                .split(',')
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(str::to_lowercase)
                .collect(),
        }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn excludes(&self, name: &str) -> bool {
        if self.tokens.is_empty() {
            return false;
        }
        let lowered = name.to_lowercase();
        self.tokens.iter().any(|token| lowered.contains(token.as_str()))
    }

    /// Splits the registry into tasks to run and tasks to report as skipped.
    /// Both halves keep registration order.
    pub fn partition(&self, registry: &TaskRegistry) -> TaskPartition {
        let (skipped, to_run) = registry
            .tasks()
            .iter()
            .cloned()
            .partition(|task| self.excludes(task.name.as_str()));

        TaskPartition { to_run, skipped }
    }
}

pub struct TaskPartition {
    pub to_run: Vec<RegisteredTask>,
    pub skipped: Vec<RegisteredTask>,
}
