use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::models::{CoreError, CoreErrorKind, CoreResult, RunReport, Verdict};
use crate::orchestration::{
    BoundedScheduler, CancellationToken, CleanupPolicy, DEFAULT_MAX_CONCURRENCY,
    MAX_CONCURRENCY, ResultAggregator, TaskExecutor,
};
use crate::registry::{ExclusionFilter, TaskRegistry};
use crate::session::{RetryPolicy, SessionFactory, SessionProvisioner};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HarnessOptions {
    pub max_concurrency: usize,
    pub exclusions: ExclusionFilter,
    pub task_timeout: Option<Duration>,
    pub cleanup_policy: CleanupPolicy,
    pub session_retry: RetryPolicy,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            exclusions: ExclusionFilter::default(),
            task_timeout: None,
            cleanup_policy: CleanupPolicy::default(),
            session_retry: RetryPolicy::default(),
        }
    }
}

impl HarnessOptions {
    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn exclusions(mut self, spec: &str) -> Self {
        self.exclusions = ExclusionFilter::parse(spec);
        self
    }

    pub fn task_timeout(mut self, task_timeout: Duration) -> Self {
        self.task_timeout = Some(task_timeout);
        self
    }

    pub fn cleanup_policy(mut self, cleanup_policy: CleanupPolicy) -> Self {
        self.cleanup_policy = cleanup_policy;
        self
    }

    pub fn session_retry(mut self, session_retry: RetryPolicy) -> Self {
        self.session_retry = session_retry;
        self
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.max_concurrency == 0 {
            return Err(CoreError::new(
                CoreErrorKind::InvalidConfig,
                "maximum concurrency must be at least 1",
            ));
        }
        if self.max_concurrency > MAX_CONCURRENCY {
            return Err(CoreError::new(
                CoreErrorKind::InvalidConfig,
                format!("maximum concurrency must not exceed {MAX_CONCURRENCY}"),
            ));
        }
        if let Some(timeout) = self.task_timeout
            && timeout.is_zero()
        {
            return Err(CoreError::new(
                CoreErrorKind::InvalidConfig,
                "task timeout must be greater than zero when provided",
            ));
        }
        self.session_retry.validate()
    }
}

/// Registry in, report out: filters exclusions, fans tasks out across the
/// bounded scheduler and collects exactly one verdict per registered task.
pub struct ValidationHarness {
    registry: TaskRegistry,
    factory: Arc<dyn SessionFactory>,
    options: HarnessOptions,
    cancellation: Mutex<CancellationToken>,
}

impl ValidationHarness {
    pub fn new(
        registry: TaskRegistry,
        factory: Arc<dyn SessionFactory>,
        options: HarnessOptions,
    ) -> CoreResult<Self> {
        options.validate()?;
        Ok(Self {
            registry,
            factory,
            options,
            cancellation: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn options(&self) -> &HarnessOptions {
        &self.options
    }

    /// Token of the current run, or of the next one when idle. Cancelling it
    /// fails tasks that have not finished yet; their resources are still
    /// released. Each finished run hands out a fresh token afterwards.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Only bookkeeping errors escape; task, setup and cleanup problems all
    /// land in the report.
    pub async fn run(&self) -> CoreResult<RunReport> {
        let cancellation = self.cancellation_token();
        let outcome = self.run_with(cancellation).await;
        *self
            .cancellation
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
        outcome
    }

    async fn run_with(&self, cancellation: CancellationToken) -> CoreResult<RunReport> {
        let partition = self.options.exclusions.partition(&self.registry);
        let aggregator = Arc::new(ResultAggregator::new(self.registry.names().cloned())?);

        tracing::info!(
            registered = self.registry.len(),
            to_run = partition.to_run.len(),
            skipped = partition.skipped.len(),
            max_concurrency = self.options.max_concurrency,
            "starting validation run"
        );

        for task in &partition.skipped {
            tracing::info!(task = %task.name, "skipping excluded task");
            aggregator.record(&task.name, Verdict::skipped())?;
        }

        let executor = Arc::new(
            TaskExecutor::new(SessionProvisioner::new(
                self.factory.clone(),
                self.options.session_retry,
            ))
            .task_timeout(self.options.task_timeout)
            .cleanup_policy(self.options.cleanup_policy),
        );

        let units = partition.to_run.into_iter().map(|task| {
            let aggregator = aggregator.clone();
            let executor = executor.clone();
            let cancellation = cancellation.clone();
            async move {
                aggregator.mark_running(&task.name)?;
                let verdict = executor
                    .execute(task.name.clone(), task.routine, cancellation)
                    .await;
                aggregator.record(&task.name, verdict)
            }
        });

        let scheduler = BoundedScheduler::new(self.options.max_concurrency)?;
        let outcome = scheduler.run_all(units).await?;
        for recorded in outcome.outputs {
            recorded?;
        }

        let report = aggregator.finalize()?;
        let counts = report.counts();
        tracing::info!(
            passed = counts.passed,
            failed = counts.failed,
            skipped = counts.skipped,
            overall_passed = report.overall_passed(),
            cleanup_errors = report.has_cleanup_errors(),
            elapsed_ms = report.elapsed().as_millis() as u64,
            "validation run finished"
        );

        Ok(report)
    }
}
