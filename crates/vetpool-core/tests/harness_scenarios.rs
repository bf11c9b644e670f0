use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vetpool_core::models::{
    CoreError, CoreErrorKind, FailureKind, ReportOptions, RunReport, TaskName, VerdictStatus,
};
use vetpool_core::orchestration::{CleanupPolicy, HarnessOptions, ValidationHarness};
use vetpool_core::registry::TaskRegistry;
use vetpool_core::routine::{Routine, RoutineError, RoutineFuture};
use vetpool_core::session::{
    Backoff, ExecutionContext, RetryPolicy, ScratchResource, Session, SessionFactory,
    SessionFuture,
};
use vetpool_core::task_context::current_task;

#[derive(Default)]
struct FakeFactory {
    leading_open_failures: HashMap<String, usize>,
    failing_close: HashSet<String>,
    open_attempts: Mutex<HashMap<String, usize>>,
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
}

impl FakeFactory {
    fn failing_open(mut self, task: &str, times: usize) -> Self {
        self.leading_open_failures.insert(task.to_string(), times);
        self
    }

    fn failing_close(mut self, task: &str) -> Self {
        self.failing_close.insert(task.to_string());
        self
    }

    fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl SessionFactory for FakeFactory {
    fn open<'a>(&'a self, task: &'a TaskName) -> SessionFuture<'a, Box<dyn Session>> {
        Box::pin(async move {
            let attempt = {
                let mut attempts = self.open_attempts.lock().unwrap();
                let entry = attempts.entry(task.to_string()).or_insert(0);
                *entry += 1;
                *entry
            };
            let failures = self
                .leading_open_failures
                .get(task.as_str())
                .copied()
                .unwrap_or(0);
            if attempt <= failures {
                return Err(CoreError::new(
                    CoreErrorKind::SetupFailure,
                    "login page did not load",
                ));
            }

            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeSession {
                label: format!("fake:{task}"),
                fail_close: self.failing_close.contains(task.as_str()),
                closed: self.closed.clone(),
            }) as Box<dyn Session>)
        })
    }
}

struct FakeSession {
    label: String,
    fail_close: bool,
    closed: Arc<AtomicUsize>,
}

impl Session for FakeSession {
    fn label(&self) -> &str {
        &self.label
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn close(&mut self) -> SessionFuture<'_, ()> {
        Box::pin(async move {
            self.closed.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                return Err(CoreError::new(
                    CoreErrorKind::ProcessFailure,
                    "logout button missing",
                ));
            }
            Ok(())
        })
    }
}

/// Panics inside `open` before any future is built.
#[derive(Default)]
struct PanickingFactory {
    attempts: AtomicUsize,
}

fn unreadable_driver_config<'a>() -> SessionFuture<'a, Box<dyn Session>> {
    panic!("chromedriver config unreadable")
}

impl SessionFactory for PanickingFactory {
    fn open<'a>(&'a self, _task: &'a TaskName) -> SessionFuture<'a, Box<dyn Session>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        unreadable_driver_config()
    }
}

/// Returns the given failed checks after an optional pause.
struct Checks {
    failed: Vec<&'static str>,
    delay: Duration,
}

fn passing() -> Checks {
    Checks {
        failed: Vec::new(),
        delay: Duration::ZERO,
    }
}

fn failing(failed: Vec<&'static str>) -> Checks {
    Checks {
        failed,
        delay: Duration::ZERO,
    }
}

impl Routine for Checks {
    fn run<'a>(&'a self, _context: &'a mut ExecutionContext) -> RoutineFuture<'a> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.failed.iter().map(|check| check.to_string()).collect())
        })
    }
}

struct Raises(&'static str);

impl Routine for Raises {
    fn run<'a>(&'a self, _context: &'a mut ExecutionContext) -> RoutineFuture<'a> {
        Box::pin(async move { Err(RoutineError::new(self.0)) })
    }
}

struct Panics;

fn explode() -> Result<Vec<String>, RoutineError> {
    panic!("tile selector exploded")
}

impl Routine for Panics {
    fn run<'a>(&'a self, _context: &'a mut ExecutionContext) -> RoutineFuture<'a> {
        Box::pin(async move { explode() })
    }
}

struct Flagged(Arc<AtomicBool>);

impl Routine for Flagged {
    fn run<'a>(&'a self, _context: &'a mut ExecutionContext) -> RoutineFuture<'a> {
        Box::pin(async move {
            self.0.store(true, Ordering::SeqCst);
            Ok(Vec::new())
        })
    }
}

struct Tracked {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    delay: Duration,
}

impl Routine for Tracked {
    fn run<'a>(&'a self, _context: &'a mut ExecutionContext) -> RoutineFuture<'a> {
        Box::pin(async move {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(Vec::new())
        })
    }
}

/// Checks that the routine sees its own task and an open session.
struct Introspects;

impl Routine for Introspects {
    fn run<'a>(&'a self, context: &'a mut ExecutionContext) -> RoutineFuture<'a> {
        Box::pin(async move {
            let mut failed = Vec::new();
            if current_task().as_ref() != Some(context.task()) {
                failed.push("task context does not match".to_string());
            }
            if context.session_as::<FakeSession>().is_none() {
                failed.push("no fake session attached".to_string());
            }
            Ok(failed)
        })
    }
}

struct LeakyScratch;

impl ScratchResource for LeakyScratch {
    fn label(&self) -> &str {
        "temp-user"
    }

    fn release(self: Box<Self>) -> SessionFuture<'static, ()> {
        Box::pin(async { Err(CoreError::new(CoreErrorKind::ProcessFailure, "user is locked")) })
    }
}

struct RegistersScratch;

impl Routine for RegistersScratch {
    fn run<'a>(&'a self, context: &'a mut ExecutionContext) -> RoutineFuture<'a> {
        Box::pin(async move {
            context.register_scratch(Box::new(LeakyScratch));
            Ok(Vec::new())
        })
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Backoff::None)
}

async fn run(
    registry: TaskRegistry,
    factory: Arc<FakeFactory>,
    options: HarnessOptions,
) -> RunReport {
    ValidationHarness::new(registry, factory, options)
        .expect("options should be valid")
        .run()
        .await
        .expect("run should produce a report")
}

fn status(report: &RunReport, task: &str) -> VerdictStatus {
    report.get(task).expect("task must be in report").status
}

#[tokio::test]
async fn mixed_outcomes_with_exclusion() {
    let mut registry = TaskRegistry::new();
    registry.register("A", passing()).unwrap();
    registry.register("B", Raises("x")).unwrap();
    registry.register("C", passing()).unwrap();

    let report = run(
        registry,
        Arc::new(FakeFactory::default()),
        HarnessOptions::default()
            .max_concurrency(2)
            .exclusions("C")
            .session_retry(fast_retry(5)),
    )
    .await;

    let names: Vec<&str> = report.task_names().map(TaskName::as_str).collect();
    assert_eq!(names, vec!["A", "B", "C"]);
    assert_eq!(status(&report, "A"), VerdictStatus::Passed);
    assert_eq!(status(&report, "B"), VerdictStatus::Failed);
    assert_eq!(status(&report, "C"), VerdictStatus::Skipped);

    let b = report.get("B").unwrap();
    assert_eq!(b.failures[0].kind, FailureKind::Infrastructure);
    assert_eq!(b.failures[0].message, "x");
    assert!(b.error_strings().iter().any(|line| line == "x"));
    assert!(!report.overall_passed());

    let summary = report.summary(&ReportOptions::default());
    assert_eq!(summary["A"], "PASSED");
    assert_eq!(summary["C"], "SKIPPED");
    assert_eq!(summary["B"]["status"], "FAILED");
    assert_eq!(summary["B"]["errors"][0], "x");
}

#[tokio::test]
async fn skipped_tasks_do_not_fail_the_run() {
    let mut registry = TaskRegistry::new();
    registry.register("tile_health", passing()).unwrap();
    registry.register("tile_alerts", failing(vec!["never runs"])).unwrap();

    let factory = Arc::new(FakeFactory::default());
    let report = run(
        registry,
        factory.clone(),
        HarnessOptions::default().exclusions("ALERTS"),
    )
    .await;

    assert!(report.overall_passed());
    assert_eq!(status(&report, "tile_alerts"), VerdictStatus::Skipped);
    assert_eq!(factory.opened(), 1);
}

#[tokio::test]
async fn sequential_run_passes_every_task() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut registry = TaskRegistry::new();
    for index in 0..5 {
        registry
            .register(
                format!("task_{index}"),
                Tracked {
                    current: current.clone(),
                    peak: peak.clone(),
                    delay: Duration::from_millis(40),
                },
            )
            .unwrap();
    }

    let started = Instant::now();
    let report = run(
        registry,
        Arc::new(FakeFactory::default()),
        HarnessOptions::default().max_concurrency(1),
    )
    .await;

    assert_eq!(report.len(), 5);
    assert_eq!(report.counts().passed, 5);
    assert!(report.overall_passed());
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn concurrency_never_exceeds_the_bound() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut registry = TaskRegistry::new();
    for index in 0..12 {
        registry
            .register(
                format!("task_{index}"),
                Tracked {
                    current: current.clone(),
                    peak: peak.clone(),
                    delay: Duration::from_millis(30),
                },
            )
            .unwrap();
    }

    let report = run(
        registry,
        Arc::new(FakeFactory::default()),
        HarnessOptions::default().max_concurrency(3),
    )
    .await;

    assert_eq!(report.counts().passed, 12);
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {peak} exceeded bound");
    assert!(peak >= 2, "tasks never overlapped");
}

#[tokio::test]
async fn concurrency_level_does_not_change_verdicts() {
    fn registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register("ok_1", passing()).unwrap();
        registry.register("checks", failing(vec!["sla below target", "chart empty"])).unwrap();
        registry.register("broken", Raises("dashboard unreachable")).unwrap();
        registry.register("ok_2", passing()).unwrap();
        registry.register("excluded_tile", passing()).unwrap();
        registry.register("login_fails", passing()).unwrap();
        registry
    }

    fn factory() -> Arc<FakeFactory> {
        Arc::new(FakeFactory::default().failing_open("login_fails", usize::MAX))
    }

    let mut outcomes = Vec::new();
    for concurrency in [1, 2, 8, 6] {
        let report = run(
            registry(),
            factory(),
            HarnessOptions::default()
                .max_concurrency(concurrency)
                .exclusions("excluded")
                .session_retry(fast_retry(2)),
        )
        .await;

        let outcome: Vec<(String, VerdictStatus, Vec<(FailureKind, String)>)> = report
            .entries
            .iter()
            .map(|entry| {
                (
                    entry.task.to_string(),
                    entry.verdict.status,
                    entry
                        .verdict
                        .failures
                        .iter()
                        .map(|failure| (failure.kind, failure.message.clone()))
                        .collect(),
                )
            })
            .collect();
        outcomes.push(outcome);
    }

    assert_eq!(outcomes[0].len(), 6);
    for outcome in &outcomes[1..] {
        assert_eq!(outcome, &outcomes[0]);
    }
}

#[tokio::test]
async fn failed_checks_are_assertion_failures() {
    let mut registry = TaskRegistry::new();
    registry
        .register("jobs_tile", failing(vec!["expected 3 jobs, saw 2"]))
        .unwrap();

    let report = run(registry, Arc::new(FakeFactory::default()), HarnessOptions::default()).await;

    let verdict = report.get("jobs_tile").unwrap();
    assert_eq!(verdict.status, VerdictStatus::Failed);
    assert_eq!(verdict.failures.len(), 1);
    assert_eq!(verdict.failures[0].kind, FailureKind::Assertion);
    assert_eq!(verdict.failures[0].message, "expected 3 jobs, saw 2");
}

#[tokio::test]
async fn setup_failure_never_invokes_the_routine() {
    let invoked = Arc::new(AtomicBool::new(false));
    let mut registry = TaskRegistry::new();
    registry
        .register("needs_login", Flagged(invoked.clone()))
        .unwrap();

    let factory = Arc::new(FakeFactory::default().failing_open("needs_login", usize::MAX));
    let report = run(
        registry,
        factory.clone(),
        HarnessOptions::default().session_retry(fast_retry(5)),
    )
    .await;

    let verdict = report.get("needs_login").unwrap();
    assert_eq!(verdict.status, VerdictStatus::Failed);
    assert_eq!(verdict.failures[0].kind, FailureKind::Setup);
    assert!(verdict.failures[0].message.contains("after 5 attempt(s)"));
    assert_eq!(verdict.attempts, 5);
    assert!(!invoked.load(Ordering::SeqCst));
    assert_eq!(factory.opened(), 0);
}

#[tokio::test]
async fn panicking_session_factory_is_a_setup_failure() {
    let invoked = Arc::new(AtomicBool::new(false));
    let mut registry = TaskRegistry::new();
    registry
        .register("driver_broken", Flagged(invoked.clone()))
        .unwrap();
    registry.register("excluded_tile", passing()).unwrap();

    let factory = Arc::new(PanickingFactory::default());
    let report = ValidationHarness::new(
        registry,
        factory.clone(),
        HarnessOptions::default()
            .session_retry(fast_retry(3))
            .exclusions("excluded"),
    )
    .unwrap()
    .run()
    .await
    .unwrap();

    let verdict = report.get("driver_broken").unwrap();
    assert_eq!(verdict.status, VerdictStatus::Failed);
    assert_eq!(verdict.failures.len(), 1);
    assert_eq!(verdict.failures[0].kind, FailureKind::Setup);
    assert!(verdict.failures[0].message.contains("session setup panicked"));
    assert!(verdict.failures[0].message.contains("chromedriver config unreadable"));
    assert_eq!(verdict.attempts, 3);
    assert_eq!(factory.attempts.load(Ordering::SeqCst), 3);
    assert!(!invoked.load(Ordering::SeqCst));
    assert_eq!(status(&report, "excluded_tile"), VerdictStatus::Skipped);
}

#[tokio::test]
async fn flaky_session_setup_is_retried() {
    let mut registry = TaskRegistry::new();
    registry.register("flaky_login", Introspects).unwrap();

    let factory = Arc::new(FakeFactory::default().failing_open("flaky_login", 2));
    let report = run(
        registry,
        factory.clone(),
        HarnessOptions::default().session_retry(fast_retry(5)),
    )
    .await;

    let verdict = report.get("flaky_login").unwrap();
    assert_eq!(verdict.status, VerdictStatus::Passed, "{:?}", verdict.failures);
    assert_eq!(verdict.attempts, 3);
    assert_eq!(factory.opened(), 1);
    assert_eq!(factory.closed(), 1);
}

#[tokio::test]
async fn cleanup_error_is_reported_separately_by_default() {
    let mut registry = TaskRegistry::new();
    registry.register("logout_breaks", passing()).unwrap();
    registry.register("scratch_leaks", RegistersScratch).unwrap();

    let report = run(
        registry,
        Arc::new(FakeFactory::default().failing_close("logout_breaks")),
        HarnessOptions::default(),
    )
    .await;

    let logout = report.get("logout_breaks").unwrap();
    assert_eq!(logout.status, VerdictStatus::Passed);
    assert!(logout.failures.is_empty());
    assert_eq!(logout.cleanup_errors.len(), 1);
    assert!(logout.cleanup_errors[0].contains("logout button missing"));

    let scratch = report.get("scratch_leaks").unwrap();
    assert_eq!(scratch.status, VerdictStatus::Passed);
    assert_eq!(scratch.cleanup_errors, vec!["temp-user: user is locked".to_string()]);

    assert!(report.overall_passed());
    assert!(report.has_cleanup_errors());

    let summary = report.summary(&ReportOptions::default());
    assert_eq!(summary["logout_breaks"]["status"], "PASSED");
    assert!(summary["logout_breaks"]["cleanup_errors"][0].is_string());
}

#[tokio::test]
async fn fail_policy_turns_cleanup_errors_into_failures() {
    let mut registry = TaskRegistry::new();
    registry.register("logout_breaks", passing()).unwrap();
    registry.register("clean", passing()).unwrap();

    let report = run(
        registry,
        Arc::new(FakeFactory::default().failing_close("logout_breaks")),
        HarnessOptions::default().cleanup_policy(CleanupPolicy::Fail),
    )
    .await;

    assert_eq!(status(&report, "logout_breaks"), VerdictStatus::Failed);
    assert_eq!(status(&report, "clean"), VerdictStatus::Passed);
    assert!(!report.overall_passed());
}

#[tokio::test]
async fn panicking_routine_fails_and_still_cleans_up() {
    let mut registry = TaskRegistry::new();
    registry.register("explodes", Panics).unwrap();
    registry.register("neighbour", passing()).unwrap();

    let factory = Arc::new(FakeFactory::default());
    let report = run(registry, factory.clone(), HarnessOptions::default()).await;

    let verdict = report.get("explodes").unwrap();
    assert_eq!(verdict.status, VerdictStatus::Failed);
    assert_eq!(verdict.failures[0].kind, FailureKind::Panic);
    assert!(verdict.failures[0].message.contains("tile selector exploded"));
    let trace = verdict.failures[0].trace.as_deref().unwrap_or_default();
    assert!(!trace.trim().is_empty(), "panic failure should carry a backtrace");
    assert!(verdict.error_strings().iter().any(|line| line == trace));
    assert_eq!(status(&report, "neighbour"), VerdictStatus::Passed);
    assert_eq!(factory.closed(), 2);
}

#[tokio::test]
async fn timed_out_routine_fails_and_still_cleans_up() {
    let mut registry = TaskRegistry::new();
    registry
        .register(
            "hangs",
            Checks {
                failed: Vec::new(),
                delay: Duration::from_secs(30),
            },
        )
        .unwrap();

    let factory = Arc::new(FakeFactory::default());
    let started = Instant::now();
    let report = run(
        registry,
        factory.clone(),
        HarnessOptions::default().task_timeout(Duration::from_millis(100)),
    )
    .await;

    assert!(started.elapsed() < Duration::from_secs(10));
    let verdict = report.get("hangs").unwrap();
    assert_eq!(verdict.status, VerdictStatus::Failed);
    assert_eq!(verdict.failures[0].kind, FailureKind::Timeout);
    assert_eq!(factory.closed(), 1);
}

#[tokio::test]
async fn cancellation_fails_running_and_pending_tasks() {
    let mut registry = TaskRegistry::new();
    registry
        .register(
            "long_running",
            Checks {
                failed: Vec::new(),
                delay: Duration::from_secs(30),
            },
        )
        .unwrap();
    registry.register("pending", passing()).unwrap();

    let factory = Arc::new(FakeFactory::default());
    let harness = ValidationHarness::new(
        registry,
        factory.clone(),
        HarnessOptions::default().max_concurrency(1),
    )
    .unwrap();

    let token = harness.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let report = harness.run().await.unwrap();

    assert_eq!(report.len(), 2);
    for task in ["long_running", "pending"] {
        let verdict = report.get(task).unwrap();
        assert_eq!(verdict.status, VerdictStatus::Failed, "{task}");
        assert!(verdict.has_failure_kind(FailureKind::Cancelled), "{task}");
    }
    assert_eq!(factory.opened(), 1);
    assert_eq!(factory.closed(), 1);
}

#[tokio::test]
async fn cancelled_run_does_not_poison_the_next_one() {
    let mut registry = TaskRegistry::new();
    registry.register("health_tile", passing()).unwrap();

    let factory = Arc::new(FakeFactory::default());
    let harness =
        ValidationHarness::new(registry, factory.clone(), HarnessOptions::default()).unwrap();

    let first_token = harness.cancellation_token();
    first_token.cancel();
    let cancelled = harness.run().await.unwrap();
    assert!(
        cancelled
            .get("health_tile")
            .unwrap()
            .has_failure_kind(FailureKind::Cancelled)
    );
    assert_eq!(factory.opened(), 0);

    let second_token = harness.cancellation_token();
    assert!(!second_token.is_cancelled());
    let rerun = harness.run().await.unwrap();
    assert_eq!(status(&rerun, "health_tile"), VerdictStatus::Passed);
    assert!(rerun.overall_passed());
    assert_eq!(factory.opened(), 1);
}

#[tokio::test]
async fn empty_registry_yields_empty_passing_report() {
    let report = run(
        TaskRegistry::new(),
        Arc::new(FakeFactory::default()),
        HarnessOptions::default(),
    )
    .await;

    assert!(report.is_empty());
    assert!(report.overall_passed());
}

#[tokio::test]
async fn invalid_options_are_rejected_up_front() {
    let zero_threads = ValidationHarness::new(
        TaskRegistry::new(),
        Arc::new(FakeFactory::default()),
        HarnessOptions::default().max_concurrency(0),
    );
    assert_eq!(
        zero_threads.err().map(|error| error.kind),
        Some(CoreErrorKind::InvalidConfig)
    );

    let zero_attempts = ValidationHarness::new(
        TaskRegistry::new(),
        Arc::new(FakeFactory::default()),
        HarnessOptions::default().session_retry(fast_retry(0)),
    );
    assert!(zero_attempts.is_err());

    let unbounded = ValidationHarness::new(
        TaskRegistry::new(),
        Arc::new(FakeFactory::default()),
        HarnessOptions::default().max_concurrency(usize::MAX),
    );
    assert_eq!(
        unbounded.err().map(|error| error.kind),
        Some(CoreErrorKind::InvalidConfig)
    );
}
