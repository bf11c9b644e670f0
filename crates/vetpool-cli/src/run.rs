use std::io::IsTerminal;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use vetpool_core::config::HarnessConfig;
use vetpool_core::execution::TokioProcessExecutor;
use vetpool_core::logging;
use vetpool_core::models::{ReportOptions, RunReport};
use vetpool_core::orchestration::ValidationHarness;
use vetpool_core::persistence::RunStore;
use vetpool_core::sink::{JsonFileSink, ReportSink, deliver_all};
use vetpool_core::sqlite::SqliteRunStore;

use crate::args::RunArgs;
use crate::error::{CliError, CliResult};
use crate::render;
use crate::webhook::WebhookSink;

pub async fn run(args: RunArgs) -> CliResult<ExitCode> {
    let mut config = HarnessConfig::load(args.config.as_deref())?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    logging::init(args.log_level.as_deref(), config.log_file.as_deref())?;
    log_configuration(&config, args.config.as_deref());

    let executor = Arc::new(TokioProcessExecutor);
    let registry = config.build_registry(executor.clone())?;
    let factory = Arc::new(config.session_factory(executor));
    let harness = ValidationHarness::new(registry, factory, config.harness_options())?;

    let cancellation = harness.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling remaining tasks");
            cancellation.cancel();
        }
    });

    let outcome = harness.run().await;
    interrupt.abort();
    let report = outcome?;

    if args.json {
        println!("{:#}", report.summary(&config.report));
    } else {
        let color = std::io::stdout().is_terminal();
        print!("{}", render::run_report(&report, &config.report, color));
    }

    deliver(&args, &config.report, &report).await?;

    if let Some(path) = config.history_db.clone() {
        record_history(path, report.clone()).await;
    }

    Ok(if report.overall_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

/// Settings after file, environment and flags. Called once logging is up.
fn log_configuration(config: &HarnessConfig, source: Option<&Path>) {
    tracing::info!(
        source = %source.map_or_else(|| "defaults".to_string(), |path| path.display().to_string()),
        tasks = config.tasks.len(),
        maximum_threads = config.maximum_threads,
        tasks_to_avoid = %config.tasks_to_avoid,
        task_timeout_secs = ?config.task_timeout_secs,
        cleanup_policy = ?config.cleanup_policy,
        session_attempts = config.session.max_attempts,
        "loaded configuration"
    );
}

fn apply_overrides(config: &mut HarnessConfig, args: &RunArgs) {
    if let Some(threads) = args.maximum_threads {
        config.maximum_threads = threads;
    }
    if let Some(tasks_to_avoid) = &args.tasks_to_avoid {
        config.tasks_to_avoid = tasks_to_avoid.clone();
    }
    if let Some(timeout) = args.task_timeout_secs {
        config.task_timeout_secs = Some(timeout);
    }
    if let Some(policy) = args.cleanup_policy {
        config.cleanup_policy = policy;
    }
    if args.full_errors {
        config.report.error_char_limit = None;
    } else if let Some(limit) = args.error_char_limit {
        config.report.error_char_limit = Some(limit);
    }
    if let Some(path) = &args.history_db {
        config.history_db = Some(path.clone());
    }
    if let Some(path) = &args.log_file {
        config.log_file = Some(path.clone());
    }
}

async fn deliver(args: &RunArgs, options: &ReportOptions, report: &RunReport) -> CliResult<()> {
    let mut sinks: Vec<Box<dyn ReportSink>> = Vec::new();
    if let Some(path) = &args.output {
        sinks.push(Box::new(JsonFileSink::new(path)));
    }
    if let Some(url) = &args.webhook {
        let mut sink = WebhookSink::new(url.as_str());
        if let Some(secs) = args.webhook_timeout_secs {
            sink = sink.timeout(Duration::from_secs(secs));
        }
        sinks.push(Box::new(sink));
    }
    if sinks.is_empty() {
        return Ok(());
    }

    let options = *options;
    let report = report.clone();
    let failed = tokio::task::spawn_blocking(move || deliver_all(&sinks, &report, &options))
        .await
        .map_err(|error| CliError::Runtime(format!("report delivery panicked: {error}")))?;

    if !failed.is_empty() {
        eprintln!("report delivery failed for: {}", failed.join(", "));
    }
    Ok(())
}

async fn record_history(path: std::path::PathBuf, report: RunReport) {
    let persisted = tokio::task::spawn_blocking(move || {
        let store = SqliteRunStore::new(path);
        store.migrate_to_latest()?;
        store.save_run(&report)
    })
    .await;

    match persisted {
        Ok(Ok(run_id)) => tracing::info!(run_id = %run_id, "recorded run history"),
        Ok(Err(error)) => {
            tracing::error!(kind = ?error.kind, message = %error.message, "failed to record run history")
        }
        Err(join_error) => {
            tracing::error!(error = %join_error, "run history writer panicked")
        }
    }
}
