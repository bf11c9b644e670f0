use std::io::IsTerminal;
use std::process::ExitCode;

use serde::Serialize;
use vetpool_core::logging;
use vetpool_core::persistence::{RunId, RunStore, RunSummary, StoredVerdict};
use vetpool_core::sqlite::SqliteRunStore;

use crate::args::HistoryArgs;
use crate::error::{CliError, CliResult};
use crate::render;

#[derive(Serialize)]
#[serde(untagged)]
enum HistoryView {
    Runs { runs: Vec<RunSummary> },
    Verdicts { run: RunId, verdicts: Vec<StoredVerdict> },
}

pub async fn history(args: HistoryArgs) -> CliResult<ExitCode> {
    logging::init(args.log_level.as_deref(), None)?;

    if !args.history_db.exists() {
        return Err(CliError::Runtime(format!(
            "history database '{}' does not exist",
            args.history_db.display()
        )));
    }

    let path = args.history_db.clone();
    let run = args.run.map(RunId);
    let limit = args.limit;
    let view = tokio::task::spawn_blocking(move || {
        let store = SqliteRunStore::new(path);
        store.migrate_to_latest()?;
        match run {
            Some(run) => store
                .task_verdicts(run)
                .map(|verdicts| HistoryView::Verdicts { run, verdicts }),
            None => store
                .list_recent_runs(limit)
                .map(|runs| HistoryView::Runs { runs }),
        }
    })
    .await
    .map_err(|error| CliError::Runtime(format!("history reader panicked: {error}")))??;

    if args.json {
        let text = serde_json::to_string_pretty(&view)
            .map_err(|error| CliError::Runtime(format!("failed to encode history: {error}")))?;
        println!("{text}");
        return Ok(ExitCode::SUCCESS);
    }

    let color = std::io::stdout().is_terminal();
    match &view {
        HistoryView::Runs { runs } => print!("{}", render::run_list(runs, color)),
        HistoryView::Verdicts { run, verdicts } => {
            println!("run #{run}");
            print!("{}", render::stored_verdicts(verdicts, color));
        }
    }
    Ok(ExitCode::SUCCESS)
}
