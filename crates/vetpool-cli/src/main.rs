mod args;
mod error;
mod history;
mod render;
mod run;
mod webhook;

use std::process::ExitCode;

use clap::Parser;

use crate::args::{Cli, Command};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run(args) => run::run(args).await,
        Command::History(args) => history::history(args).await,
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            tracing::error!(error = %error, "vetpool failed");
            eprintln!("vetpool: {error}");
            error.exit_code()
        }
    }
}
