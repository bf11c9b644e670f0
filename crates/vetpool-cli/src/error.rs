use std::process::ExitCode;

use thiserror::Error;
use vetpool_core::models::CoreError;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Core(#[from] CoreError),
    #[error("{0}")]
    Runtime(String),
}

impl CliError {
    /// Harness and configuration errors exit with 2; failed tasks exit with 1.
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(2)
    }
}
