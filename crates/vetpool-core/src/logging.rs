use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::models::{CoreError, CoreErrorKind, CoreResult};

pub const DEFAULT_FILTER: &str = "info";

/// Installs the global fmt subscriber. `level` wins over `RUST_LOG`; with
/// neither set, `info` is used. When `log_file` is given, output is appended
/// there instead of stderr.
///
/// A second call is a no-op, so tests and embedders can call this freely.
pub fn init(level: Option<&str>, log_file: Option<&Path>) -> CoreResult<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).map_err(|error| {
            CoreError::new(
                CoreErrorKind::InvalidConfig,
                format!("invalid log level '{level}': {error}"),
            )
        })?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = match log_file {
        Some(path) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(open_log_file(path)?))
            .try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };

    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}

fn open_log_file(path: &Path) -> CoreResult<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|error| log_file_error(path, error))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|error| log_file_error(path, error))
}

fn log_file_error(path: &Path, error: std::io::Error) -> CoreError {
    CoreError::new(
        CoreErrorKind::InvalidConfig,
        format!("failed to open log file '{}': {error}", path.display()),
    )
}
