use std::path::{Path, PathBuf};

use crate::models::{CoreError, CoreErrorKind, CoreResult, ReportOptions, RunReport};

/// Destination for a finished run's summary. Delivery happens once, after
/// the report is final; a failing sink never changes the verdicts.
pub trait ReportSink: Send + Sync {
    fn name(&self) -> &str;

    fn deliver(&self, report: &RunReport, options: &ReportOptions) -> CoreResult<()>;
}

/// Writes the summary JSON to a file, replacing it if present.
pub struct JsonFileSink {
    path: PathBuf,
    label: String,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            label: format!("json-file:{}", path.display()),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReportSink for JsonFileSink {
    fn name(&self) -> &str {
        &self.label
    }

    fn deliver(&self, report: &RunReport, options: &ReportOptions) -> CoreResult<()> {
        let body = serde_json::to_string_pretty(&report.summary(options)).map_err(|error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("failed to encode report summary: {error}"),
            )
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|error| self.write_error(error))?;
        }
        std::fs::write(&self.path, body).map_err(|error| self.write_error(error))?;

        tracing::info!(path = %self.path.display(), tasks = report.len(), "wrote report summary");
        Ok(())
    }
}

impl JsonFileSink {
    fn write_error(&self, error: std::io::Error) -> CoreError {
        CoreError::new(
            CoreErrorKind::StorageFailure,
            format!("failed to write '{}': {error}", self.path.display()),
        )
    }
}

/// Hands the report to every sink, logging failures instead of stopping.
/// Returns the names of the sinks that failed.
pub fn deliver_all(
    sinks: &[Box<dyn ReportSink>],
    report: &RunReport,
    options: &ReportOptions,
) -> Vec<String> {
    let mut failed = Vec::new();
    for sink in sinks {
        if let Err(error) = sink.deliver(report, options) {
            tracing::error!(sink = sink.name(), error = %error, "report delivery failed");
            failed.push(sink.name().to_string());
        }
    }
    failed
}
