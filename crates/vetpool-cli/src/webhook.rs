use std::time::Duration;

use vetpool_core::models::{CoreError, CoreErrorKind, CoreResult, ReportOptions, RunReport};
use vetpool_core::sink::ReportSink;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// POSTs the summary JSON to an HTTP endpoint. Blocking; callers run it
/// off the async workers.
pub struct WebhookSink {
    url: String,
    label: String,
    timeout: Duration,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            label: format!("webhook:{url}"),
            url,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl ReportSink for WebhookSink {
    fn name(&self) -> &str {
        &self.label
    }

    fn deliver(&self, report: &RunReport, options: &ReportOptions) -> CoreResult<()> {
        let body = report.summary(options).to_string();

        let response = ureq::post(&self.url)
            .timeout(self.timeout)
            .set("Content-Type", "application/json")
            .send_string(&body)
            .map_err(|error| match error {
                ureq::Error::Status(code, _) => CoreError::new(
                    CoreErrorKind::ProcessFailure,
                    format!("webhook '{}' answered with HTTP {code}", self.url),
                ),
                ureq::Error::Transport(transport) => CoreError::new(
                    CoreErrorKind::ProcessFailure,
                    format!("webhook '{}' unreachable: {transport}", self.url),
                ),
            })?;

        tracing::info!(url = %self.url, status = response.status(), "posted report summary");
        Ok(())
    }
}
