pub mod aggregator;
pub mod cancellation;
pub mod executor;
pub mod harness;
pub mod scheduler;

pub use aggregator::ResultAggregator;
pub use cancellation::CancellationToken;
pub use executor::TaskExecutor;
pub use harness::{HarnessOptions, ValidationHarness};
pub use scheduler::{
    BoundedScheduler, DEFAULT_MAX_CONCURRENCY, MAX_CONCURRENCY, ScheduleOutcome,
};

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::sync::Once;

use serde::{Deserialize, Serialize};

/// What to do with a task that passed but whose teardown failed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Keep the verdict; cleanup errors are listed separately.
    #[default]
    Report,
    /// Any cleanup error turns a PASSED task into FAILED.
    Fail,
}

impl std::str::FromStr for CleanupPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "report" => Ok(CleanupPolicy::Report),
            "fail" => Ok(CleanupPolicy::Fail),
            other => Err(format!(
                "unknown cleanup policy '{other}' (expected 'report' or 'fail')"
            )),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

thread_local! {
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Chains a panic hook that keeps the panicking thread's backtrace, so the
/// `catch_unwind` that follows on the same thread can pick it up with
/// [`take_panic_trace`]. The previous hook still runs.
pub(crate) fn install_panic_trace_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            let _ = PANIC_TRACE.try_with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

pub(crate) fn take_panic_trace() -> Option<String> {
    PANIC_TRACE
        .try_with(|slot| slot.borrow_mut().take())
        .ok()
        .flatten()
}
