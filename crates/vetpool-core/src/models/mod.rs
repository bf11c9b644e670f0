pub mod error;
pub mod report;
pub mod task;
pub mod verdict;

pub use error::{CoreError, CoreErrorKind, CoreResult};
pub use report::{
    DEFAULT_ERROR_CHAR_LIMIT, ReportEntry, ReportOptions, RunReport, StatusCounts, truncate_chars,
};
pub use task::{FailureKind, TaskFailure, TaskName, TaskStatus};
pub use verdict::{Verdict, VerdictStatus};
