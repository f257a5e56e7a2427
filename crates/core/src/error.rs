//! Job failure taxonomy.
//!
//! Every failure a job can surface is classified into one of these variants.
//! A presentation layer shows the short [`tag`](JobError::tag) plus the
//! `Display` message; raw causes stay in tracing output.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Bad job input detected before execution starts. Rejected at
    /// submission; never becomes a running job.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The job exceeded its policy timeout.
    #[error("Job timed out after {seconds:.1}s")]
    Timeout { seconds: f64 },

    /// The job was cancelled on request.
    #[error("Job cancelled")]
    Cancelled,

    /// A child process exited without posting a `result` or `error`
    /// envelope. Carries the exit code when the OS reported one.
    #[error("Job process exited{} without a terminal payload", exit_code_suffix(.exit_code))]
    ChildCrash { exit_code: Option<i32> },

    /// Malformed or unknown message received over the IPC channel.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// IO/OS/filesystem failure. The only class treated as transient by
    /// the retry policy.
    #[error("Infrastructure failure: {0}")]
    Infrastructure(String),

    /// Unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn exit_code_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with code {code}"),
        None => String::new(),
    }
}

impl JobError {
    /// Short taxonomy tag for UI badges and persisted failure payloads.
    pub fn tag(&self) -> &'static str {
        match self {
            JobError::Validation(_) => "validation",
            JobError::Timeout { .. } => "timeout",
            JobError::Cancelled => "cancelled",
            JobError::ChildCrash { .. } => "child_crash",
            JobError::Protocol(_) => "protocol",
            JobError::Infrastructure(_) => "infrastructure",
            JobError::Internal(_) => "internal",
        }
    }

    /// Whether the retry policy may re-run a job that failed with this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Infrastructure(_))
    }
}

/// Serializable failure payload carried by `Failed`/`Retrying` events and
/// stored on job records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Taxonomy tag, e.g. `"timeout"` or `"child_crash"`.
    pub tag: String,
    /// Human-readable message. Never a raw backtrace.
    pub message: String,
}

impl From<&JobError> for JobFailure {
    fn from(error: &JobError) -> Self {
        Self {
            tag: error.tag().to_string(),
            message: error.to_string(),
        }
    }
}
