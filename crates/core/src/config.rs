//! Job system configuration loaded from environment variables.
//!
//! All fields have defaults suitable for local development; override via
//! environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the job orchestration core.
#[derive(Debug, Clone)]
pub struct JobSystemConfig {
    /// Maximum concurrently running thread-pool jobs (default: `4`).
    pub max_worker_threads: usize,
    /// Maximum concurrently running process-isolated jobs (default: `2`).
    pub max_process_jobs: usize,
    /// Maximum retained job records before old terminal records are purged
    /// (default: `200`).
    pub max_jobs: usize,
    /// Maximum log lines retained per job record (default: `400`).
    pub max_log_lines: usize,
    /// Application state directory (default: `.atelier`).
    pub state_dir: PathBuf,
    /// Path of the append-only job event log (default:
    /// `<state_dir>/jobs.jsonl`).
    pub event_log: PathBuf,
    /// Grace period for draining in-flight jobs at shutdown (default: `5s`).
    pub shutdown_grace: Duration,
}

impl JobSystemConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default                  |
    /// |-------------------------------|--------------------------|
    /// | `ATELIER_MAX_WORKER_THREADS`  | `4`                      |
    /// | `ATELIER_MAX_PROCESS_JOBS`    | `2`                      |
    /// | `ATELIER_MAX_JOBS`            | `200`                    |
    /// | `ATELIER_MAX_LOG_LINES`       | `400`                    |
    /// | `ATELIER_STATE_DIR`           | `.atelier`               |
    /// | `ATELIER_EVENT_LOG`           | `<state_dir>/jobs.jsonl` |
    /// | `ATELIER_SHUTDOWN_GRACE_SECS` | `5`                      |
    pub fn from_env() -> Self {
        let max_worker_threads: usize = std::env::var("ATELIER_MAX_WORKER_THREADS")
            .unwrap_or_else(|_| "4".into())
            .parse()
            .expect("ATELIER_MAX_WORKER_THREADS must be a valid usize");

        let max_process_jobs: usize = std::env::var("ATELIER_MAX_PROCESS_JOBS")
            .unwrap_or_else(|_| "2".into())
            .parse()
            .expect("ATELIER_MAX_PROCESS_JOBS must be a valid usize");

        let max_jobs: usize = std::env::var("ATELIER_MAX_JOBS")
            .unwrap_or_else(|_| "200".into())
            .parse()
            .expect("ATELIER_MAX_JOBS must be a valid usize");

        let max_log_lines: usize = std::env::var("ATELIER_MAX_LOG_LINES")
            .unwrap_or_else(|_| "400".into())
            .parse()
            .expect("ATELIER_MAX_LOG_LINES must be a valid usize");

        let state_dir = PathBuf::from(
            std::env::var("ATELIER_STATE_DIR").unwrap_or_else(|_| ".atelier".into()),
        );

        let event_log = std::env::var("ATELIER_EVENT_LOG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| state_dir.join("jobs.jsonl"));

        let shutdown_grace_secs: u64 = std::env::var("ATELIER_SHUTDOWN_GRACE_SECS")
            .unwrap_or_else(|_| "5".into())
            .parse()
            .expect("ATELIER_SHUTDOWN_GRACE_SECS must be a valid u64");

        Self {
            max_worker_threads,
            max_process_jobs,
            max_jobs,
            max_log_lines,
            state_dir,
            event_log,
            shutdown_grace: Duration::from_secs(shutdown_grace_secs),
        }
    }
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        let state_dir = PathBuf::from(".atelier");
        Self {
            max_worker_threads: 4,
            max_process_jobs: 2,
            max_jobs: 200,
            max_log_lines: 400,
            event_log: state_dir.join("jobs.jsonl"),
            state_dir,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}
