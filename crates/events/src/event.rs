//! Job lifecycle event model.
//!
//! A [`JobEvent`] is an immutable fact about one job, published exactly once
//! per logical occurrence. Serialized as one JSON object per line in the
//! event log with the shape `{"ts": ..., "job_id": ..., "type": ..., "data":
//! ...}`; the `type`/`data` pair comes from the tagged [`JobEventKind`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use atelier_core::{JobError, JobFailure, JobId, JobKind, JobPolicy};

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

/// One lifecycle fact about one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    /// When the event was created (UTC). Informational only; ordering is
    /// defined by publish order per job, never by this wall-clock stamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    pub job_id: JobId,

    #[serde(flatten)]
    pub kind: JobEventKind,
}

/// Event payloads, tagged for the wire as `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum JobEventKind {
    /// The job was accepted and is about to run.
    Started {
        kind: JobKind,
        /// For a rerun, the id of the original job this one repeats.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lineage: Option<JobId>,
        /// Timeout/retry policy the job was submitted with.
        #[serde(default)]
        policy: JobPolicy,
    },

    /// Progress update. `value` is always within `[0, 1]` by the time the
    /// event is published.
    Progress {
        value: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// A single log line. Live runners batch; this form exists for replay
    /// compatibility with older single-line logs.
    LogLine { line: String },

    /// A batch of log lines flushed at a bounded cadence.
    LogBatch { lines: Vec<String> },

    /// Terminal: the job completed and produced an opaque result payload.
    Finished { result: serde_json::Value },

    /// Terminal: the job failed.
    Failed { error: JobFailure },

    /// Terminal: the job was cancelled.
    Cancelled,

    /// Terminal: the job exceeded its policy timeout.
    TimedOut { timeout_secs: f64 },

    /// The job failed transiently and will run again under the same id.
    Retrying {
        attempt: u32,
        max_attempts: u32,
        error: JobFailure,
    },
}

/// Field-less discriminant of [`JobEventKind`], used as a bus topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobEventTag {
    Started,
    Progress,
    LogLine,
    LogBatch,
    Finished,
    Failed,
    Cancelled,
    TimedOut,
    Retrying,
}

impl JobEventKind {
    pub fn tag(&self) -> JobEventTag {
        match self {
            JobEventKind::Started { .. } => JobEventTag::Started,
            JobEventKind::Progress { .. } => JobEventTag::Progress,
            JobEventKind::LogLine { .. } => JobEventTag::LogLine,
            JobEventKind::LogBatch { .. } => JobEventTag::LogBatch,
            JobEventKind::Finished { .. } => JobEventTag::Finished,
            JobEventKind::Failed { .. } => JobEventTag::Failed,
            JobEventKind::Cancelled => JobEventTag::Cancelled,
            JobEventKind::TimedOut { .. } => JobEventTag::TimedOut,
            JobEventKind::Retrying { .. } => JobEventTag::Retrying,
        }
    }

    /// Terminal events end a job's lifecycle; at most one is ever published
    /// per job id.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEventKind::Finished { .. }
                | JobEventKind::Failed { .. }
                | JobEventKind::Cancelled
                | JobEventKind::TimedOut { .. }
        )
    }
}

impl JobEvent {
    pub fn new(job_id: JobId, kind: JobEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            job_id,
            kind,
        }
    }

    pub fn started(
        job_id: JobId,
        kind: JobKind,
        lineage: Option<JobId>,
        policy: JobPolicy,
    ) -> Self {
        Self::new(job_id, JobEventKind::Started { kind, lineage, policy })
    }

    pub fn progress(job_id: JobId, value: f64, message: Option<String>) -> Self {
        Self::new(job_id, JobEventKind::Progress { value, message })
    }

    pub fn log_batch(job_id: JobId, lines: Vec<String>) -> Self {
        Self::new(job_id, JobEventKind::LogBatch { lines })
    }

    pub fn finished(job_id: JobId, result: serde_json::Value) -> Self {
        Self::new(job_id, JobEventKind::Finished { result })
    }

    pub fn failed(job_id: JobId, error: &JobError) -> Self {
        Self::new(
            job_id,
            JobEventKind::Failed {
                error: JobFailure::from(error),
            },
        )
    }

    pub fn cancelled(job_id: JobId) -> Self {
        Self::new(job_id, JobEventKind::Cancelled)
    }

    pub fn timed_out(job_id: JobId, timeout_secs: f64) -> Self {
        Self::new(job_id, JobEventKind::TimedOut { timeout_secs })
    }

    pub fn retrying(job_id: JobId, attempt: u32, max_attempts: u32, error: &JobError) -> Self {
        Self::new(
            job_id,
            JobEventKind::Retrying {
                attempt,
                max_attempts,
                error: JobFailure::from(error),
            },
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_record_has_type_and_data_fields() {
        let event = JobEvent::progress(JobId::new(), 0.5, Some("halfway".into()));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "progress");
        assert_eq!(value["data"]["value"], 0.5);
        assert_eq!(value["data"]["message"], "halfway");
        assert!(value["ts"].is_string());
        assert!(value["job_id"].is_string());
    }

    #[test]
    fn round_trips_through_json() {
        let events = vec![
            JobEvent::started(
                JobId::new(),
                JobKind::TrainModel,
                Some(JobId::new()),
                JobPolicy::default(),
            ),
            JobEvent::progress(JobId::new(), 1.0, None),
            JobEvent::log_batch(JobId::new(), vec!["a".into(), "b".into()]),
            JobEvent::finished(JobId::new(), serde_json::json!({"epochs": 10})),
            JobEvent::failed(JobId::new(), &JobError::Internal("boom".into())),
            JobEvent::cancelled(JobId::new()),
            JobEvent::timed_out(JobId::new(), 30.0),
            JobEvent::retrying(
                JobId::new(),
                1,
                3,
                &JobError::Infrastructure("io".into()),
            ),
        ];
        for event in events {
            let line = serde_json::to_string(&event).unwrap();
            let parsed: JobEvent = serde_json::from_str(&line).unwrap();
            assert_eq!(parsed, event);
        }
    }

    #[test]
    fn cancelled_serializes_without_data() {
        let event = JobEvent::cancelled(JobId::new());
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "cancelled");
    }

    #[test]
    fn terminal_classification() {
        assert!(JobEventKind::Cancelled.is_terminal());
        assert!(JobEventKind::Finished {
            result: serde_json::Value::Null
        }
        .is_terminal());
        assert!(JobEventKind::TimedOut { timeout_secs: 1.0 }.is_terminal());
        assert!(!JobEventKind::Progress {
            value: 0.2,
            message: None
        }
        .is_terminal());
        assert!(!JobEventKind::Retrying {
            attempt: 1,
            max_attempts: 2,
            error: JobFailure {
                tag: "infrastructure".into(),
                message: "io".into(),
            },
        }
        .is_terminal());
    }

    #[test]
    fn started_omits_absent_lineage() {
        let event = JobEvent::started(
            JobId::new(),
            JobKind::PrepareDataset,
            None,
            JobPolicy::default(),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert!(value["data"].get("lineage").is_none());
    }

    #[test]
    fn started_without_policy_field_parses_with_defaults() {
        // Logs written before policies were persisted lack the field.
        let id = JobId::new();
        let line = format!(
            r#"{{"ts":"2026-08-06T10:00:00Z","job_id":"{id}","type":"started","data":{{"kind":"train_model"}}}}"#
        );
        let event: JobEvent = serde_json::from_str(&line).unwrap();
        match event.kind {
            JobEventKind::Started { kind, lineage, policy } => {
                assert_eq!(kind, JobKind::TrainModel);
                assert_eq!(lineage, None);
                assert_eq!(policy, JobPolicy::default());
            }
            other => panic!("Expected Started, got {other:?}"),
        }
    }
}
