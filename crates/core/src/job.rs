//! Job identity, kind, and lifecycle status.
//!
//! [`JobStatus`] encodes the lifecycle state machine; every status change in
//! the registry goes through [`JobStatus::can_transition_to`], so a terminal
//! record can never be mutated again.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// Opaque unique job identifier, assigned at submission time.
///
/// Policy-driven retries of an attempt reuse the id; a user-initiated rerun
/// allocates a fresh id whose record references the original via lineage.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Allocate a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Hyphen-less form, stable across Display/FromStr.
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for JobId {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| JobError::Validation(format!("Invalid job id \"{s}\": {e}")))
    }
}

// ---------------------------------------------------------------------------
// JobKind
// ---------------------------------------------------------------------------

/// The closed set of background job families the application runs.
///
/// Dispatch sites match exhaustively; adding a kind is a compile-time event,
/// not a runtime string convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Convert/split a raw dataset into the training layout.
    PrepareDataset,
    /// Apply augmentation passes to a prepared dataset.
    AugmentDataset,
    /// Train a model.
    TrainModel,
    /// Validate a trained model against a held-out set.
    ValidateModel,
    /// Export a trained model to a deployment format.
    ExportModel,
    /// Run live detection/inference.
    RunDetection,
    /// Push/pull state with an external experiment-tracking integration.
    SyncIntegration,
    /// Housekeeping work (cache pruning, archive rotation, ...).
    Maintenance,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::PrepareDataset => "prepare_dataset",
            JobKind::AugmentDataset => "augment_dataset",
            JobKind::TrainModel => "train_model",
            JobKind::ValidateModel => "validate_model",
            JobKind::ExportModel => "export_model",
            JobKind::RunDetection => "run_detection",
            JobKind::SyncIntegration => "sync_integration",
            JobKind::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prepare_dataset" => Ok(JobKind::PrepareDataset),
            "augment_dataset" => Ok(JobKind::AugmentDataset),
            "train_model" => Ok(JobKind::TrainModel),
            "validate_model" => Ok(JobKind::ValidateModel),
            "export_model" => Ok(JobKind::ExportModel),
            "run_detection" => Ok(JobKind::RunDetection),
            "sync_integration" => Ok(JobKind::SyncIntegration),
            "maintenance" => Ok(JobKind::Maintenance),
            _ => Err(JobError::Validation(format!("Unknown job kind: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Background job lifecycle status.
///
/// Valid transitions:
/// - `Pending -> Running | Cancelling | Cancelled | Failed | TimedOut`
/// - `Running -> Retrying | Cancelling | Finished | Failed | Cancelled | TimedOut`
/// - `Retrying -> Running | Cancelling | Failed | Cancelled | TimedOut`
/// - `Cancelling -> Cancelled | Finished | Failed | TimedOut`
/// - terminal statuses have no outgoing transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Retrying,
    /// A cancel was requested but the job has not yet stopped. Cancellation
    /// is cooperative for thread-backed jobs, so this state can persist
    /// until the body next polls its token.
    Cancelling,
    Finished,
    Failed,
    Cancelled,
    TimedOut,
}

impl JobStatus {
    /// Whether a transition from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (s, n) if s == n => false,

            (Pending, Running) => true,
            (Pending, Cancelling) => true,
            (Pending, Cancelled) => true,
            (Pending, Failed) => true,
            (Pending, TimedOut) => true,

            (Running, Retrying) => true,
            (Running, Cancelling) => true,
            (Running, Finished) => true,
            (Running, Failed) => true,
            (Running, Cancelled) => true,
            (Running, TimedOut) => true,

            (Retrying, Running) => true,
            (Retrying, Cancelling) => true,
            (Retrying, Failed) => true,
            (Retrying, Cancelled) => true,
            (Retrying, TimedOut) => true,

            // A cancel request may lose the race against normal completion.
            (Cancelling, Cancelled) => true,
            (Cancelling, Finished) => true,
            (Cancelling, Failed) => true,
            (Cancelling, TimedOut) => true,

            _ => false,
        }
    }

    /// Terminal statuses accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Cancelled | JobStatus::TimedOut
        )
    }

    /// Whether the job still holds execution resources.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Retrying => "retrying",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "retrying" => Ok(JobStatus::Retrying),
            "cancelling" => Ok(JobStatus::Cancelling),
            "finished" => Ok(JobStatus::Finished),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "timed_out" => Ok(JobStatus::TimedOut),
            _ => Err(JobError::Validation(format!("Unknown job status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Normalize a raw progress value into `[0.0, 1.0]`.
///
/// Non-finite values are rejected; finite out-of-range values are clamped.
/// Stored progress is therefore always in range.
pub fn normalize_progress(raw: f64) -> Result<f64, JobError> {
    if !raw.is_finite() {
        return Err(JobError::Validation(format!(
            "Progress must be a finite number, got {raw}"
        )));
    }
    Ok(raw.clamp(0.0, 1.0))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
