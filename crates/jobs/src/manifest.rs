//! Run manifests.
//!
//! Jobs that produce file artifacts get a run folder under
//! `<state_dir>/runs/<job_id>/` holding a `run_manifest.json` describing
//! what ran and where its outputs live. `runs/index.json` maps job ids to
//! run folders so a UI can jump from a job record to its artifacts.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use atelier_core::{JobError, JobId, JobKind};

/// Manifest written into each run folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub kind: JobKind,
    pub timestamp: DateTime<Utc>,
    pub job_id: JobId,
    /// The submission parameters the run was started with.
    pub spec: Value,
    pub env: RunEnv,
    pub git_commit: Option<String>,
    /// Artifact name to path/metadata mapping.
    pub artifacts: Value,
}

/// Environment fingerprint recorded with every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEnv {
    pub app_version: String,
    pub os: String,
    pub arch: String,
}

impl RunEnv {
    fn current() -> Self {
        Self {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

fn runs_root(state_dir: &Path) -> PathBuf {
    state_dir.join("runs")
}

fn index_path(state_dir: &Path) -> PathBuf {
    runs_root(state_dir).join("index.json")
}

fn git_commit() -> Option<String> {
    let output = std::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!commit.is_empty()).then_some(commit)
}

fn io_err(context: &str, e: std::io::Error) -> JobError {
    JobError::Infrastructure(format!("{context}: {e}"))
}

/// Create the run folder for `job_id`, write its manifest, and register it
/// in the index. Returns the run folder path.
pub fn register_run(
    state_dir: &Path,
    job_id: JobId,
    kind: JobKind,
    spec: Value,
    artifacts: Value,
) -> Result<PathBuf, JobError> {
    let root = runs_root(state_dir);
    let run_dir = root.join(job_id.to_string());
    fs::create_dir_all(&run_dir).map_err(|e| io_err("Failed to create run folder", e))?;

    let manifest = RunManifest {
        kind,
        timestamp: Utc::now(),
        job_id,
        spec,
        env: RunEnv::current(),
        git_commit: git_commit(),
        artifacts,
    };
    let body = serde_json::to_string_pretty(&manifest)
        .map_err(|e| JobError::Internal(format!("Failed to serialize run manifest: {e}")))?;
    fs::write(run_dir.join("run_manifest.json"), body)
        .map_err(|e| io_err("Failed to write run manifest", e))?;

    // Merge into the index; a corrupt index is rebuilt rather than fatal.
    let index_file = index_path(state_dir);
    let mut index: BTreeMap<String, String> = fs::read_to_string(&index_file)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    index.insert(job_id.to_string(), run_dir.display().to_string());
    let body = serde_json::to_string_pretty(&index)
        .map_err(|e| JobError::Internal(format!("Failed to serialize run index: {e}")))?;
    fs::write(&index_file, body).map_err(|e| io_err("Failed to write run index", e))?;

    Ok(run_dir)
}

/// Resolve the run folder of `job_id`, if it was registered and still
/// exists on disk.
pub fn run_folder(state_dir: &Path, job_id: JobId) -> Option<PathBuf> {
    let raw = fs::read_to_string(index_path(state_dir)).ok()?;
    let index: BTreeMap<String, String> = serde_json::from_str(&raw).ok()?;
    let folder = PathBuf::from(index.get(&job_id.to_string())?);
    folder.exists().then_some(folder)
}

/// Load the manifest written for `job_id`, if any.
pub fn load_manifest(state_dir: &Path, job_id: JobId) -> Option<RunManifest> {
    let folder = run_folder(state_dir, job_id)?;
    let raw = fs::read_to_string(folder.join("run_manifest.json")).ok()?;
    serde_json::from_str(&raw).ok()
}
