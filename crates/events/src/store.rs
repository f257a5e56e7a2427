//! Append-only durable store for job events.
//!
//! One JSON record per line. The store sits off the hot path: runners publish
//! to the bus and a [`PersistenceSink`](crate::sink::PersistenceSink) appends
//! here. IO failures never propagate to the caller, but they are never
//! silent either — every failure is logged and counted in [`StoreHealth`].

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;

use crate::event::JobEvent;

/// Rotate the log once it exceeds this many bytes.
const DEFAULT_MAX_BYTES: u64 = 5 * 1024 * 1024;

/// Keep at most this many rotated archives.
const DEFAULT_MAX_ARCHIVES: usize = 5;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Durable sink/source for job events.
pub trait JobEventStore: Send + Sync {
    /// Best-effort durable append. Must not panic or return an error to the
    /// caller; failures surface through [`JobEventStore::health`].
    fn append(&self, event: &JobEvent);

    /// Load previously stored events in append order, skipping malformed
    /// records.
    fn load(&self) -> Vec<JobEvent>;

    /// Remove all stored events.
    fn clear(&self);

    /// Observable persistence health.
    fn health(&self) -> StoreHealth;
}

/// Health signal for persistence outages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreHealth {
    /// Number of appends that failed since startup.
    pub append_failures: u64,
    /// Message of the most recent failure, if any.
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// JSONL implementation
// ---------------------------------------------------------------------------

struct StoreState {
    health: StoreHealth,
}

/// Append-only JSONL store with size-based rotation.
pub struct JsonlJobEventStore {
    path: PathBuf,
    max_bytes: u64,
    max_archives: usize,
    // Single mutex serializes writes and guards health; the file handle is
    // opened per append so rotation can replace the file underneath.
    state: Mutex<StoreState>,
}

impl JsonlJobEventStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_limits(path, DEFAULT_MAX_BYTES, DEFAULT_MAX_ARCHIVES)
    }

    pub fn with_limits(path: impl Into<PathBuf>, max_bytes: u64, max_archives: usize) -> Self {
        let path = path.into();
        Self {
            path,
            max_bytes,
            max_archives,
            state: Mutex::new(StoreState {
                health: StoreHealth::default(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record_failure(&self, state: &mut StoreState, context: &str, error: impl std::fmt::Display) {
        state.health.append_failures += 1;
        let message = format!("{context}: {error}");
        tracing::error!(
            path = %self.path.display(),
            failures = state.health.append_failures,
            error = %message,
            "Job event persistence failed",
        );
        state.health.last_error = Some(message);
    }

    /// Rename the active log aside and prune the oldest archives.
    fn rotate_if_needed(&self) -> std::io::Result<()> {
        if self.max_bytes == 0 {
            return Ok(());
        }
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size <= self.max_bytes {
            return Ok(());
        }

        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("events");
        let suffix = self
            .path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("jsonl");
        let ts = Utc::now().format("%Y%m%d-%H%M%S%.3f");
        let rotated = self.path.with_file_name(format!("{stem}.{ts}.{suffix}"));
        fs::rename(&self.path, &rotated)?;

        // Archive names embed the timestamp, so lexical order is age order.
        let mut archives: Vec<PathBuf> = Vec::new();
        if let Some(parent) = self.path.parent() {
            let prefix = format!("{stem}.");
            let suffix_dot = format!(".{suffix}");
            for entry in fs::read_dir(parent)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with(&prefix) && name.ends_with(&suffix_dot) {
                    archives.push(entry.path());
                }
            }
        }
        archives.sort();
        while archives.len() > self.max_archives {
            let oldest = archives.remove(0);
            let _ = fs::remove_file(oldest);
        }
        Ok(())
    }

    fn try_append(&self, event: &JobEvent) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        self.rotate_if_needed()?;
        let line = serde_json::to_string(event)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

impl JobEventStore for JsonlJobEventStore {
    fn append(&self, event: &JobEvent) {
        let mut state = self.state.lock().expect("store state poisoned");
        if let Err(e) = self.try_append(event) {
            self.record_failure(&mut state, "append", e);
        }
    }

    fn load(&self) -> Vec<JobEvent> {
        let _guard = self.state.lock().expect("store state poisoned");
        let Ok(contents) = fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        let mut events = Vec::new();
        let mut skipped = 0usize;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<JobEvent>(line) {
                Ok(event) => events.push(event),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::warn!(
                path = %self.path.display(),
                skipped,
                "Skipped malformed event log lines during load",
            );
        }
        events
    }

    fn clear(&self) {
        let mut state = self.state.lock().expect("store state poisoned");
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => self.record_failure(&mut state, "clear", e),
        }
    }

    fn health(&self) -> StoreHealth {
        self.state.lock().expect("store state poisoned").health.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
