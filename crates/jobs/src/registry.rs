//! Authoritative in-memory registry of job state.
//!
//! The registry subscribes to the [`EventBus`] and folds every [`JobEvent`]
//! into a [`JobRecord`]. Events may be published concurrently from many
//! runner tasks; all mutation funnels through one mutex, so a record can
//! never be torn and consumers only ever see cloned [`JobSnapshot`]s.
//!
//! Status changes go through [`JobStatus::can_transition_to`]. Once a record
//! is terminal every further event for that id is ignored, which is what
//! keeps a duplicate terminal event (or a replayed log) from mutating
//! history.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;

use atelier_core::{JobError, JobFailure, JobId, JobKind, JobPolicy, JobStatus};
use atelier_events::{EventBus, JobEvent, JobEventKind, JobEventStore, Topic};

/// Minimum interval between batched UI notifications.
const UI_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Records and snapshots
// ---------------------------------------------------------------------------

/// Mutable job state, owned exclusively by the registry.
#[derive(Debug, Clone)]
pub(crate) struct JobRecord {
    pub(crate) id: JobId,
    pub(crate) kind: JobKind,
    pub(crate) lineage: Option<JobId>,
    pub(crate) status: JobStatus,
    pub(crate) progress: f64,
    pub(crate) message: Option<String>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) finished_at: Option<DateTime<Utc>>,
    pub(crate) result: Option<Value>,
    pub(crate) error: Option<JobFailure>,
    pub(crate) log_tail: Vec<String>,
    pub(crate) retry_count: u32,
    pub(crate) policy: JobPolicy,
}

impl JobRecord {
    pub(crate) fn seed(id: JobId, kind: JobKind, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            lineage: None,
            status: JobStatus::Pending,
            progress: 0.0,
            message: None,
            created_at,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            log_tail: Vec::new(),
            retry_count: 0,
            policy: JobPolicy::default(),
        }
    }

    fn transition(&mut self, next: JobStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    fn push_log_lines<'a>(&mut self, lines: impl IntoIterator<Item = &'a str>, max: usize) {
        for line in lines {
            self.log_tail.push(line.to_string());
        }
        if self.log_tail.len() > max {
            let excess = self.log_tail.len() - max;
            self.log_tail.drain(..excess);
        }
    }

    /// Fold one event into this record.
    ///
    /// Returns `false` when the event was ignored (record already terminal,
    /// or the transition is not allowed). Shared by the live bus path and
    /// startup replay so both have identical semantics.
    pub(crate) fn apply(&mut self, event: &JobEvent, max_log_lines: usize) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        match &event.kind {
            JobEventKind::Started {
                kind,
                lineage,
                policy,
            } => {
                self.kind = *kind;
                self.lineage = *lineage;
                self.policy = policy.clone();
                self.created_at = event.timestamp;
                true
            }
            JobEventKind::Progress { value, message } => {
                // Runners normalize before publishing; clamp again so a raw
                // publisher can never store an out-of-range value.
                if !value.is_finite() {
                    return false;
                }
                if self.status == JobStatus::Pending {
                    self.started_at = Some(event.timestamp);
                    self.transition(JobStatus::Running);
                } else if self.status == JobStatus::Retrying {
                    self.transition(JobStatus::Running);
                }
                self.progress = value.clamp(0.0, 1.0);
                self.message.clone_from(message);
                true
            }
            JobEventKind::LogLine { line } => {
                self.push_log_lines([line.as_str()], max_log_lines);
                true
            }
            JobEventKind::LogBatch { lines } => {
                self.push_log_lines(lines.iter().map(String::as_str), max_log_lines);
                true
            }
            JobEventKind::Finished { result } => {
                if self.transition(JobStatus::Finished) {
                    self.progress = 1.0;
                    self.result = Some(result.clone());
                    self.finished_at = Some(event.timestamp);
                    true
                } else {
                    false
                }
            }
            JobEventKind::Failed { error } => {
                if self.transition(JobStatus::Failed) {
                    self.error = Some(error.clone());
                    self.finished_at = Some(event.timestamp);
                    true
                } else {
                    false
                }
            }
            JobEventKind::Cancelled => {
                if self.transition(JobStatus::Cancelled) {
                    self.finished_at = Some(event.timestamp);
                    true
                } else {
                    false
                }
            }
            JobEventKind::TimedOut { timeout_secs } => {
                if self.transition(JobStatus::TimedOut) {
                    self.error = Some(JobFailure {
                        tag: "timeout".to_string(),
                        message: format!("Job timed out after {timeout_secs:.1}s"),
                    });
                    self.finished_at = Some(event.timestamp);
                    true
                } else {
                    false
                }
            }
            JobEventKind::Retrying {
                attempt,
                max_attempts,
                error,
            } => {
                if self.transition(JobStatus::Retrying) {
                    self.retry_count = *attempt;
                    self.message = Some(format!(
                        "retry {attempt}/{max_attempts}: {}",
                        error.message
                    ));
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Snapshot of a record outside any registry (no action capabilities).
    pub(crate) fn detached_snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            kind: self.kind,
            lineage: self.lineage,
            status: self.status,
            progress: self.progress,
            message: self.message.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            result: self.result.clone(),
            error: self.error.clone(),
            log_tail: self.log_tail.clone(),
            retry_count: self.retry_count,
            policy: self.policy.clone(),
            can_cancel: false,
            can_rerun: false,
        }
    }
}

/// Immutable copy of a [`JobRecord`] handed to consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub id: JobId,
    pub kind: JobKind,
    pub lineage: Option<JobId>,
    pub status: JobStatus,
    pub progress: f64,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<JobFailure>,
    pub log_tail: Vec<String>,
    pub retry_count: u32,
    pub policy: JobPolicy,
    /// A cancel action is registered and the job is still active.
    pub can_cancel: bool,
    /// A rerun action is registered.
    pub can_rerun: bool,
}

/// Filter for [`JobRegistry::list`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JobFilter {
    pub kind: Option<JobKind>,
    pub status: Option<JobStatus>,
    /// Only jobs that have not reached a terminal status.
    pub active_only: bool,
}

impl JobFilter {
    fn matches(&self, record: &JobRecord) -> bool {
        if let Some(kind) = self.kind {
            if record.kind != kind {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if self.active_only && record.status.is_terminal() {
            return false;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type CancelAction = Arc<dyn Fn() + Send + Sync>;
type RerunAction = Arc<dyn Fn() -> Result<JobId, JobError> + Send + Sync>;
type UiCallback = Arc<dyn Fn(&[JobSnapshot]) + Send + Sync>;

struct UiState {
    subscribers: Vec<UiCallback>,
    dirty: HashSet<JobId>,
    last_flush: Option<Instant>,
}

struct RegistryInner {
    jobs: HashMap<JobId, JobRecord>,
    cancel_actions: HashMap<JobId, CancelAction>,
    rerun_actions: HashMap<JobId, RerunAction>,
    // Actions registered before the job's Started event arrived; attached on
    // start, bounded like the job map itself.
    pending_cancel: HashMap<JobId, CancelAction>,
    pending_rerun: HashMap<JobId, RerunAction>,
    ui: UiState,
}

/// Registry of background jobs (UI history, cancel/rerun dispatch, logs).
pub struct JobRegistry {
    inner: Mutex<RegistryInner>,
    max_jobs: usize,
    max_log_lines: usize,
}

impl JobRegistry {
    /// Create a registry and subscribe it to every event on `bus`.
    pub fn attach(bus: &EventBus, max_jobs: usize, max_log_lines: usize) -> Arc<Self> {
        let registry = Arc::new(Self {
            inner: Mutex::new(RegistryInner {
                jobs: HashMap::new(),
                cancel_actions: HashMap::new(),
                rerun_actions: HashMap::new(),
                pending_cancel: HashMap::new(),
                pending_rerun: HashMap::new(),
                ui: UiState {
                    subscribers: Vec::new(),
                    dirty: HashSet::new(),
                    last_flush: None,
                },
            }),
            max_jobs,
            max_log_lines,
        });
        let subscriber = Arc::clone(&registry);
        bus.subscribe(Topic::All, move |event| subscriber.on_event(event));
        registry
    }

    /// Create a registry seeded from a persisted event log, then subscribe
    /// it to `bus`.
    ///
    /// Replay reads the store directly; nothing re-enters the bus, so an
    /// attached persistence sink will not duplicate records.
    pub fn attach_with_store(
        bus: &EventBus,
        store: &dyn JobEventStore,
        max_jobs: usize,
        max_log_lines: usize,
    ) -> Arc<Self> {
        let registry = Self::attach(bus, max_jobs, max_log_lines);
        let records = crate::replay::fold(&store.load(), max_log_lines);
        {
            let mut inner = registry.inner.lock().expect("registry poisoned");
            inner.jobs = records;
            Self::purge_if_needed(&mut inner, registry.max_jobs);
        }
        registry
    }

    // -- event path ---------------------------------------------------------

    fn on_event(&self, event: &JobEvent) {
        let flush = {
            let mut inner = self.inner.lock().expect("registry poisoned");
            let record = inner
                .jobs
                .entry(event.job_id)
                .or_insert_with(|| JobRecord::seed(event.job_id, started_kind(event), event.timestamp));
            let applied = record.apply(event, self.max_log_lines);
            if !applied && event.kind.is_terminal() {
                tracing::debug!(
                    job_id = %event.job_id,
                    event = ?event.kind.tag(),
                    "Ignored terminal event for already-terminal job",
                );
            }

            if matches!(event.kind, JobEventKind::Started { .. }) {
                Self::attach_pending_actions(&mut inner, event.job_id);
            }
            if event.kind.is_terminal() {
                // Cancel capability disappears once the job is terminal.
                inner.cancel_actions.remove(&event.job_id);
                Self::purge_if_needed(&mut inner, self.max_jobs);
            }

            if applied {
                inner.ui.dirty.insert(event.job_id);
            }
            self.collect_ui_flush(&mut inner, event.kind.is_terminal())
        };
        Self::run_ui_flush(flush);
    }

    fn attach_pending_actions(inner: &mut RegistryInner, job_id: JobId) {
        if let Some(action) = inner.pending_cancel.remove(&job_id) {
            inner.cancel_actions.insert(job_id, action);
        }
        if let Some(action) = inner.pending_rerun.remove(&job_id) {
            inner.rerun_actions.insert(job_id, action);
        }
    }

    /// Keep only the newest `max_jobs` records.
    ///
    /// Only terminal records are eligible, and a record referenced as the
    /// lineage of a surviving record is kept so lineage lookups never dangle.
    fn purge_if_needed(inner: &mut RegistryInner, max_jobs: usize) {
        if max_jobs == 0 || inner.jobs.len() <= max_jobs {
            Self::bound_pending(inner, max_jobs);
            return;
        }
        let referenced: HashSet<JobId> =
            inner.jobs.values().filter_map(|r| r.lineage).collect();
        let mut candidates: Vec<(DateTime<Utc>, JobId)> = inner
            .jobs
            .values()
            .filter(|r| r.status.is_terminal() && !referenced.contains(&r.id))
            .map(|r| (r.finished_at.unwrap_or(r.created_at), r.id))
            .collect();
        candidates.sort();
        let mut excess = inner.jobs.len().saturating_sub(max_jobs);
        for (_, id) in candidates {
            if excess == 0 {
                break;
            }
            inner.jobs.remove(&id);
            inner.cancel_actions.remove(&id);
            inner.rerun_actions.remove(&id);
            excess -= 1;
        }
        Self::bound_pending(inner, max_jobs);
    }

    fn bound_pending(inner: &mut RegistryInner, max_jobs: usize) {
        if max_jobs == 0 {
            return;
        }
        while inner.pending_cancel.len() > max_jobs {
            let Some(key) = inner.pending_cancel.keys().next().copied() else {
                break;
            };
            inner.pending_cancel.remove(&key);
        }
        while inner.pending_rerun.len() > max_jobs {
            let Some(key) = inner.pending_rerun.keys().next().copied() else {
                break;
            };
            inner.pending_rerun.remove(&key);
        }
    }

    // -- UI notification ----------------------------------------------------

    /// Register a callback receiving batched snapshots of changed jobs.
    ///
    /// Updates are coalesced: the callback fires at most every 100 ms, and
    /// immediately when any job reaches a terminal status.
    pub fn subscribe_ui(&self, callback: impl Fn(&[JobSnapshot]) + Send + Sync + 'static) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.ui.subscribers.push(Arc::new(callback));
    }

    fn collect_ui_flush(
        &self,
        inner: &mut RegistryInner,
        terminal: bool,
    ) -> Option<(Vec<UiCallback>, Vec<JobSnapshot>)> {
        if inner.ui.subscribers.is_empty() || inner.ui.dirty.is_empty() {
            return None;
        }
        let now = Instant::now();
        let due = terminal
            || match inner.ui.last_flush {
                None => true,
                Some(last) => now.duration_since(last) >= UI_FLUSH_INTERVAL,
            };
        if !due {
            return None;
        }
        inner.ui.last_flush = Some(now);
        let dirty = std::mem::take(&mut inner.ui.dirty);
        let snapshots: Vec<JobSnapshot> = dirty
            .into_iter()
            .filter_map(|id| Self::snapshot_of(inner, id))
            .collect();
        if snapshots.is_empty() {
            return None;
        }
        Some((inner.ui.subscribers.clone(), snapshots))
    }

    fn run_ui_flush(flush: Option<(Vec<UiCallback>, Vec<JobSnapshot>)>) {
        if let Some((callbacks, snapshots)) = flush {
            // Outside the registry lock: a callback may call back into the
            // registry (or publish) without deadlocking.
            for callback in callbacks {
                callback(&snapshots);
            }
        }
    }

    // -- actions ------------------------------------------------------------

    /// Register the action invoked by [`JobRegistry::request_cancel`].
    ///
    /// Works uniformly for thread- and process-backed jobs; if the job's
    /// `Started` event has not arrived yet the action is parked and attached
    /// on start.
    pub fn set_cancel_action(&self, job_id: JobId, action: impl Fn() + Send + Sync + 'static) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        let action: CancelAction = Arc::new(action);
        if let Some(record) = inner.jobs.get(&job_id) {
            if !record.status.is_terminal() {
                inner.cancel_actions.insert(job_id, action);
            }
        } else {
            inner.pending_cancel.insert(job_id, action);
            Self::bound_pending(&mut inner, self.max_jobs);
        }
    }

    /// Register the action invoked by [`JobRegistry::rerun`]. The action
    /// submits a fresh job and returns its new id.
    pub fn set_rerun_action(
        &self,
        job_id: JobId,
        action: impl Fn() -> Result<JobId, JobError> + Send + Sync + 'static,
    ) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        let action: RerunAction = Arc::new(action);
        if inner.jobs.contains_key(&job_id) {
            inner.rerun_actions.insert(job_id, action);
        } else {
            inner.pending_rerun.insert(job_id, action);
            Self::bound_pending(&mut inner, self.max_jobs);
        }
    }

    /// Request cancellation of a job.
    ///
    /// The cancel is a request, not a fact: the status moves to `Cancelling`
    /// and the terminal `Cancelled` event arrives asynchronously once the
    /// runner (or job body) observes it. Returns `false` when the job is
    /// unknown, already terminal, or has no cancel action.
    pub fn request_cancel(&self, job_id: JobId) -> bool {
        let (action, flush) = {
            let mut inner = self.inner.lock().expect("registry poisoned");
            let Some(action) = inner.cancel_actions.get(&job_id).cloned() else {
                return false;
            };
            if let Some(record) = inner.jobs.get_mut(&job_id) {
                if record.transition(JobStatus::Cancelling) {
                    inner.ui.dirty.insert(job_id);
                }
            }
            (action, self.collect_ui_flush(&mut inner, false))
        };
        Self::run_ui_flush(flush);
        action();
        true
    }

    /// Re-run a job as a fresh submission.
    ///
    /// The new job gets a new id with its lineage pointing at `job_id`; the
    /// original record is never touched.
    pub fn rerun(&self, job_id: JobId) -> Result<JobId, JobError> {
        let action = {
            let inner = self.inner.lock().expect("registry poisoned");
            inner.rerun_actions.get(&job_id).cloned()
        };
        match action {
            Some(action) => action(),
            None => Err(JobError::Validation(format!(
                "No rerun action registered for job {job_id}"
            ))),
        }
    }

    // -- reads --------------------------------------------------------------

    pub fn get(&self, job_id: JobId) -> Option<JobSnapshot> {
        let inner = self.inner.lock().expect("registry poisoned");
        Self::snapshot_of(&inner, job_id)
    }

    /// Snapshots matching `filter`, newest first.
    pub fn list(&self, filter: &JobFilter) -> Vec<JobSnapshot> {
        let inner = self.inner.lock().expect("registry poisoned");
        let mut snapshots: Vec<JobSnapshot> = inner
            .jobs
            .values()
            .filter(|r| filter.matches(r))
            .map(|r| Self::record_snapshot(&inner, r))
            .collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry poisoned").jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all records and registered actions.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.jobs.clear();
        inner.cancel_actions.clear();
        inner.rerun_actions.clear();
        inner.pending_cancel.clear();
        inner.pending_rerun.clear();
        inner.ui.dirty.clear();
    }

    fn snapshot_of(inner: &RegistryInner, job_id: JobId) -> Option<JobSnapshot> {
        inner
            .jobs
            .get(&job_id)
            .map(|record| Self::record_snapshot(inner, record))
    }

    fn record_snapshot(inner: &RegistryInner, record: &JobRecord) -> JobSnapshot {
        let mut snapshot = record.detached_snapshot();
        snapshot.can_cancel =
            !record.status.is_terminal() && inner.cancel_actions.contains_key(&record.id);
        snapshot.can_rerun = inner.rerun_actions.contains_key(&record.id);
        snapshot
    }
}

fn started_kind(event: &JobEvent) -> JobKind {
    match &event.kind {
        JobEventKind::Started { kind, .. } => *kind,
        // A record created by a non-Started event (partial logs, replay of a
        // truncated file) gets a placeholder kind until Started arrives.
        _ => JobKind::Maintenance,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bus_and_registry() -> (EventBus, Arc<JobRegistry>) {
        let bus = EventBus::new();
        let registry = JobRegistry::attach(&bus, 200, 400);
        (bus, registry)
    }

    fn start(bus: &EventBus, id: JobId, kind: JobKind) {
        bus.publish(&JobEvent::started(id, kind, None, JobPolicy::default()));
    }

    #[test]
    fn started_then_progress_reaches_running() {
        let (bus, registry) = bus_and_registry();
        let id = JobId::new();

        start(&bus, id, JobKind::TrainModel);
        let snap = registry.get(id).unwrap();
        assert_eq!(snap.status, JobStatus::Pending);

        bus.publish(&JobEvent::progress(id, 0.0, Some("started".into())));
        let snap = registry.get(id).unwrap();
        assert_eq!(snap.status, JobStatus::Running);
        assert!(snap.started_at.is_some());
    }

    #[test]
    fn finished_job_is_terminal_with_result() {
        let (bus, registry) = bus_and_registry();
        let id = JobId::new();

        start(&bus, id, JobKind::ExportModel);
        bus.publish(&JobEvent::progress(id, 0.5, None));
        bus.publish(&JobEvent::finished(id, serde_json::json!({"path": "model.onnx"})));

        let snap = registry.get(id).unwrap();
        assert_eq!(snap.status, JobStatus::Finished);
        assert_eq!(snap.progress, 1.0);
        assert_eq!(snap.result, Some(serde_json::json!({"path": "model.onnx"})));
        assert!(snap.finished_at.is_some());
    }

    #[test]
    fn events_after_terminal_are_ignored() {
        let (bus, registry) = bus_and_registry();
        let id = JobId::new();

        start(&bus, id, JobKind::TrainModel);
        bus.publish(&JobEvent::cancelled(id));
        // Late events from a zombie thread must not resurrect the record.
        bus.publish(&JobEvent::progress(id, 0.9, Some("late".into())));
        bus.publish(&JobEvent::finished(id, Value::Null));
        bus.publish(&JobEvent::cancelled(id));

        let snap = registry.get(id).unwrap();
        assert_eq!(snap.status, JobStatus::Cancelled);
        assert_ne!(snap.progress, 0.9);
        assert!(snap.result.is_none());
    }

    #[test]
    fn log_batches_append_and_are_bounded() {
        let bus = EventBus::new();
        let registry = JobRegistry::attach(&bus, 200, 5);
        let id = JobId::new();

        start(&bus, id, JobKind::PrepareDataset);
        bus.publish(&JobEvent::log_batch(
            id,
            (0..8).map(|i| format!("line {i}")).collect(),
        ));

        let snap = registry.get(id).unwrap();
        assert_eq!(snap.log_tail.len(), 5);
        assert_eq!(snap.log_tail.first().unwrap(), "line 3");
        assert_eq!(snap.log_tail.last().unwrap(), "line 7");
    }

    #[test]
    fn non_finite_progress_is_not_stored() {
        let (bus, registry) = bus_and_registry();
        let id = JobId::new();

        start(&bus, id, JobKind::TrainModel);
        bus.publish(&JobEvent::progress(id, 0.25, None));
        bus.publish(&JobEvent::progress(id, f64::NAN, None));
        bus.publish(&JobEvent::progress(id, 7.0, None));

        let snap = registry.get(id).unwrap();
        // NaN ignored; 7.0 clamped.
        assert_eq!(snap.progress, 1.0);
        assert!(snap.progress.is_finite());
    }

    #[test]
    fn retrying_then_progress_returns_to_running() {
        let (bus, registry) = bus_and_registry();
        let id = JobId::new();

        start(&bus, id, JobKind::SyncIntegration);
        bus.publish(&JobEvent::progress(id, 0.1, None));
        bus.publish(&JobEvent::retrying(
            id,
            1,
            3,
            &JobError::Infrastructure("io".into()),
        ));
        assert_eq!(registry.get(id).unwrap().status, JobStatus::Retrying);
        assert_eq!(registry.get(id).unwrap().retry_count, 1);

        bus.publish(&JobEvent::progress(id, 0.2, None));
        assert_eq!(registry.get(id).unwrap().status, JobStatus::Running);
    }

    #[test]
    fn cancel_action_registered_before_start_is_attached_on_start() {
        let (bus, registry) = bus_and_registry();
        let id = JobId::new();
        let calls = Arc::new(AtomicUsize::new(0));

        {
            let calls = Arc::clone(&calls);
            registry.set_cancel_action(id, move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        start(&bus, id, JobKind::TrainModel);

        assert!(registry.get(id).unwrap().can_cancel);
        assert!(registry.request_cancel(id));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.get(id).unwrap().status, JobStatus::Cancelling);
    }

    #[test]
    fn request_cancel_without_action_is_refused() {
        let (bus, registry) = bus_and_registry();
        let id = JobId::new();
        start(&bus, id, JobKind::TrainModel);
        assert!(!registry.request_cancel(id));
        assert_eq!(registry.get(id).unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn cancel_capability_disappears_once_terminal() {
        let (bus, registry) = bus_and_registry();
        let id = JobId::new();
        registry.set_cancel_action(id, || {});
        start(&bus, id, JobKind::TrainModel);
        bus.publish(&JobEvent::progress(id, 0.0, None));
        bus.publish(&JobEvent::finished(id, Value::Null));

        assert!(!registry.get(id).unwrap().can_cancel);
        assert!(!registry.request_cancel(id));
    }

    #[test]
    fn list_filters_and_orders_newest_first() {
        let (bus, registry) = bus_and_registry();
        let train = JobId::new();
        let export = JobId::new();

        start(&bus, train, JobKind::TrainModel);
        start(&bus, export, JobKind::ExportModel);
        bus.publish(&JobEvent::progress(export, 0.5, None));
        bus.publish(&JobEvent::finished(export, Value::Null));

        let all = registry.list(&JobFilter::default());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, export);

        let active = registry.list(&JobFilter {
            active_only: true,
            ..JobFilter::default()
        });
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, train);

        let trains = registry.list(&JobFilter {
            kind: Some(JobKind::TrainModel),
            ..JobFilter::default()
        });
        assert_eq!(trains.len(), 1);
    }

    #[test]
    fn purge_keeps_newest_and_lineage_referenced_records() {
        let bus = EventBus::new();
        let registry = JobRegistry::attach(&bus, 3, 400);

        let ancestor = JobId::new();
        start(&bus, ancestor, JobKind::TrainModel);
        bus.publish(&JobEvent::cancelled(ancestor));

        // A live rerun referencing the ancestor.
        let rerun = JobId::new();
        bus.publish(&JobEvent::started(
            rerun,
            JobKind::TrainModel,
            Some(ancestor),
            JobPolicy::default(),
        ));

        // Enough terminal jobs to trigger purging.
        for _ in 0..4 {
            let id = JobId::new();
            start(&bus, id, JobKind::Maintenance);
            bus.publish(&JobEvent::progress(id, 1.0, None));
            bus.publish(&JobEvent::finished(id, Value::Null));
        }

        assert!(registry.get(ancestor).is_some(), "lineage target purged");
        assert!(registry.get(rerun).is_some());
        assert!(registry.len() <= 5);
    }

    #[test]
    fn ui_subscribers_receive_batched_snapshots() {
        let (bus, registry) = bus_and_registry();
        let seen = Arc::new(Mutex::new(Vec::<JobSnapshot>::new()));
        {
            let seen = Arc::clone(&seen);
            registry.subscribe_ui(move |snapshots| {
                seen.lock().unwrap().extend_from_slice(snapshots);
            });
        }

        let id = JobId::new();
        start(&bus, id, JobKind::TrainModel);
        bus.publish(&JobEvent::progress(id, 0.5, None));
        bus.publish(&JobEvent::finished(id, Value::Null));

        let seen = seen.lock().unwrap();
        // Terminal events flush immediately, so the final state is visible.
        assert!(seen.iter().any(|s| s.status == JobStatus::Finished));
    }

    #[test]
    fn rerun_without_action_is_an_error() {
        let (_bus, registry) = bus_and_registry();
        assert_matches::assert_matches!(
            registry.rerun(JobId::new()),
            Err(JobError::Validation(_))
        );
    }
}
