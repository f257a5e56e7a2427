//! Composition root for the job subsystem.
//!
//! Builds the bus, event store, persistence sink, registry, and both
//! runners once, and passes references explicitly — no global service
//! locator anywhere. Collaborators (UI, use-cases) submit work through
//! [`JobSystem::submit`]/[`JobSystem::submit_process`] and read state
//! through the registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use atelier_core::{JobError, JobId, JobKind, JobPolicy, JobSystemConfig};
use atelier_events::{EventBus, JobEventStore, JsonlJobEventStore, PersistenceSink};

use crate::process::{ProcessJobRunner, ProcessJobSpec};
use crate::registry::{JobRegistry, JobSnapshot};
use crate::runner::{JobBody, JobHandle, JobRunner};

/// Handle returned by the submission facade.
///
/// Wraps the runner handle so that cancel goes through the registry (which
/// moves the record to `Cancelling`) and rerun is available directly.
#[derive(Clone)]
pub struct SystemHandle {
    inner: JobHandle,
    registry: Arc<JobRegistry>,
}

impl SystemHandle {
    pub fn job_id(&self) -> JobId {
        self.inner.job_id()
    }

    /// Request cancellation. Asynchronous: the record moves to `Cancelling`
    /// now and reaches `Cancelled` once the runner observes the request.
    pub fn cancel(&self) -> bool {
        self.registry.request_cancel(self.inner.job_id())
    }

    /// Submit a fresh job repeating this one. Returns the new job id, whose
    /// record carries this job's id as lineage.
    pub fn rerun(&self) -> Result<JobId, JobError> {
        self.registry.rerun(self.inner.job_id())
    }

    /// Current registry snapshot of this job's record.
    pub fn snapshot(&self) -> Option<JobSnapshot> {
        self.registry.get(self.inner.job_id())
    }

    /// Wait until the job has published its terminal event.
    pub async fn wait(&self) {
        self.inner.wait().await;
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

/// The wired-up job orchestration core.
pub struct JobSystem {
    config: JobSystemConfig,
    bus: Arc<EventBus>,
    store: Arc<JsonlJobEventStore>,
    registry: Arc<JobRegistry>,
    runner: Arc<JobRunner>,
    process_runner: Arc<ProcessJobRunner>,
    stopped: AtomicBool,
}

impl JobSystem {
    /// Build the subsystem: replay the persisted event log into the
    /// registry, then attach the persistence sink so only new events are
    /// appended.
    pub fn new(config: JobSystemConfig) -> Self {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(JsonlJobEventStore::new(&config.event_log));
        let registry = JobRegistry::attach_with_store(
            &bus,
            store.as_ref(),
            config.max_jobs,
            config.max_log_lines,
        );
        let store_sink: Arc<dyn atelier_events::JobEventStore> = store.clone();
        let _sink = PersistenceSink::attach(&bus, store_sink);
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&bus),
            config.max_worker_threads,
        ));
        let process_runner = Arc::new(ProcessJobRunner::new(
            Arc::clone(&bus),
            config.max_process_jobs,
        ));
        Self {
            config,
            bus,
            store,
            registry,
            runner,
            process_runner,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<JsonlJobEventStore> {
        &self.store
    }

    pub fn config(&self) -> &JobSystemConfig {
        &self.config
    }

    /// Submit an in-process job to the thread runner.
    pub fn submit(
        &self,
        kind: JobKind,
        body: JobBody,
        policy: JobPolicy,
    ) -> Result<SystemHandle, JobError> {
        let handle = self.runner.submit(kind, Arc::clone(&body), policy.clone())?;
        wire_thread_job(
            Arc::clone(&self.runner),
            Arc::clone(&self.registry),
            &handle,
            kind,
            body,
            policy,
        );
        Ok(SystemHandle {
            inner: handle,
            registry: Arc::clone(&self.registry),
        })
    }

    /// Submit a process-isolated job.
    pub fn submit_process(
        &self,
        kind: JobKind,
        spec: ProcessJobSpec,
        policy: JobPolicy,
    ) -> Result<SystemHandle, JobError> {
        let handle = self
            .process_runner
            .submit(kind, spec.clone(), policy.clone())?;
        wire_process_job(
            Arc::clone(&self.process_runner),
            Arc::clone(&self.registry),
            &handle,
            kind,
            spec,
            policy,
        );
        Ok(SystemHandle {
            inner: handle,
            registry: Arc::clone(&self.registry),
        })
    }

    /// Tear the subsystem down: stop intake, cancel in-flight jobs (killing
    /// child processes), and wait out the configured grace period.
    /// Idempotent; safe to call from application shutdown paths more than
    /// once.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let grace = self.config.shutdown_grace;
        self.runner.shutdown(grace).await;
        self.process_runner.shutdown(grace).await;
        // Appends are synchronous per event; once the runners are quiet the
        // log is complete on disk.
        let health = self.store.health();
        if health.append_failures > 0 {
            tracing::warn!(
                failures = health.append_failures,
                last_error = health.last_error.as_deref().unwrap_or(""),
                "Job event log had persistence failures this session",
            );
        }
        tracing::info!("Job system shut down");
    }
}

/// Register cancel and rerun actions for a thread job. The rerun action
/// resubmits the same body/policy as a new job whose lineage points at the
/// job it repeats, and wires that new job the same way.
fn wire_thread_job(
    runner: Arc<JobRunner>,
    registry: Arc<JobRegistry>,
    handle: &JobHandle,
    kind: JobKind,
    body: JobBody,
    policy: JobPolicy,
) {
    let job_id = handle.job_id();
    let token = handle.cancel_token();
    registry.set_cancel_action(job_id, move || token.cancel());

    registry.set_rerun_action(job_id, {
        let registry = Arc::clone(&registry);
        move || {
            let handle =
                runner.submit_rerun(kind, job_id, Arc::clone(&body), policy.clone())?;
            wire_thread_job(
                Arc::clone(&runner),
                Arc::clone(&registry),
                &handle,
                kind,
                Arc::clone(&body),
                policy.clone(),
            );
            Ok(handle.job_id())
        }
    });
}

/// Process-job twin of [`wire_thread_job`].
fn wire_process_job(
    runner: Arc<ProcessJobRunner>,
    registry: Arc<JobRegistry>,
    handle: &JobHandle,
    kind: JobKind,
    spec: ProcessJobSpec,
    policy: JobPolicy,
) {
    let job_id = handle.job_id();
    let token = handle.cancel_token();
    registry.set_cancel_action(job_id, move || token.cancel());

    registry.set_rerun_action(job_id, {
        let registry = Arc::clone(&registry);
        move || {
            let handle = runner.submit_rerun(kind, job_id, spec.clone(), policy.clone())?;
            wire_process_job(
                Arc::clone(&runner),
                Arc::clone(&registry),
                &handle,
                kind,
                spec.clone(),
                policy.clone(),
            );
            Ok(handle.job_id())
        }
    });
}
