//! Thread-pool job runner.
//!
//! Runs in-process job bodies on blocking threads without blocking the
//! caller. Cancellation and timeout are cooperative: the body receives a
//! [`JobContext`] and is expected to poll [`JobContext::check_cancelled`]
//! and report progress at reasonable checkpoints. The runner cannot stop a
//! thread that ignores its token; a timed-out attempt that keeps running is
//! counted as a zombie until it returns (see [`JobRunner::zombie_count`]).
//!
//! Output isolation: each job writes through its own [`JobContext::log`]
//! sink keyed to the job id, so concurrently running jobs can never bleed
//! lines into each other's record.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use atelier_core::{JobError, JobId, JobKind, JobPolicy};
use atelier_events::{EventBus, JobEvent};

use crate::logbuf::JobLogBuffer;
use crate::shared::JobShared;

/// An in-process unit of background work.
///
/// Called once per attempt; must be re-callable for retries. Returns an
/// opaque success payload or a [`JobError`].
pub type JobBody =
    Arc<dyn Fn(&JobContext) -> Result<serde_json::Value, JobError> + Send + Sync>;

// ---------------------------------------------------------------------------
// JobContext
// ---------------------------------------------------------------------------

/// Per-job capabilities handed to a running body: cancellation checks,
/// progress reporting with timeout checkpoints, and the job's log sink.
pub struct JobContext {
    shared: Arc<JobShared>,
    logs: Arc<JobLogBuffer>,
}

impl JobContext {
    pub fn job_id(&self) -> JobId {
        self.shared.job_id
    }

    /// Whether cancellation has been requested. Bodies should poll this at
    /// loop boundaries.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Checkpoint form of [`JobContext::is_cancelled`].
    pub fn check_cancelled(&self) -> Result<(), JobError> {
        if self.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Report progress in `[0, 1]` with an optional message.
    ///
    /// Doubles as a timeout checkpoint: once the attempt deadline has
    /// passed this returns [`JobError::Timeout`] (after publishing the
    /// `TimedOut` event) and the body should unwind. Non-finite values are
    /// rejected.
    pub fn progress(&self, value: f64, message: Option<&str>) -> Result<(), JobError> {
        self.shared.check_deadline()?;
        self.shared
            .publish_progress(value, message.map(str::to_string))
    }

    /// Append a line to this job's log. Batched onto the bus; never visible
    /// to any other job's record.
    pub fn log(&self, line: impl AsRef<str>) {
        self.logs.add_line(line.as_ref());
    }
}

// ---------------------------------------------------------------------------
// JobHandle
// ---------------------------------------------------------------------------

/// Handle returned by [`JobRunner::submit`].
#[derive(Clone)]
pub struct JobHandle {
    job_id: JobId,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl JobHandle {
    pub(crate) fn new(
        job_id: JobId,
        cancel: CancellationToken,
        done: watch::Receiver<bool>,
    ) -> Self {
        Self {
            job_id,
            cancel,
            done,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Request cooperative cancellation. The effect is observed via a later
    /// `Cancelled` event, never synchronously.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait until the job has published its terminal event.
    pub async fn wait(&self) {
        let mut done = self.done.clone();
        // Only fails when the supervisor is gone, which also means done.
        let _ = done.wait_for(|finished| *finished).await;
    }

    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }
}

// ---------------------------------------------------------------------------
// JobRunner
// ---------------------------------------------------------------------------

/// Schedules job bodies onto blocking threads and publishes their lifecycle
/// events.
pub struct JobRunner {
    bus: Arc<EventBus>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
    supervisors: Mutex<JoinSet<()>>,
    zombies: Arc<AtomicUsize>,
    stopped: AtomicBool,
}

impl JobRunner {
    /// `max_workers` bounds the number of concurrently executing bodies;
    /// further submissions queue.
    pub fn new(bus: Arc<EventBus>, max_workers: usize) -> Self {
        Self {
            bus,
            slots: Arc::new(Semaphore::new(max_workers.max(1))),
            shutdown: CancellationToken::new(),
            supervisors: Mutex::new(JoinSet::new()),
            zombies: Arc::new(AtomicUsize::new(0)),
            stopped: AtomicBool::new(false),
        }
    }

    /// Submit a job. Publishes `Started` before returning; the body runs on
    /// a blocking thread once a worker slot is free.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(
        &self,
        kind: JobKind,
        body: JobBody,
        policy: JobPolicy,
    ) -> Result<JobHandle, JobError> {
        self.submit_inner(kind, None, body, policy)
    }

    /// Submit a rerun of `lineage`; identical to [`JobRunner::submit`] except
    /// the `Started` event carries the original job id.
    pub fn submit_rerun(
        &self,
        kind: JobKind,
        lineage: JobId,
        body: JobBody,
        policy: JobPolicy,
    ) -> Result<JobHandle, JobError> {
        self.submit_inner(kind, Some(lineage), body, policy)
    }

    fn submit_inner(
        &self,
        kind: JobKind,
        lineage: Option<JobId>,
        body: JobBody,
        policy: JobPolicy,
    ) -> Result<JobHandle, JobError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(JobError::Validation(
                "Job runner is shutting down".to_string(),
            ));
        }

        let job_id = JobId::new();
        let cancel = self.shutdown.child_token();
        let timeout_secs = policy.timeout.map(|t| t.as_secs_f64());
        let shared = JobShared::new(job_id, Arc::clone(&self.bus), cancel.clone(), timeout_secs);
        let logs = JobLogBuffer::new(Arc::clone(&shared));
        let (done_tx, done_rx) = watch::channel(false);

        self.bus
            .publish(&JobEvent::started(job_id, kind, lineage, policy.clone()));

        let supervisor = Supervisor {
            shared,
            logs,
            body,
            policy,
            slots: Arc::clone(&self.slots),
            zombies: Arc::clone(&self.zombies),
        };
        self.supervisors
            .lock()
            .expect("supervisor set poisoned")
            .spawn(async move {
                supervisor.run().await;
                let _ = done_tx.send(true);
            });

        Ok(JobHandle::new(job_id, cancel, done_rx))
    }

    /// Number of timed-out bodies still occupying a thread. Surfaced so an
    /// operator can see leaked workers instead of wondering where the pool
    /// went.
    pub fn zombie_count(&self) -> usize {
        self.zombies.load(Ordering::SeqCst)
    }

    /// Stop intake, cancel in-flight jobs, and wait up to `grace` for
    /// supervisors to finish. Idempotent; zombie threads are not waited on.
    pub async fn shutdown(&self, grace: Duration) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let mut supervisors = {
            let mut guard = self.supervisors.lock().expect("supervisor set poisoned");
            std::mem::take(&mut *guard)
        };
        let drained = tokio::time::timeout(grace, async {
            while supervisors.join_next().await.is_some() {}
        })
        .await;

        let zombies = self.zombie_count();
        if drained.is_err() {
            tracing::warn!(
                remaining = supervisors.len(),
                "Job runner shutdown grace expired with supervisors still running",
            );
            supervisors.abort_all();
        }
        if zombies > 0 {
            tracing::warn!(zombies, "Job runner shut down with zombie worker threads");
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct Supervisor {
    shared: Arc<JobShared>,
    logs: Arc<JobLogBuffer>,
    body: JobBody,
    policy: JobPolicy,
    slots: Arc<Semaphore>,
    zombies: Arc<AtomicUsize>,
}

enum AttemptOutcome {
    Success(serde_json::Value),
    Error(JobError),
    /// Deadline expired while the body was still on its thread; `TimedOut`
    /// has already been published and the thread is now a zombie.
    Abandoned,
}

impl Supervisor {
    async fn run(self) {
        let job_id = self.shared.job_id;
        let cancel = self.shared.cancel.clone();

        // Wait for a worker slot; cancellation while queued ends the job
        // without ever running the body.
        let permit = tokio::select! {
            permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.shared
                        .emit_terminal(JobEvent::failed(job_id, &JobError::Internal(
                            "Worker pool closed".to_string(),
                        )));
                    return;
                }
            },
            _ = cancel.cancelled() => {
                self.shared.emit_terminal(JobEvent::cancelled(job_id));
                return;
            }
        };
        let mut permit = Some(permit);

        // Leaving the queue for a worker thread.
        let _ = self.shared.publish_progress(0.0, Some("started".to_string()));

        let max_attempts = self.policy.max_attempts();
        let job_started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            if cancel.is_cancelled() {
                self.logs.flush(true);
                self.shared.emit_terminal(JobEvent::cancelled(job_id));
                break;
            }

            let outcome = self.run_attempt(&mut permit).await;

            match outcome {
                AttemptOutcome::Success(result) => {
                    if cancel.is_cancelled() {
                        self.shared.emit_terminal(JobEvent::cancelled(job_id));
                    } else if self.shared.check_deadline().is_err() {
                        // After-completion checkpoint; TimedOut already out.
                    } else {
                        let _ = self
                            .shared
                            .publish_progress(1.0, Some("finished".to_string()));
                        self.shared.emit_terminal(JobEvent::finished(job_id, result));
                    }
                    break;
                }
                AttemptOutcome::Abandoned => {
                    // Terminal already published by the timeout arm.
                    break;
                }
                AttemptOutcome::Error(JobError::Cancelled) => {
                    self.shared.emit_terminal(JobEvent::cancelled(job_id));
                    break;
                }
                AttemptOutcome::Error(JobError::Timeout { seconds }) => {
                    // Normally published at the checkpoint that noticed; the
                    // gate makes a second emit a no-op either way.
                    self.shared
                        .emit_terminal(JobEvent::timed_out(job_id, seconds));
                    break;
                }
                AttemptOutcome::Error(error) => {
                    if cancel.is_cancelled() {
                        self.shared.emit_terminal(JobEvent::cancelled(job_id));
                        break;
                    }
                    let within_deadline = match self.policy.retry_deadline {
                        Some(deadline) => job_started.elapsed() < deadline,
                        None => true,
                    };
                    if error.is_retryable() && attempt < max_attempts && within_deadline {
                        self.shared.publish(JobEvent::retrying(
                            job_id,
                            attempt,
                            max_attempts,
                            &error,
                        ));
                        let delay = self.policy.backoff_delay(attempt);
                        let fraction =
                            (f64::from(attempt - 1) / f64::from(max_attempts)).min(0.95);
                        let _ = self.shared.publish_progress(
                            fraction.max(0.0),
                            Some(format!("retrying in {:.1}s", delay.as_secs_f64())),
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => continue,
                            _ = cancel.cancelled() => {
                                self.shared.emit_terminal(JobEvent::cancelled(job_id));
                                break;
                            }
                        }
                    }
                    self.shared.emit_terminal(JobEvent::failed(job_id, &error));
                    break;
                }
            }
        }
    }

    /// Run the body once on a blocking thread, racing the attempt deadline.
    async fn run_attempt(
        &self,
        permit: &mut Option<tokio::sync::OwnedSemaphorePermit>,
    ) -> AttemptOutcome {
        let deadline = self.policy.timeout.map(|t| Instant::now() + t);
        self.shared.arm_deadline(deadline);

        let context = JobContext {
            shared: Arc::clone(&self.shared),
            logs: Arc::clone(&self.logs),
        };
        let body = Arc::clone(&self.body);
        let logs = Arc::clone(&self.logs);
        let mut work = tokio::task::spawn_blocking(move || {
            let result = body(&context);
            logs.flush(true);
            result
        });

        let joined = if let Some(deadline) = deadline {
            tokio::select! {
                joined = &mut work => Some(joined),
                _ = tokio::time::sleep_until(deadline) => None,
            }
        } else {
            Some((&mut work).await)
        };

        let Some(joined) = joined else {
            // Deadline expired with the body still on its thread.
            let job_id = self.shared.job_id;
            let seconds = self.shared.timeout_secs().unwrap_or_default();
            self.shared.cancel.cancel();
            self.shared.emit_terminal(JobEvent::timed_out(job_id, seconds));

            // The body keeps running. Keep its worker slot occupied until
            // the thread actually returns, and count it so the leak is
            // observable.
            self.zombies.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(
                job_id = %job_id,
                "Job timed out; worker thread continues until it observes the token",
            );
            let zombies = Arc::clone(&self.zombies);
            let held_permit = permit.take();
            tokio::spawn(async move {
                let _ = work.await;
                drop(held_permit);
                zombies.fetch_sub(1, Ordering::SeqCst);
                tracing::info!(%job_id, "Zombie worker thread finished");
            });
            return AttemptOutcome::Abandoned;
        };

        match joined {
            Ok(Ok(value)) => AttemptOutcome::Success(value),
            Ok(Err(error)) => AttemptOutcome::Error(error),
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    format!("Job body panicked: {join_error}")
                } else {
                    format!("Job body was aborted: {join_error}")
                };
                AttemptOutcome::Error(JobError::Internal(message))
            }
        }
    }
}
