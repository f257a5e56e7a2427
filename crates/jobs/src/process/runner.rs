//! Process-pool job runner.
//!
//! Each job runs as one child process. The parent reads envelopes from the
//! child's stdout and log lines from its stderr, enforces a monotonic
//! timeout independent of message arrival (a silently hung child is still
//! bounded), and reports success only when an explicit `result` envelope
//! arrived — process exit alone is never trusted. Cancellation here is
//! effective: the child is killed, not asked.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use atelier_core::{JobError, JobId, JobKind, JobPolicy};
use atelier_events::{EventBus, JobEvent};

use crate::logbuf::JobLogBuffer;
use crate::process::envelope::{parse_envelope, IpcEnvelope};
use crate::runner::JobHandle;
use crate::shared::JobShared;

/// How long to keep draining stdout/stderr after the child is observed to
/// have exited. Messages can still sit in the pipe buffer at the moment the
/// OS reports process death.
const DRAIN_GRACE: Duration = Duration::from_millis(300);

/// How long to wait for a child to be reaped after the protocol concluded.
const REAP_TIMEOUT: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Spec
// ---------------------------------------------------------------------------

/// Description of the child command that executes a process job.
#[derive(Debug, Clone)]
pub struct ProcessJobSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

impl ProcessJobSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn validate(&self) -> Result<(), JobError> {
        if self.program.as_os_str().is_empty() {
            return Err(JobError::Validation(
                "Process job program must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Executes job commands in isolated child processes.
pub struct ProcessJobRunner {
    bus: Arc<EventBus>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
    supervisors: Mutex<JoinSet<()>>,
    stopped: AtomicBool,
}

impl ProcessJobRunner {
    /// `max_children` bounds the number of concurrently running child
    /// processes; further submissions queue.
    pub fn new(bus: Arc<EventBus>, max_children: usize) -> Self {
        Self {
            bus,
            slots: Arc::new(Semaphore::new(max_children.max(1))),
            shutdown: CancellationToken::new(),
            supervisors: Mutex::new(JoinSet::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Submit a process job. Publishes `Started` before returning; the child
    /// is spawned once a slot is free.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(
        &self,
        kind: JobKind,
        spec: ProcessJobSpec,
        policy: JobPolicy,
    ) -> Result<JobHandle, JobError> {
        self.submit_inner(kind, None, spec, policy)
    }

    /// Submit a rerun of `lineage` with the same child command.
    pub fn submit_rerun(
        &self,
        kind: JobKind,
        lineage: JobId,
        spec: ProcessJobSpec,
        policy: JobPolicy,
    ) -> Result<JobHandle, JobError> {
        self.submit_inner(kind, Some(lineage), spec, policy)
    }

    fn submit_inner(
        &self,
        kind: JobKind,
        lineage: Option<JobId>,
        spec: ProcessJobSpec,
        policy: JobPolicy,
    ) -> Result<JobHandle, JobError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(JobError::Validation(
                "Process job runner is shutting down".to_string(),
            ));
        }
        spec.validate()?;

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
            spec,
            policy,
            slots: Arc::clone(&self.slots),
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

    /// Stop intake, kill in-flight children, and wait up to `grace` for
    /// supervisors to finish. Idempotent.
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
        if drained.is_err() {
            tracing::warn!(
                remaining = supervisors.len(),
                "Process runner shutdown grace expired with supervisors still running",
            );
            supervisors.abort_all();
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct Supervisor {
    shared: Arc<JobShared>,
    logs: Arc<JobLogBuffer>,
    spec: ProcessJobSpec,
    policy: JobPolicy,
    slots: Arc<Semaphore>,
}

/// Why the protocol loop ended.
enum LoopEnd {
    /// A `result` envelope arrived.
    Result(serde_json::Value),
    /// The attempt failed (error envelope, protocol violation, cancel,
    /// timeout, IO error).
    Failed(JobError),
    /// Streams/process concluded without any terminal envelope.
    ExitedWithoutPayload,
}

impl Supervisor {
    async fn run(self) {
        let job_id = self.shared.job_id;
        let cancel = self.shared.cancel.clone();

        let _permit = tokio::select! {
            permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.shared.emit_terminal(JobEvent::failed(
                        job_id,
                        &JobError::Internal("Process pool closed".to_string()),
                    ));
                    return;
                }
            },
            _ = cancel.cancelled() => {
                self.shared.emit_terminal(JobEvent::cancelled(job_id));
                return;
            }
        };

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

            match self.run_attempt().await {
                Ok(result) => {
                    if cancel.is_cancelled() {
                        self.shared.emit_terminal(JobEvent::cancelled(job_id));
                    } else {
                        let _ = self
                            .shared
                            .publish_progress(1.0, Some("finished".to_string()));
                        self.shared
                            .emit_terminal(JobEvent::finished(job_id, result));
                    }
                    break;
                }
                Err(JobError::Cancelled) => {
                    self.shared.emit_terminal(JobEvent::cancelled(job_id));
                    break;
                }
                Err(JobError::Timeout { seconds }) => {
                    self.shared
                        .emit_terminal(JobEvent::timed_out(job_id, seconds));
                    break;
                }
                Err(error) => {
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

    /// Spawn the child once and drive the envelope protocol to a conclusion.
    async fn run_attempt(&self) -> Result<serde_json::Value, JobError> {
        let cancel = self.shared.cancel.clone();
        let deadline = self.policy.timeout.map(|t| Instant::now() + t);
        self.shared.arm_deadline(deadline);

        let mut command = Command::new(&self.spec.program);
        command
            .args(&self.spec.args)
            .envs(self.spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Safety net: a supervisor aborted mid-protocol must not orphan
            // the child.
            .kill_on_drop(true);
        if let Some(dir) = &self.spec.current_dir {
            command.current_dir(dir);
        }

        // A spawn failure creates no pipes; dropping the command here is the
        // whole cleanup, performed before the failure is reported.
        let mut child = command.spawn().map_err(|e| {
            JobError::Infrastructure(format!(
                "Failed to spawn {}: {e}",
                self.spec.program.display()
            ))
        })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(REAP_TIMEOUT, child.wait()).await;
            return Err(JobError::Internal(
                "Child process spawned without piped stdio".to_string(),
            ));
        };
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut out_open = true;
        let mut err_open = true;
        let mut exit_status: Option<std::process::ExitStatus> = None;
        let mut drain_deadline: Option<Instant> = None;

        // Arm bodies must not touch `child` directly: the `child.wait()`
        // future in the last arm holds its borrow for the whole select
        // block. Kills happen after the loop, keyed off `end`.
        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break LoopEnd::Failed(JobError::Cancelled);
                }

                // Checked independent of message arrival, on the monotonic
                // clock, so a child that never writes anything is bounded.
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(far_future)),
                        if deadline.is_some() => {
                    let seconds = self.shared.timeout_secs().unwrap_or_default();
                    break LoopEnd::Failed(JobError::Timeout { seconds });
                }

                _ = tokio::time::sleep_until(drain_deadline.unwrap_or_else(far_future)),
                        if drain_deadline.is_some() => {
                    break LoopEnd::ExitedWithoutPayload;
                }

                line = out_lines.next_line(), if out_open => match line {
                    Ok(Some(line)) => match self.handle_stdout_line(&line) {
                        Ok(Some(result)) => break LoopEnd::Result(result),
                        Ok(None) => {}
                        Err(error) => break LoopEnd::Failed(error),
                    },
                    Ok(None) => out_open = false,
                    Err(e) => {
                        break LoopEnd::Failed(JobError::Infrastructure(format!(
                            "Failed reading child stdout: {e}"
                        )));
                    }
                },

                line = err_lines.next_line(), if err_open => match line {
                    Ok(Some(line)) => self.logs.add_line(&line),
                    Ok(None) | Err(_) => err_open = false,
                },

                status = child.wait(), if exit_status.is_none() => match status {
                    Ok(status) => {
                        exit_status = Some(status);
                        // Messages may still be in flight in the pipe
                        // buffers; drain for a short grace window.
                        drain_deadline = Some(Instant::now() + DRAIN_GRACE);
                    }
                    Err(e) => {
                        break LoopEnd::Failed(JobError::Infrastructure(format!(
                            "Failed waiting for child: {e}"
                        )));
                    }
                },
            }

            if !out_open && !err_open && exit_status.is_some() {
                break LoopEnd::ExitedWithoutPayload;
            }
        };

        self.logs.flush(true);
        // A failed conclusion (cancel, timeout, protocol violation) does not
        // wait for the child's goodwill.
        if matches!(end, LoopEnd::Failed(_)) {
            let _ = child.start_kill();
        }
        let exit_status = reap(&mut child, exit_status).await;

        match end {
            LoopEnd::Result(value) => Ok(value),
            LoopEnd::Failed(error) => Err(error),
            LoopEnd::ExitedWithoutPayload => Err(JobError::ChildCrash {
                exit_code: exit_status.and_then(|s| s.code()),
            }),
        }
    }

    fn handle_stdout_line(&self, line: &str) -> Result<Option<serde_json::Value>, JobError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        match parse_envelope(trimmed) {
            Err(e) => Err(JobError::Protocol(format!(
                "Malformed envelope from child: {e}"
            ))),
            Ok(IpcEnvelope::Progress { value, message }) => {
                if !value.is_finite() {
                    return Err(JobError::Protocol(format!(
                        "Non-finite progress from child: {value}"
                    )));
                }
                // Finite out-of-range values are normalized, not dropped.
                let _ = self.shared.publish_progress(value, message);
                Ok(None)
            }
            Ok(IpcEnvelope::Log { line }) => {
                self.logs.add_line(&line);
                Ok(None)
            }
            Ok(IpcEnvelope::Result { value }) => Ok(Some(value)),
            Ok(IpcEnvelope::Error { message }) => Err(JobError::Internal(message)),
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}

/// Collect the child's exit status, escalating to a kill if it lingers.
async fn reap(
    child: &mut Child,
    already: Option<std::process::ExitStatus>,
) -> Option<std::process::ExitStatus> {
    if let Some(status) = already {
        return Some(status);
    }
    match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Failed to reap job child process");
            None
        }
        Err(_) => {
            let _ = child.start_kill();
            match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => Some(status),
                _ => {
                    tracing::warn!("Job child process survived kill; abandoning");
                    None
                }
            }
        }
    }
}
