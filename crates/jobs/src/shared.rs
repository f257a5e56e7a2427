//! Per-job supervision state shared between a runner and its job context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use atelier_core::{normalize_progress, JobError, JobId};
use atelier_events::{EventBus, JobEvent};

/// State shared by the supervisor task, the job body, and the log buffer of
/// one job.
///
/// The `terminal` flag is the single gate through which every terminal event
/// passes; whichever path wins the compare-exchange publishes, every other
/// path becomes a no-op. This is what makes "at most one terminal event per
/// job id" hold even when a timeout races normal completion.
pub(crate) struct JobShared {
    pub(crate) job_id: JobId,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) cancel: CancellationToken,
    /// Monotonic deadline of the current attempt, if the policy has a
    /// timeout. Reset at the start of every attempt.
    deadline: Mutex<Option<Instant>>,
    timeout_secs: Option<f64>,
    terminal: AtomicBool,
}

impl JobShared {
    pub(crate) fn new(
        job_id: JobId,
        bus: Arc<EventBus>,
        cancel: CancellationToken,
        timeout_secs: Option<f64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            job_id,
            bus,
            cancel,
            deadline: Mutex::new(None),
            timeout_secs,
            terminal: AtomicBool::new(false),
        })
    }

    /// Arm the per-attempt deadline.
    pub(crate) fn arm_deadline(&self, deadline: Option<Instant>) {
        *self.deadline.lock().expect("deadline lock poisoned") = deadline;
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock().expect("deadline lock poisoned")
    }

    /// Publish a terminal event unless one was already published.
    ///
    /// Returns `true` if this call won and the event went out.
    pub(crate) fn emit_terminal(&self, event: JobEvent) -> bool {
        debug_assert!(event.kind.is_terminal());
        if self
            .terminal
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.bus.publish(&event);
            true
        } else {
            false
        }
    }

    pub(crate) fn terminal_emitted(&self) -> bool {
        self.terminal.load(Ordering::SeqCst)
    }

    /// Publish a non-terminal event, dropped once the job is terminal.
    pub(crate) fn publish(&self, event: JobEvent) {
        if !self.terminal_emitted() {
            self.bus.publish(&event);
        }
    }

    /// Normalize and publish a progress update.
    pub(crate) fn publish_progress(
        &self,
        value: f64,
        message: Option<String>,
    ) -> Result<(), JobError> {
        let value = normalize_progress(value)?;
        self.publish(JobEvent::progress(self.job_id, value, message));
        Ok(())
    }

    /// Timeout checkpoint.
    ///
    /// On expiry: sets the cancellation token, publishes `TimedOut` (through
    /// the terminal gate), and reports the timeout to the caller. The thread
    /// running the body keeps going until it next observes the token; the
    /// runner accounts for it as a zombie.
    pub(crate) fn check_deadline(&self) -> Result<(), JobError> {
        let Some(deadline) = self.deadline() else {
            return Ok(());
        };
        if Instant::now() < deadline {
            return Ok(());
        }
        let seconds = self.timeout_secs.unwrap_or_default();
        self.cancel.cancel();
        self.emit_terminal(JobEvent::timed_out(self.job_id, seconds));
        Err(JobError::Timeout { seconds })
    }

    pub(crate) fn timeout_secs(&self) -> Option<f64> {
        self.timeout_secs
    }
}
