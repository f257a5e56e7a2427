//! Per-job log batching.
//!
//! Verbose job bodies can emit thousands of lines; publishing one bus event
//! per line would amplify every line into a handler fan-out. Lines are
//! buffered per job and flushed as `LogBatch` events at a bounded cadence.
//! Because every buffer belongs to exactly one job, concurrent jobs can
//! never interleave lines into each other's record.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use atelier_events::sanitize::clean_log_line;
use atelier_events::JobEvent;

use crate::shared::JobShared;

/// Minimum interval between non-forced flushes.
pub(crate) const LOG_BATCH_INTERVAL_MS: u64 = 150;

/// Maximum lines per published batch.
pub(crate) const LOG_BATCH_MAX_LINES: usize = 40;

struct LogBufferInner {
    pending: Vec<String>,
    last_flush: Option<Instant>,
}

/// Buffer of not-yet-published log lines for one job.
pub(crate) struct JobLogBuffer {
    shared: Arc<JobShared>,
    inner: Mutex<LogBufferInner>,
}

impl JobLogBuffer {
    pub(crate) fn new(shared: Arc<JobShared>) -> Arc<Self> {
        Arc::new(Self {
            shared,
            inner: Mutex::new(LogBufferInner {
                pending: Vec::new(),
                last_flush: None,
            }),
        })
    }

    /// Sanitise and buffer one line; blank lines are dropped. Triggers a
    /// cadence-gated flush.
    pub(crate) fn add_line(&self, raw: &str) {
        let line = clean_log_line(raw);
        if line.is_empty() {
            return;
        }
        {
            let mut inner = self.inner.lock().expect("log buffer poisoned");
            inner.pending.push(line);
        }
        self.flush(false);
    }

    /// Publish pending lines in batches of [`LOG_BATCH_MAX_LINES`].
    ///
    /// Non-forced flushes are skipped while the cadence interval has not
    /// elapsed; a forced flush always drains.
    pub(crate) fn flush(&self, force: bool) {
        let batches: Vec<Vec<String>> = {
            let mut inner = self.inner.lock().expect("log buffer poisoned");
            if inner.pending.is_empty() {
                return;
            }
            let now = Instant::now();
            if !force {
                if let Some(last) = inner.last_flush {
                    if now.duration_since(last).as_millis() < u128::from(LOG_BATCH_INTERVAL_MS) {
                        return;
                    }
                }
            }
            inner.last_flush = Some(now);
            let pending = std::mem::take(&mut inner.pending);
            pending
                .chunks(LOG_BATCH_MAX_LINES)
                .map(|chunk| chunk.to_vec())
                .collect()
        };

        for lines in batches {
            self.shared
                .publish(JobEvent::log_batch(self.shared.job_id, lines));
        }
    }
}
