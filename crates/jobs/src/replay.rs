//! Startup replay of the persisted event log.
//!
//! Rebuilds job records by folding events in append order. The fold is a
//! pure function of the event sequence, so replaying the same log any number
//! of times yields the same records. Per job id, events after a terminal
//! event are ignored — terminal state is final.

use std::collections::HashMap;

use atelier_core::JobId;
use atelier_events::{JobEvent, JobEventKind, JobEventStore};

use crate::registry::{JobRecord, JobSnapshot};

/// Fold `events` into per-job records.
pub(crate) fn fold(events: &[JobEvent], max_log_lines: usize) -> HashMap<JobId, JobRecord> {
    let mut records: HashMap<JobId, JobRecord> = HashMap::new();
    for event in events {
        // Skip records that never saw a Started event; a truncated or
        // rotated log can open mid-job and such fragments have no kind,
        // policy, or creation time worth showing.
        match records.entry(event.job_id) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                entry.get_mut().apply(event, max_log_lines);
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                if let JobEventKind::Started { .. } = event.kind {
                    let record = entry.insert(new_record(event));
                    record.apply(event, max_log_lines);
                }
            }
        }
    }
    records
}

fn new_record(event: &JobEvent) -> JobRecord {
    let kind = match &event.kind {
        JobEventKind::Started { kind, .. } => *kind,
        _ => unreachable!("only Started events create replay records"),
    };
    JobRecord::seed(event.job_id, kind, event.timestamp)
}

/// Reconstruct job state from a store, returned as read-only snapshots
/// (newest first). The registry uses the same fold internally at startup.
pub fn replay(store: &dyn JobEventStore, max_log_lines: usize) -> Vec<JobSnapshot> {
    let records = fold(&store.load(), max_log_lines);
    let mut snapshots: Vec<JobSnapshot> = records
        .values()
        .map(JobRecord::detached_snapshot)
        .collect();
    snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
    snapshots
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_core::{JobError, JobKind, JobPolicy, JobStatus};
    use serde_json::Value;

    fn started(id: JobId) -> JobEvent {
        JobEvent::started(id, JobKind::TrainModel, None, JobPolicy::default())
    }

    #[test]
    fn fold_rebuilds_terminal_state() {
        let id = JobId::new();
        let events = vec![
            started(id),
            JobEvent::progress(id, 0.3, Some("epoch 3".into())),
            JobEvent::log_batch(id, vec!["line a".into(), "line b".into()]),
            JobEvent::finished(id, serde_json::json!({"best_epoch": 7})),
        ];

        let records = fold(&events, 400);
        let record = &records[&id];
        assert_eq!(record.status, JobStatus::Finished);
        assert_eq!(record.progress, 1.0);
        assert_eq!(record.log_tail, vec!["line a", "line b"]);
        assert!(record.result.is_some());
    }

    #[test]
    fn fold_is_idempotent() {
        let id = JobId::new();
        let other = JobId::new();
        let events = vec![
            started(id),
            JobEvent::progress(id, 0.5, None),
            started(other),
            JobEvent::progress(other, 0.1, None),
            JobEvent::retrying(other, 1, 2, &JobError::Infrastructure("io".into())),
            JobEvent::failed(other, &JobError::Infrastructure("io again".into())),
            JobEvent::cancelled(id),
        ];

        let first = fold(&events, 400);
        let second = fold(&events, 400);
        assert_eq!(first.len(), second.len());
        for (job_id, record) in &first {
            let again = &second[job_id];
            assert_eq!(record.status, again.status);
            assert_eq!(record.progress, again.progress);
            assert_eq!(record.log_tail, again.log_tail);
            assert_eq!(record.retry_count, again.retry_count);
        }
    }

    #[test]
    fn events_after_terminal_are_ignored_during_fold() {
        let id = JobId::new();
        let events = vec![
            started(id),
            JobEvent::cancelled(id),
            JobEvent::progress(id, 0.8, None),
            JobEvent::finished(id, Value::Null),
        ];

        let records = fold(&events, 400);
        let record = &records[&id];
        assert_eq!(record.status, JobStatus::Cancelled);
        assert_eq!(record.progress, 0.0);
        assert!(record.result.is_none());
    }

    #[test]
    fn fragments_without_started_are_dropped() {
        let id = JobId::new();
        let events = vec![
            JobEvent::progress(id, 0.9, None),
            JobEvent::finished(id, Value::Null),
        ];
        assert!(fold(&events, 400).is_empty());
    }
}
