//! Concurrency and persistence properties of the registry + event store.

use std::sync::Arc;

use atelier_core::{JobError, JobId, JobKind, JobPolicy, JobStatus};
use atelier_events::{EventBus, JobEvent, JobEventStore, JsonlJobEventStore, PersistenceSink};
use atelier_jobs::registry::{JobFilter, JobRegistry};
use atelier_jobs::replay::replay;

#[test]
fn concurrent_publication_never_corrupts_the_registry() {
    let bus = Arc::new(EventBus::new());
    let registry = JobRegistry::attach(&bus, 10_000, 100);

    const PUBLISHERS: usize = 8;
    const JOBS_PER_PUBLISHER: usize = 40;

    let mut expected: Vec<(JobId, JobStatus)> = Vec::new();
    let mut threads = Vec::new();
    for p in 0..PUBLISHERS {
        // Pre-assign ids and terminal outcomes so the main thread can verify.
        let jobs: Vec<(JobId, JobStatus)> = (0..JOBS_PER_PUBLISHER)
            .map(|j| {
                let terminal = match (p + j) % 4 {
                    0 => JobStatus::Finished,
                    1 => JobStatus::Failed,
                    2 => JobStatus::Cancelled,
                    _ => JobStatus::TimedOut,
                };
                (JobId::new(), terminal)
            })
            .collect();
        expected.extend(jobs.iter().copied());

        let bus = Arc::clone(&bus);
        threads.push(std::thread::spawn(move || {
            for (job_id, terminal) in jobs {
                bus.publish(&JobEvent::started(
                    job_id,
                    JobKind::TrainModel,
                    None,
                    JobPolicy::default(),
                ));
                for step in 0..10 {
                    bus.publish(&JobEvent::progress(job_id, f64::from(step) / 10.0, None));
                }
                bus.publish(&JobEvent::log_batch(
                    job_id,
                    vec![format!("{job_id} line")],
                ));
                let event = match terminal {
                    JobStatus::Finished => JobEvent::finished(job_id, serde_json::Value::Null),
                    JobStatus::Failed => {
                        JobEvent::failed(job_id, &JobError::Internal("kaput".into()))
                    }
                    JobStatus::Cancelled => JobEvent::cancelled(job_id),
                    _ => JobEvent::timed_out(job_id, 1.0),
                };
                bus.publish(&event);
                // Duplicate terminal: must be suppressed, not applied.
                bus.publish(&JobEvent::cancelled(job_id));
            }
        }));
    }
    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(registry.len(), PUBLISHERS * JOBS_PER_PUBLISHER);
    for (job_id, terminal) in expected {
        let snap = registry.get(job_id).unwrap();
        assert_eq!(snap.status, terminal, "job {job_id}");
        assert!((0.0..=1.0).contains(&snap.progress));
        assert_eq!(snap.log_tail, vec![format!("{job_id} line")]);
        assert!(snap.finished_at.is_some());
    }
}

#[test]
fn replay_rebuilds_the_same_state_every_time() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonlJobEventStore::new(dir.path().join("jobs.jsonl")));

    let bus = EventBus::new();
    let _sink = PersistenceSink::attach(&bus, Arc::clone(&store) as Arc<dyn JobEventStore>);
    let _registry = JobRegistry::attach(&bus, 100, 50);

    let finished = JobId::new();
    bus.publish(&JobEvent::started(
        finished,
        JobKind::ExportModel,
        None,
        JobPolicy::default(),
    ));
    bus.publish(&JobEvent::progress(finished, 0.8, Some("packing".into())));
    bus.publish(&JobEvent::finished(finished, serde_json::json!({"path": "out.onnx"})));

    let cancelled = JobId::new();
    bus.publish(&JobEvent::started(
        cancelled,
        JobKind::TrainModel,
        None,
        JobPolicy::default(),
    ));
    bus.publish(&JobEvent::cancelled(cancelled));

    let first = replay(store.as_ref(), 50);
    let second = replay(store.as_ref(), 50);
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);

    let finished_snap = first.iter().find(|s| s.id == finished).unwrap();
    assert_eq!(finished_snap.status, JobStatus::Finished);
    assert_eq!(finished_snap.progress, 1.0);
}

#[test]
fn restart_with_replay_does_not_reappend_events() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.jsonl");

    let line_count = |path: &std::path::Path| -> usize {
        std::fs::read_to_string(path)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    };

    // First session: three events captured.
    {
        let store = Arc::new(JsonlJobEventStore::new(&path));
        let bus = EventBus::new();
        let _sink = PersistenceSink::attach(&bus, Arc::clone(&store) as Arc<dyn JobEventStore>);
        let _registry = JobRegistry::attach(&bus, 100, 50);

        let id = JobId::new();
        bus.publish(&JobEvent::started(
            id,
            JobKind::PrepareDataset,
            None,
            JobPolicy::default(),
        ));
        bus.publish(&JobEvent::progress(id, 0.2, None));
        bus.publish(&JobEvent::finished(id, serde_json::Value::Null));
    }
    assert_eq!(line_count(&path), 3);

    // Second session: replay seeds the registry without touching the log.
    {
        let store = Arc::new(JsonlJobEventStore::new(&path));
        let bus = EventBus::new();
        let registry =
            JobRegistry::attach_with_store(&bus, store.as_ref(), 100, 50);
        let _sink = PersistenceSink::attach(&bus, Arc::clone(&store) as Arc<dyn JobEventStore>);

        assert_eq!(registry.len(), 1);
        let snap = &registry.list(&JobFilter::default())[0];
        assert_eq!(snap.status, JobStatus::Finished);
    }
    assert_eq!(line_count(&path), 3);
}

#[test]
fn replayed_terminal_records_cannot_be_mutated_by_live_events() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonlJobEventStore::new(dir.path().join("jobs.jsonl"));

    let id = JobId::new();
    store.append(&JobEvent::started(
        id,
        JobKind::TrainModel,
        None,
        JobPolicy::default(),
    ));
    store.append(&JobEvent::cancelled(id));

    let bus = EventBus::new();
    let registry = JobRegistry::attach_with_store(&bus, &store, 100, 50);
    assert_eq!(registry.get(id).unwrap().status, JobStatus::Cancelled);

    // A stale event for the old id arrives after restart.
    bus.publish(&JobEvent::finished(id, serde_json::Value::Null));
    assert_eq!(registry.get(id).unwrap().status, JobStatus::Cancelled);
}
