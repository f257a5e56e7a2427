//! Facade-level tests: submission, cancel/rerun lineage, restart recovery.

use std::sync::Arc;
use std::time::Duration;

use atelier_core::{JobError, JobKind, JobPolicy, JobStatus, JobSystemConfig};
use atelier_jobs::runner::JobBody;
use atelier_jobs::system::JobSystem;

fn config_in(dir: &tempfile::TempDir) -> JobSystemConfig {
    JobSystemConfig {
        state_dir: dir.path().to_path_buf(),
        event_log: dir.path().join("jobs.jsonl"),
        shutdown_grace: Duration::from_secs(2),
        ..JobSystemConfig::default()
    }
}

async fn wait_for_status(
    system: &JobSystem,
    job_id: atelier_core::JobId,
    status: JobStatus,
) {
    for _ in 0..100 {
        if system.registry().get(job_id).map(|s| s.status) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "job {job_id} never reached {status}, currently {:?}",
        system.registry().get(job_id).map(|s| s.status)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_then_rerun_creates_lineage() {
    let dir = tempfile::tempdir().unwrap();
    let system = JobSystem::new(config_in(&dir));

    let body: JobBody = Arc::new(|ctx| {
        loop {
            ctx.check_cancelled()?;
            std::thread::sleep(Duration::from_millis(10));
        }
    });
    let handle = system
        .submit(JobKind::TrainModel, body, JobPolicy::default())
        .unwrap();
    let original = handle.job_id();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handle.cancel());
    // Cancellation is a request first, a fact later.
    let snap = system.registry().get(original).unwrap();
    assert!(matches!(
        snap.status,
        JobStatus::Cancelling | JobStatus::Cancelled
    ));
    handle.wait().await;
    assert_eq!(
        system.registry().get(original).unwrap().status,
        JobStatus::Cancelled
    );

    // Rerun: a new id whose lineage points at the original.
    let rerun_id = handle.rerun().unwrap();
    assert_ne!(rerun_id, original);
    let rerun_snap = system.registry().get(rerun_id).unwrap();
    assert_eq!(rerun_snap.lineage, Some(original));

    // The original record was never touched by the rerun.
    let original_snap = system.registry().get(original).unwrap();
    assert_eq!(original_snap.status, JobStatus::Cancelled);
    assert_eq!(original_snap.lineage, None);

    // The rerun is cancellable through the registry like any other job.
    assert!(system.registry().request_cancel(rerun_id));
    wait_for_status(&system, rerun_id, JobStatus::Cancelled).await;

    system.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rerun_of_a_rerun_chains_lineage() {
    let dir = tempfile::tempdir().unwrap();
    let system = JobSystem::new(config_in(&dir));

    let body: JobBody = Arc::new(|_ctx| Ok(serde_json::Value::Null));
    let handle = system
        .submit(JobKind::ExportModel, body, JobPolicy::default())
        .unwrap();
    let first = handle.job_id();
    handle.wait().await;

    let second = handle.rerun().unwrap();
    wait_for_status(&system, second, JobStatus::Finished).await;
    let third = system.registry().rerun(second).unwrap();
    wait_for_status(&system, third, JobStatus::Finished).await;

    assert_eq!(system.registry().get(second).unwrap().lineage, Some(first));
    assert_eq!(system.registry().get(third).unwrap().lineage, Some(second));

    system.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn process_jobs_share_the_same_cancel_surface() {
    let dir = tempfile::tempdir().unwrap();
    let system = JobSystem::new(config_in(&dir));

    let spec = atelier_jobs::process::ProcessJobSpec::new("/bin/sh")
        .arg("-c")
        .arg("sleep 30");
    let handle = system
        .submit_process(JobKind::RunDetection, spec, JobPolicy::default())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    // Same generic control as thread jobs, despite the different runner.
    assert!(handle.cancel());
    handle.wait().await;
    assert_eq!(
        system.registry().get(handle.job_id()).unwrap().status,
        JobStatus::Cancelled
    );

    system.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn state_survives_restart_via_replay() {
    let dir = tempfile::tempdir().unwrap();

    let job_id = {
        let system = JobSystem::new(config_in(&dir));
        let body: JobBody = Arc::new(|_ctx| Ok(serde_json::json!({"trained": true})));
        let handle = system
            .submit(JobKind::TrainModel, body, JobPolicy::default())
            .unwrap();
        handle.wait().await;
        system.shutdown().await;
        handle.job_id()
    };

    let system = JobSystem::new(config_in(&dir));
    let snap = system.registry().get(job_id).unwrap();
    assert_eq!(snap.status, JobStatus::Finished);
    assert_eq!(snap.result, Some(serde_json::json!({"trained": true})));
    system.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_is_idempotent_and_stops_intake() {
    let dir = tempfile::tempdir().unwrap();
    let system = JobSystem::new(config_in(&dir));

    system.shutdown().await;
    system.shutdown().await;

    let body: JobBody = Arc::new(|_ctx| Ok(serde_json::Value::Null));
    let refused = system.submit(JobKind::Maintenance, body, JobPolicy::default());
    assert!(matches!(refused, Err(JobError::Validation(_))));
}
