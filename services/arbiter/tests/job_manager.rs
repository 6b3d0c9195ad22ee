//! Integration tests for the job manager.
//!
//! Jobs are admitted against a fixed 8-core / 16 GiB host with the mock
//! launcher and transport behind the pool:
//! 1. Admission checks resources, then takes (or starts) a ready worker
//! 2. Active jobs can be renewed, inspected and broadcast to
//! 3. Closing a job recycles or disposes its worker

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use grid_arbiter::error::{ArbiterError, JobRejectionReason};
use grid_arbiter::jobs::{JobAdmission, JobManager, JobManagerConfig};
use grid_arbiter::launcher::{BackendKind, MockLauncher};
use grid_arbiter::pool::{InstancePool, PoolConfig};
use grid_arbiter::port::{PortAllocator, PortAllocatorConfig, StaticListenerProbe};
use grid_arbiter::resources::{ResourceLimits, ResourceSettings, ResourceTracker};
use grid_arbiter::rpc::{Job, MockConnector, RpcRequest, RpcResponse};
use grid_arbiter::worker::WorkerHandle;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    launcher: Arc<MockLauncher>,
    pool: Arc<InstancePool>,
    manager: Arc<JobManager>,
}

fn harness(config: JobManagerConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let ports = PortAllocator::with_probe(
        PortAllocatorConfig {
            lock_path: dir.path().join("ports.lock"),
            release_cooldown: Duration::ZERO,
            ..PortAllocatorConfig::default()
        },
        StaticListenerProbe::default(),
    );
    let launcher = Arc::new(MockLauncher::new());
    let connector = MockConnector::new();
    let pool = Arc::new(InstancePool::new(
        PoolConfig {
            base_port: 48000,
            ..PoolConfig::default()
        },
        ports,
        launcher.clone(),
        Arc::new(connector),
    ));
    let resources = ResourceTracker::new(
        ResourceSettings::default(),
        ResourceLimits::new(8.0, 4096, 16384),
    );
    let manager = Arc::new(JobManager::new(config, Arc::clone(&pool), resources));
    Harness {
        _dir: dir,
        launcher,
        pool,
        manager,
    }
}

fn reserve(ready: usize) -> JobManagerConfig {
    JobManagerConfig {
        ready_instances_to_keep_in_reserve: ready,
        ..JobManagerConfig::default()
    }
}

fn job_with_cores(cores: f64) -> Job {
    Job {
        cores,
        ..Job::generate(600.0)
    }
}

async fn admit(manager: &JobManager, job: &Job) -> Arc<WorkerHandle> {
    match manager.new_job(job, true, true).await.unwrap() {
        JobAdmission::Admitted(handle) => handle,
        JobAdmission::Rejected(reason) => panic!("job {} rejected: {reason}", job.id),
    }
}

// =============================================================================
// Admission
// =============================================================================

#[tokio::test]
async fn test_no_reserve_rejects_without_starting_workers() {
    let h = harness(reserve(0));

    let admission = h
        .manager
        .new_job(&Job::generate(60.0), true, true)
        .await
        .unwrap();

    assert_eq!(admission.rejection(), Some(JobRejectionReason::NoReadyInstance));
    assert_eq!(h.launcher.launch_count(), 0);
    assert_eq!(h.pool.instance_count().await, 0);
    assert_eq!(h.manager.active_jobs_count(), 0);
}

#[tokio::test]
async fn test_concurrent_admissions_share_the_core_budget() {
    let h = harness(reserve(2));
    h.launcher.set_launch_delay(Duration::from_millis(20));

    let first = job_with_cores(6.0);
    let second = job_with_cores(6.0);
    let (a, b) = tokio::join!(
        h.manager.new_job(&first, true, true),
        h.manager.new_job(&second, true, true),
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    let admitted = outcomes.iter().filter(|o| o.handle().is_some()).count();
    let rejections: Vec<_> = outcomes.iter().filter_map(JobAdmission::rejection).collect();
    assert_eq!(admitted, 1);
    assert_eq!(rejections, vec![JobRejectionReason::CpuAllocationExceeded]);
    assert_eq!(h.manager.active_jobs_count(), 1);
    assert_eq!(h.manager.allocated_resources().cores, 6.0);
}

#[tokio::test]
async fn test_rejected_wait_releases_reserved_resources() {
    let h = harness(reserve(0));

    let admission = h
        .manager
        .new_job(&job_with_cores(6.0), true, true)
        .await
        .unwrap();

    assert_eq!(admission.rejection(), Some(JobRejectionReason::NoReadyInstance));
    assert_eq!(h.manager.allocated_resources(), ResourceLimits::default());
}

#[tokio::test]
async fn test_waiting_job_starts_a_worker_inline() {
    let h = harness(reserve(1));

    let job = Job::generate(60.0);
    let handle = admit(&h.manager, &job).await;

    assert!(handle.is_opened());
    assert_eq!(handle.use_count(), 1);
    assert_eq!(h.launcher.launch_count(), 1);
    assert_eq!(h.manager.running_job_ids(), vec![job.id]);
    assert_eq!(h.manager.ready_count(), 0);
}

#[tokio::test]
async fn test_non_waiting_job_needs_a_ready_worker() {
    let h = harness(reserve(1));

    let admission = h
        .manager
        .new_job(&Job::generate(60.0), false, true)
        .await
        .unwrap();
    assert_eq!(admission.rejection(), Some(JobRejectionReason::NoReadyInstance));

    assert_eq!(h.manager.populate().await, 1);
    let admission = h
        .manager
        .new_job(&Job::generate(60.0), false, true)
        .await
        .unwrap();
    assert!(admission.handle().is_some());
}

#[tokio::test]
async fn test_cpu_allocation_is_enforced() {
    let h = harness(reserve(1));

    admit(&h.manager, &job_with_cores(4.0)).await;
    admit(&h.manager, &job_with_cores(4.0)).await;
    assert_eq!(h.manager.allocated_resources().cores, 8.0);

    let admission = h
        .manager
        .new_job(&job_with_cores(1.0), true, true)
        .await
        .unwrap();
    assert_eq!(
        admission.rejection(),
        Some(JobRejectionReason::CpuAllocationExceeded)
    );
    assert_eq!(h.launcher.launch_count(), 2);
    assert_eq!(
        h.manager
            .is_resource_available(&ResourceLimits::new(1.0, 0, 0)),
        Err(JobRejectionReason::CpuAllocationExceeded)
    );
}

#[tokio::test]
async fn test_instance_ceiling_rejects_new_jobs() {
    let h = harness(JobManagerConfig {
        ready_instances_to_keep_in_reserve: 1,
        max_instances: 1,
        ..JobManagerConfig::default()
    });

    admit(&h.manager, &Job::generate(60.0)).await;
    let admission = h
        .manager
        .new_job(&Job::generate(60.0), true, true)
        .await
        .unwrap();

    assert_eq!(admission.rejection(), Some(JobRejectionReason::NoReadyInstance));
    assert_eq!(h.launcher.launch_count(), 1);
}

#[tokio::test]
async fn test_duplicate_job_id_is_an_error() {
    let h = harness(reserve(1));
    let job = Job::generate(60.0);
    admit(&h.manager, &job).await;

    let err = h.manager.new_job(&job, true, true).await.unwrap_err();
    assert!(matches!(err, ArbiterError::JobAlreadyActive(id) if id == job.id));
    assert_eq!(h.manager.active_jobs_count(), 1);
}

#[tokio::test]
async fn test_untracked_job_leaves_no_active_entry() {
    let h = harness(reserve(1));

    let admission = h
        .manager
        .new_job(&Job::generate(60.0), true, false)
        .await
        .unwrap();
    let handle = admission.handle().unwrap();

    assert_eq!(h.manager.active_jobs_count(), 0);
    assert!(h.manager.release_instance(handle, true).await);
    assert_eq!(h.manager.ready_count(), 1);
}

#[tokio::test]
async fn test_out_of_date_ready_worker_is_discarded() {
    let h = harness(reserve(1));
    h.manager.check_version().await.unwrap();

    h.launcher.set_version("mock-2.0");
    assert_eq!(h.manager.populate().await, 1);
    let stale_port = h.pool.allocated_ports().await[0];

    let admission = h
        .manager
        .new_job(&Job::generate(60.0), false, true)
        .await
        .unwrap();

    assert_eq!(admission.rejection(), Some(JobRejectionReason::NoReadyInstance));
    assert_eq!(h.launcher.terminated_ports(), vec![stale_port]);
    assert_eq!(h.manager.ready_count(), 0);
    assert_eq!(h.pool.instance_count().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_jobs_never_share_a_worker() {
    let h = harness(JobManagerConfig {
        ready_instances_to_keep_in_reserve: 2,
        max_instances: 10,
        ..JobManagerConfig::default()
    });

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let manager = Arc::clone(&h.manager);
        tasks.push(tokio::spawn(async move {
            let job = Job::generate(60.0);
            admit(&manager, &job).await.port()
        }));
    }

    let mut ports = HashSet::new();
    for task in tasks {
        assert!(ports.insert(task.await.unwrap()), "worker bound to two jobs");
    }
    assert_eq!(h.manager.active_jobs_count(), 6);
}

// =============================================================================
// Active jobs
// =============================================================================

#[tokio::test]
async fn test_renew_lease_only_extends() {
    let h = harness(reserve(1));
    let job = Job::generate(600.0);
    admit(&h.manager, &job).await;
    let original = h.manager.active_job(&job.id).unwrap().expires_at;

    let shorter = h
        .manager
        .renew_lease(&job.id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(shorter, original);

    let longer = h
        .manager
        .renew_lease(&job.id, Duration::from_secs(3600))
        .await
        .unwrap();
    assert!(longer > original);
    assert_eq!(h.manager.active_job(&job.id).unwrap().expires_at, longer);
    assert_eq!(h.launcher.launch_count(), 1);

    assert!(matches!(
        h.manager.renew_lease("job_missing", Duration::from_secs(1)).await,
        Err(ArbiterError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn test_get_job_drops_exited_worker() {
    let h = harness(reserve(1));
    let job = Job::generate(600.0);
    let handle = admit(&h.manager, &job).await;
    assert!(Arc::ptr_eq(&h.manager.get_job(&job.id).await.unwrap(), &handle));

    h.launcher.mark_exited(handle.process_id());

    let err = h.manager.get_job(&job.id).await.unwrap_err();
    assert!(matches!(err, ArbiterError::JobExited(_)));
    assert_eq!(h.manager.active_jobs_count(), 0);
    assert!(handle.is_disposed());
    assert_eq!(h.pool.instance_count().await, 0);
}

#[tokio::test]
async fn test_unexpected_exits_are_reported_once() {
    let h = harness(reserve(1));
    let alive = Job::generate(600.0);
    let dead = Job::generate(600.0);
    admit(&h.manager, &alive).await;
    let handle = admit(&h.manager, &dead).await;

    h.launcher.mark_exited(handle.process_id());

    assert_eq!(h.manager.unexpected_exit_jobs().await, vec![dead.id.clone()]);
    assert!(h.manager.unexpected_exit_jobs().await.is_empty());
    assert_eq!(h.manager.running_job_ids(), vec![alive.id]);
}

#[tokio::test]
async fn test_broadcast_skips_exited_workers() {
    let h = harness(reserve(1));
    let mut jobs = vec![Job::generate(600.0), Job::generate(600.0), Job::generate(600.0)];
    let mut handles = Vec::new();
    for job in &jobs {
        handles.push(admit(&h.manager, job).await);
    }
    h.launcher.mark_exited(handles[1].process_id());
    let exited_id = jobs.remove(1).id;

    let results = h
        .manager
        .dispatch_to_all_active_jobs(&RpcRequest::HelloWorld)
        .await;

    let mut expected: Vec<String> = jobs.into_iter().map(|job| job.id).collect();
    expected.sort();
    let ids: Vec<String> = results.iter().map(|(id, _)| id.clone()).collect();
    assert_eq!(ids, expected);
    assert!(!ids.contains(&exited_id));
    for (_, result) in &results {
        assert!(matches!(result, Ok(RpcResponse::Text(text)) if text == "Hello World"));
    }
}

#[tokio::test]
async fn test_worker_limits_follow_the_job() {
    let h = harness(reserve(1));
    let job = job_with_cores(2.0);
    let handle = admit(&h.manager, &job).await;

    let applied = h.launcher.limits_for(handle.process_id()).unwrap();
    assert_eq!(applied.cores, 2.0);

    let raised = ResourceLimits::new(3.0, 128, 2048);
    h.manager
        .update_worker_resources(&job.id, raised)
        .await
        .unwrap();

    assert_eq!(h.launcher.limits_for(handle.process_id()), Some(raised));
    assert_eq!(h.manager.active_job(&job.id).unwrap().limits, raised);
    assert_eq!(h.manager.allocated_resources(), raised);
}

// =============================================================================
// Closing
// =============================================================================

#[tokio::test]
async fn test_closed_job_recycles_worker_until_reuse_limit() {
    let h = harness(JobManagerConfig {
        ready_instances_to_keep_in_reserve: 1,
        max_instance_reuses: 2,
        ..JobManagerConfig::default()
    });

    let first = Job::generate(60.0);
    let handle = admit(&h.manager, &first).await;
    assert!(h.manager.close_job(&first.id, true).await.unwrap());
    assert_eq!(h.manager.ready_count(), 1);

    let second = Job::generate(60.0);
    let reused = admit(&h.manager, &second).await;
    assert!(Arc::ptr_eq(&handle, &reused));
    assert_eq!(reused.use_count(), 2);

    assert!(!h.manager.close_job(&second.id, true).await.unwrap());
    assert!(reused.is_disposed());
    assert_eq!(h.launcher.terminated_ports(), vec![reused.port()]);
    assert_eq!(h.launcher.launch_count(), 1);
}

#[tokio::test]
async fn test_close_without_recycle_disposes() {
    let h = harness(reserve(1));
    let job = Job::generate(60.0);
    let handle = admit(&h.manager, &job).await;

    assert!(!h.manager.close_job(&job.id, false).await.unwrap());
    assert!(handle.is_disposed());
    assert_eq!(h.manager.ready_count(), 0);
    assert!(h.pool.allocated_ports().await.is_empty());

    assert!(matches!(
        h.manager.close_job(&job.id, true).await,
        Err(ArbiterError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn test_populate_fills_reserve_and_reports_backend() {
    let h = harness(JobManagerConfig {
        ready_instances_to_keep_in_reserve: 3,
        populate_tasks: 2,
        ..JobManagerConfig::default()
    });

    assert_eq!(h.manager.populate().await, 3);
    assert_eq!(h.manager.populate().await, 0);

    let counts = h.manager.counts();
    assert_eq!(counts.ready, 3);
    assert_eq!(counts.instances(), 3);
    assert_eq!(h.manager.backend(), BackendKind::Process);
}
