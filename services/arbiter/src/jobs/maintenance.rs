//! Background upkeep for the job manager.
//!
//! - keep the ready stack topped up
//! - sweep jobs past their expiration plus grace
//! - drop ready workers built from an old worker version
//! - adopt workers left running by a previous arbiter at startup

use std::sync::Arc;

use chrono::Utc;
use grid_id::JobId;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{deadline_after, ActiveJob, JobManager};
use crate::error::Result;
use crate::rpc::GridRpcExt;

/// What startup recovery did with each running worker it found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub ready: usize,
    pub active: usize,
    pub killed: usize,
}

impl JobManager {
    /// Recover running workers, then run maintenance until `shutdown` flips
    /// to true.
    pub async fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        if let Err(e) = self.check_version().await {
            warn!(error = %e, "Could not read worker version");
        }
        let report = self.recover().await?;
        info!(
            ready = report.ready,
            active = report.active,
            killed = report.killed,
            "Recovered running workers"
        );

        let manager = Arc::clone(self);
        Ok(tokio::spawn(async move { manager.run(shutdown).await }))
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            reserve = self.config.ready_instances_to_keep_in_reserve,
            max_instances = self.config.max_instances,
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            "Starting job maintenance loop"
        );

        let mut populate_interval = tokio::time::interval(self.config.populate_interval);
        let mut sweep_interval = tokio::time::interval(self.config.sweep_interval);
        let mut version_interval = tokio::time::interval(self.config.version_check_interval);

        loop {
            tokio::select! {
                _ = populate_interval.tick() => {
                    let started = self.populate().await;
                    if started > 0 {
                        debug!(started, "Populated ready workers");
                    }
                }
                _ = sweep_interval.tick() => {
                    self.sweep_expired().await;
                    self.unexpected_exit_jobs().await;
                }
                _ = version_interval.tick() => {
                    if let Err(e) = self.check_version().await {
                        error!(error = %e, "Worker version check failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Job maintenance shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Dispose the ready stack. Active jobs keep their workers.
    pub async fn stop(&self) -> usize {
        let ready = std::mem::take(&mut self.lock().ready);
        for handle in &ready {
            self.pool.dispose_handle(handle).await;
        }
        info!(disposed = ready.len(), "Stopped job manager");
        ready.len()
    }

    /// Close jobs whose expiration plus grace has passed.
    pub async fn sweep_expired(&self) -> Vec<String> {
        let now = Utc::now();
        let grace = self.config.expiration_grace;
        let expired: Vec<String> = self
            .lock()
            .active
            .iter()
            .filter(|(_, job)| deadline_after(job.expires_at, grace) <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut swept = Vec::new();
        for job_id in expired {
            match self.close_job(&job_id, false).await {
                Ok(_) => {
                    info!(job_id = %job_id, "Swept expired job");
                    swept.push(job_id);
                }
                Err(e) => debug!(job_id = %job_id, error = %e, "Expired job already gone"),
            }
        }
        swept.sort();
        swept
    }

    /// Re-read the worker version. When it changed, dispose ready workers
    /// built from another version. Returns how many were disposed.
    pub async fn check_version(&self) -> Result<usize> {
        let latest = self.pool.launcher().version().await?;
        if !self.set_current_version(&latest) {
            return Ok(0);
        }
        info!(version = %latest, "Worker version changed");

        let stale = {
            let mut state = self.lock();
            let (stale, current): (Vec<_>, Vec<_>) = std::mem::take(&mut state.ready)
                .into_iter()
                .partition(|handle| handle.version() != latest);
            state.ready = current;
            stale
        };

        for handle in &stale {
            info!(worker = %handle.name(), version = %handle.version(), "Disposing out-of-date worker");
            self.pool.dispose_handle(handle).await;
        }
        Ok(stale.len())
    }

    /// Adopt workers that were already running when the arbiter started.
    ///
    /// - no jobs: becomes a ready worker
    /// - one job with a job-id-shaped id: becomes that job's active worker
    /// - anything else: killed
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let running = self.pool.launcher().list_running().await?;
        let version = self.current_version().unwrap_or_default();
        let host = self.pool.default_host().to_string();
        let mut report = RecoveryReport::default();

        for worker in running {
            let (pid, port) = (worker.pid, worker.port);
            let handle = match self
                .pool
                .adopt(worker.into_launched(version.clone()), &host)
                .await
            {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(pid, port, error = %e, "Could not adopt running worker");
                    continue;
                }
            };

            let jobs = match handle.get_all_jobs().await {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(pid, port, error = %e, "Running worker did not answer, killing");
                    self.pool.dispose_handle(&handle).await;
                    report.killed += 1;
                    continue;
                }
            };

            match jobs.as_slice() {
                [] => {
                    self.lock().ready.push(handle);
                    report.ready += 1;
                }
                [job] if JobId::matches(&job.id) && !self.lock().active.contains_key(&job.id) => {
                    let expires_at = deadline_after(Utc::now(), self.config.recovered_job_lease);
                    info!(job_id = %job.id, pid, port, expires_at = %expires_at, "Recovered active job");
                    handle.record_use();
                    self.lock().active.insert(
                        job.id.clone(),
                        ActiveJob {
                            handle,
                            expires_at,
                            limits: self.limits_for(job),
                        },
                    );
                    report.active += 1;
                }
                _ => {
                    warn!(pid, port, jobs = jobs.len(), "Running worker holds unknown jobs, killing");
                    self.pool.dispose_handle(&handle).await;
                    report.killed += 1;
                }
            }
        }

        if report.ready > 0 {
            self.ready_added.notify_waiters();
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::jobs::JobManagerConfig;
    use crate::launcher::MockLauncher;
    use crate::pool::{InstancePool, PoolConfig};
    use crate::port::{PortAllocator, PortAllocatorConfig, StaticListenerProbe};
    use crate::resources::{ResourceLimits, ResourceSettings, ResourceTracker};
    use crate::rpc::{Job, MockConnector};

    struct Fixture {
        _dir: tempfile::TempDir,
        launcher: Arc<MockLauncher>,
        connector: MockConnector,
        manager: Arc<JobManager>,
    }

    fn fixture(config: JobManagerConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(MockLauncher::new());
        let connector = MockConnector::new();
        let ports = PortAllocator::with_probe(
            PortAllocatorConfig {
                lock_path: dir.path().join("ports.lock"),
                release_cooldown: Duration::ZERO,
                ..PortAllocatorConfig::default()
            },
            StaticListenerProbe::default(),
        );
        let pool = Arc::new(InstancePool::new(
            PoolConfig {
                base_port: 48000,
                ..PoolConfig::default()
            },
            ports,
            launcher.clone(),
            Arc::new(connector.clone()),
        ));
        let resources = ResourceTracker::new(
            ResourceSettings::default(),
            ResourceLimits::new(8.0, 4096, 16384),
        );
        Fixture {
            _dir: dir,
            launcher,
            connector,
            manager: Arc::new(JobManager::new(config, pool, resources)),
        }
    }

    #[tokio::test]
    async fn test_recovery_sorts_running_workers() {
        let fx = fixture(JobManagerConfig::default());
        fx.launcher.add_running(50000);
        let busy = fx.launcher.add_running(50001);
        let foreign = fx.launcher.add_running(50002);
        let job_id = JobId::new().to_string();
        fx.connector
            .set_jobs(busy.port, vec![Job::new(job_id.clone(), 60.0)]);
        fx.connector
            .set_jobs(foreign.port, vec![Job::new("not-a-job-id", 60.0)]);

        let report = fx.manager.recover().await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                ready: 1,
                active: 1,
                killed: 1
            }
        );
        assert_eq!(fx.manager.running_job_ids(), vec![job_id.clone()]);
        let recovered = fx.manager.active_job(&job_id).unwrap();
        assert!(recovered.expires_at > Utc::now() + chrono::TimeDelta::seconds(290));
        assert_eq!(fx.launcher.terminated_ports(), vec![foreign.port]);
        assert_eq!(fx.manager.ready_count(), 1);
        assert_eq!(fx.launcher.running_count(), 2);
    }

    #[tokio::test]
    async fn test_sweep_closes_expired_jobs() {
        let fx = fixture(JobManagerConfig {
            ready_instances_to_keep_in_reserve: 1,
            expiration_grace: Duration::ZERO,
            ..JobManagerConfig::default()
        });

        let stale = Job::new(JobId::new().to_string(), 0.0);
        let fresh = Job::new(JobId::new().to_string(), 600.0);
        fx.manager.new_job(&stale, true, true).await.unwrap();
        fx.manager.new_job(&fresh, true, true).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(fx.manager.sweep_expired().await, vec![stale.id.clone()]);
        assert_eq!(fx.manager.running_job_ids(), vec![fresh.id]);
    }

    #[tokio::test]
    async fn test_version_change_drops_stale_ready_workers() {
        let fx = fixture(JobManagerConfig {
            ready_instances_to_keep_in_reserve: 2,
            ..JobManagerConfig::default()
        });
        assert_eq!(fx.manager.check_version().await.unwrap(), 0);
        assert_eq!(fx.manager.populate().await, 2);

        fx.launcher.set_version("mock-2.0");
        assert_eq!(fx.manager.check_version().await.unwrap(), 2);
        assert_eq!(fx.manager.ready_count(), 0);
        assert_eq!(fx.launcher.running_count(), 0);

        assert_eq!(fx.manager.populate().await, 2);
        assert_eq!(fx.manager.check_version().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stop_disposes_ready_stack() {
        let fx = fixture(JobManagerConfig {
            ready_instances_to_keep_in_reserve: 3,
            ..JobManagerConfig::default()
        });
        assert_eq!(fx.manager.populate().await, 3);
        assert_eq!(fx.manager.stop().await, 3);
        assert_eq!(fx.manager.counts().instances(), 0);
    }
}
