//! Grid Arbiter
//!
//! Runs on each worker host. It owns the pool of script worker processes,
//! hands workers out to jobs, and keeps the pool warm and tidy:
//!
//! - **Instance pool**: registry of worker handles and call dispatch
//! - **Lease reaper**: disposes pooled workers whose lease ran out
//! - **Job manager**: admission control, ready workers, expired-job sweeps

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use grid_arbiter::launcher::{
    select_backend, BackendKind, ContainerLauncher, ProcessLauncher, WorkerLauncher,
};
use grid_arbiter::resources::ResourceTracker;
use grid_arbiter::rpc::HttpConnector;
use grid_arbiter::{ArbiterConfig, InstancePool, JobManager, PortAllocator};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ArbiterConfig::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting grid arbiter");

    config.validate().context("invalid arbiter configuration")?;
    info!(
        backend = %config.backend,
        worker_host = %config.worker_host,
        base_port = config.base_port,
        max_attempts = config.max_attempts,
        single_instance_mode = config.single_instance_mode,
        pool_size = config.pool_size,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Exactly one backend is built; selection prefers the container one.
    let (container, process) = match config.backend {
        BackendKind::Container => {
            let launcher = ContainerLauncher::new(config.container_launcher_config());
            (Some(Arc::new(launcher) as Arc<dyn WorkerLauncher>), None)
        }
        BackendKind::Process => {
            let launcher = ProcessLauncher::new(config.process_launcher_config());
            (None, Some(Arc::new(launcher) as Arc<dyn WorkerLauncher>))
        }
    };
    let launcher = select_backend(container, process)?;

    let connector = Arc::new(HttpConnector::new(config.call_timeout)?);
    let ports = PortAllocator::new(config.port_allocator_config());
    let pool = Arc::new(InstancePool::new(
        config.pool_config(),
        ports,
        launcher,
        connector,
    ));

    let resources = ResourceTracker::from_system(config.resource_settings());
    let job_manager = Arc::new(JobManager::new(
        config.job_manager_config(),
        Arc::clone(&pool),
        resources,
    ));

    let jobs_handle = job_manager
        .start(shutdown_rx.clone())
        .await
        .context("failed to start job manager")?;

    let warm_pool_size = pool.config().warm_pool_size;
    if warm_pool_size > 0 {
        match pool.warm_up(warm_pool_size).await {
            Ok(created) => info!(created, "Worker pool warmed"),
            Err(e) => warn!(error = %e, "Failed to warm worker pool"),
        }
    }
    let reaper_handle = pool.spawn_lease_reaper(shutdown_rx.clone());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = jobs_handle => {
            if let Err(e) = result {
                error!(error = %e, "Job maintenance task panicked");
            }
        }
        result = reaper_handle => {
            if let Err(e) = result {
                error!(error = %e, "Lease reaper task panicked");
            }
        }
    }

    // Signal shutdown to all background loops
    let _ = shutdown_tx.send(true);

    info!("Waiting for background tasks to shut down...");
    tokio::time::sleep(Duration::from_secs(2)).await;

    job_manager.stop().await;
    let active = job_manager.active_jobs_count();
    if active == 0 {
        let killed = pool.kill_all().await;
        info!(killed, "Killed remaining workers");
    } else {
        // the next arbiter adopts these at startup
        info!(active, "Leaving workers with active jobs running");
    }

    info!(stats = ?pool.stats(), "Grid arbiter shutdown complete");
    Ok(())
}
