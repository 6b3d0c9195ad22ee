//! Worker process launch backends.
//!
//! A [`WorkerLauncher`] starts a worker bound to a port and later stops it.
//! Two implementations exist and exactly one is active per arbiter:
//! - [`ProcessLauncher`] spawns the worker binary directly
//! - [`ContainerLauncher`] runs it as a Docker container
//!
//! [`MockLauncher`] stands in for both in tests and dry runs.

mod container;
mod mock;
mod process;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::error::{ArbiterError, Result};
use crate::resources::ResourceLimits;

pub use container::{ContainerLauncher, ContainerLauncherConfig, DockerClient};
pub use mock::MockLauncher;
pub use process::{ProcessLauncher, ProcessLauncherConfig};

/// Which backend launches workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Process,
    Container,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Process => f.write_str("process"),
            BackendKind::Container => f.write_str("container"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" | "native" => Ok(BackendKind::Process),
            "container" | "docker" => Ok(BackendKind::Container),
            other => Err(format!("unknown worker backend '{other}'")),
        }
    }
}

/// What to start.
///
/// `only_web` starts the companion web server instead of a worker;
/// `only_grid` starts just the worker. With neither set both are started.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchRequest {
    pub only_web: bool,
    pub only_grid: bool,
    pub port: Option<u16>,
}

impl LaunchRequest {
    /// A worker (and nothing else) on `port`.
    pub fn grid(port: u16) -> Self {
        Self {
            only_web: false,
            only_grid: true,
            port: Some(port),
        }
    }
}

/// A worker started by a launcher.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchedWorker {
    pub pid: u32,
    /// Backend-specific identity: the pid for native processes, the
    /// container id for containers.
    pub instance_id: String,
    pub port: u16,
    /// How long the launch took.
    pub elapsed: Duration,
    /// Build of the worker that was started.
    pub version: String,
}

/// A worker found running on the host, possibly started by an earlier
/// arbiter process.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningWorker {
    pub pid: u32,
    pub instance_id: String,
    pub port: u16,
}

impl RunningWorker {
    pub fn into_launched(self, version: String) -> LaunchedWorker {
        LaunchedWorker {
            pid: self.pid,
            instance_id: self.instance_id,
            port: self.port,
            elapsed: Duration::ZERO,
            version,
        }
    }
}

/// Outcome of a terminate request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Killed,
    /// The worker had already exited.
    NotRunning,
    /// The worker belongs to someone this process may not signal.
    NotPermitted,
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Start a worker. Known failures come back as
    /// [`ArbiterError::LaunchFailure`].
    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchedWorker>;

    /// Stop a worker. Must not fail just because it is already gone.
    async fn terminate(&self, worker: &LaunchedWorker) -> Result<Termination>;

    async fn is_running(&self, worker: &LaunchedWorker) -> bool;

    /// Build identifier of the worker this launcher would start now.
    async fn version(&self) -> Result<String>;

    /// Workers of this backend currently running on the host.
    async fn list_running(&self) -> Result<Vec<RunningWorker>>;

    /// Apply resource limits to a running worker.
    async fn update_limits(&self, worker: &LaunchedWorker, limits: &ResourceLimits) -> Result<()> {
        let _ = (worker, limits);
        Ok(())
    }
}

/// Choose the active backend. The container backend wins when both are
/// configured.
pub fn select_backend(
    container: Option<Arc<dyn WorkerLauncher>>,
    process: Option<Arc<dyn WorkerLauncher>>,
) -> Result<Arc<dyn WorkerLauncher>> {
    let selected = container.or(process).ok_or(ArbiterError::NoBackend)?;
    info!(backend = %selected.kind(), "Selected worker backend");
    Ok(selected)
}
