//! Launcher that starts nothing, for tests and dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{BackendKind, LaunchRequest, LaunchedWorker, RunningWorker, Termination, WorkerLauncher};
use crate::error::{ArbiterError, LaunchFailure, Result};
use crate::resources::ResourceLimits;

#[derive(Default)]
struct MockState {
    running: HashMap<u32, RunningWorker>,
    failure: Option<LaunchFailure>,
    version: String,
    terminated_ports: Vec<u16>,
    limits: HashMap<u32, ResourceLimits>,
    launch_delay: Duration,
}

/// Pretends to launch workers. Pids are handed out from a counter.
pub struct MockLauncher {
    kind: BackendKind,
    next_pid: AtomicU32,
    launches: AtomicUsize,
    state: Mutex<MockState>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::with_kind(BackendKind::Process)
    }

    pub fn with_kind(kind: BackendKind) -> Self {
        Self {
            kind,
            next_pid: AtomicU32::new(1000),
            launches: AtomicUsize::new(0),
            state: Mutex::new(MockState {
                version: "mock-1.0".to_string(),
                ..MockState::default()
            }),
        }
    }

    /// A launcher whose every launch fails with `failure`.
    pub fn failing(failure: LaunchFailure) -> Self {
        let launcher = Self::new();
        launcher.set_failure(Some(failure));
        launcher
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_failure(&self, failure: Option<LaunchFailure>) {
        self.lock().failure = failure;
    }

    /// Make every launch take `delay` before the worker is up.
    pub fn set_launch_delay(&self, delay: Duration) {
        self.lock().launch_delay = delay;
    }

    pub fn set_version(&self, version: &str) {
        self.lock().version = version.to_string();
    }

    /// Simulate the worker process dying on its own.
    pub fn mark_exited(&self, pid: u32) {
        self.lock().running.remove(&pid);
    }

    /// Register a worker as if an earlier arbiter had started it.
    pub fn add_running(&self, port: u16) -> RunningWorker {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let worker = RunningWorker {
            pid,
            instance_id: pid.to_string(),
            port,
        };
        self.lock().running.insert(pid, worker.clone());
        worker
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn running_count(&self) -> usize {
        self.lock().running.len()
    }

    /// Ports of workers stopped through `terminate`, in order.
    pub fn terminated_ports(&self) -> Vec<u16> {
        self.lock().terminated_ports.clone()
    }

    pub fn limits_for(&self, pid: u32) -> Option<ResourceLimits> {
        self.lock().limits.get(&pid).copied()
    }
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerLauncher for MockLauncher {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchedWorker> {
        self.launches.fetch_add(1, Ordering::SeqCst);

        let delay = self.lock().launch_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if let Some(failure) = state.failure {
            return Err(failure.into());
        }
        let port = match request.port {
            Some(port) if port > 0 => port,
            _ => return Err(LaunchFailure::BadPort.into()),
        };

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let worker = RunningWorker {
            pid,
            instance_id: pid.to_string(),
            port,
        };
        state.running.insert(pid, worker.clone());
        info!(pid, port, "[MOCK] Launched worker");

        let mut launched = worker.into_launched(state.version.clone());
        launched.elapsed = Duration::from_millis(1);
        Ok(launched)
    }

    async fn terminate(&self, worker: &LaunchedWorker) -> Result<Termination> {
        let mut state = self.lock();
        match state.running.remove(&worker.pid) {
            Some(running) => {
                state.terminated_ports.push(running.port);
                debug!(pid = worker.pid, port = running.port, "[MOCK] Terminated worker");
                Ok(Termination::Killed)
            }
            None => {
                info!(pid = worker.pid, "Worker process not running, ignoring");
                Ok(Termination::NotRunning)
            }
        }
    }

    async fn is_running(&self, worker: &LaunchedWorker) -> bool {
        self.lock().running.contains_key(&worker.pid)
    }

    async fn version(&self) -> Result<String> {
        Ok(self.lock().version.clone())
    }

    async fn list_running(&self) -> Result<Vec<RunningWorker>> {
        let mut workers: Vec<_> = self.lock().running.values().cloned().collect();
        workers.sort_by_key(|w| w.pid);
        Ok(workers)
    }

    async fn update_limits(&self, worker: &LaunchedWorker, limits: &ResourceLimits) -> Result<()> {
        let mut state = self.lock();
        if !state.running.contains_key(&worker.pid) {
            return Err(ArbiterError::Backend(format!(
                "worker {} is not running",
                worker.pid
            )));
        }
        state.limits.insert(worker.pid, *limits);
        Ok(())
    }
}
