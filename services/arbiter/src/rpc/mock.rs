//! In-memory worker transport for tests and dry runs.
//!
//! All transports from one [`MockConnector`] share state, keyed by port, so a
//! test can script failures for a worker before the pool has even created its
//! handle, and inspect afterwards which calls reached which port.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{GridRpc, Job, RpcConnector, RpcMethod, RpcRequest, RpcResponse, WorkerStatus};
use crate::error::{ArbiterError, Result};

/// A failure the mock can be told to produce.
#[derive(Debug, Clone, PartialEq)]
pub enum MockFailure {
    Unreachable,
    Transient,
    Timeout,
    Fault(String),
}

impl MockFailure {
    fn into_error(self, method: RpcMethod, port: u16) -> ArbiterError {
        match self {
            MockFailure::Unreachable => {
                ArbiterError::EndpointUnreachable(format!("mock worker on port {port} refused"))
            }
            MockFailure::Transient => ArbiterError::Transient(format!("mock reset on port {port}")),
            MockFailure::Timeout => ArbiterError::Timeout {
                method: method.name(),
                elapsed: Duration::from_millis(1),
            },
            MockFailure::Fault(message) => ArbiterError::Fault {
                method: method.name(),
                message,
            },
        }
    }
}

#[derive(Default)]
struct MockState {
    queued: HashMap<u16, VecDeque<MockFailure>>,
    always: HashMap<u16, MockFailure>,
    jobs: HashMap<u16, Vec<Job>>,
    calls: HashMap<u16, Vec<RpcMethod>>,
    delays: HashMap<u16, Duration>,
    version: String,
}

/// Connector handing out [`MockGridRpc`] transports.
#[derive(Clone)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                version: "mock-1.0".to_string(),
                ..MockState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `times` calls to `port`.
    pub fn fail_next(&self, port: u16, failure: MockFailure, times: usize) {
        let mut state = self.lock();
        let queue = state.queued.entry(port).or_default();
        queue.extend(std::iter::repeat_n(failure, times));
    }

    /// Fail every call to `port` until [`heal`](Self::heal) is called.
    pub fn fail_always(&self, port: u16, failure: MockFailure) {
        self.lock().always.insert(port, failure);
    }

    pub fn heal(&self, port: u16) {
        let mut state = self.lock();
        state.always.remove(&port);
        state.queued.remove(&port);
    }

    /// Jobs the worker on `port` reports as running.
    pub fn set_jobs(&self, port: u16, jobs: Vec<Job>) {
        self.lock().jobs.insert(port, jobs);
    }

    /// Make every call to `port` take `delay` before it is answered.
    pub fn set_delay(&self, port: u16, delay: Duration) {
        self.lock().delays.insert(port, delay);
    }

    pub fn set_version(&self, version: &str) {
        self.lock().version = version.to_string();
    }

    /// Calls that reached `port`, in order.
    pub fn calls(&self, port: u16) -> Vec<RpcMethod> {
        self.lock().calls.get(&port).cloned().unwrap_or_default()
    }

    pub fn call_count(&self, port: u16) -> usize {
        self.lock().calls.get(&port).map_or(0, Vec::len)
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().map(Vec::len).sum()
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcConnector for MockConnector {
    fn connect(&self, _host: &str, port: u16) -> Result<Arc<dyn GridRpc>> {
        Ok(Arc::new(MockGridRpc {
            port,
            state: Arc::clone(&self.state),
        }))
    }
}

/// Transport answering from the connector's shared state.
pub struct MockGridRpc {
    port: u16,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl GridRpc for MockGridRpc {
    async fn call(&self, request: &RpcRequest) -> Result<RpcResponse> {
        let method = request.method();
        let delay = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .delays
            .get(&self.port)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.calls.entry(self.port).or_default().push(method);

        if let Some(failure) = state
            .queued
            .get_mut(&self.port)
            .and_then(VecDeque::pop_front)
        {
            return Err(failure.into_error(method, self.port));
        }
        if let Some(failure) = state.always.get(&self.port).cloned() {
            return Err(failure.into_error(method, self.port));
        }

        let version = state.version.clone();
        let jobs = state.jobs.entry(self.port).or_default();

        let response = match request {
            RpcRequest::HelloWorld => RpcResponse::Text("Hello World".to_string()),
            RpcRequest::GetVersion => RpcResponse::Text(version),
            RpcRequest::GetStatus => RpcResponse::Status(WorkerStatus {
                version,
                environment_count: jobs.len() as i32,
            }),
            RpcRequest::OpenJob { job, .. } | RpcRequest::OpenJobEx { job, .. } => {
                jobs.retain(|j| j.id != job.id);
                jobs.push(job.clone());
                RpcResponse::Values(Vec::new())
            }
            RpcRequest::Execute { .. }
            | RpcRequest::ExecuteEx { .. }
            | RpcRequest::BatchJob { .. }
            | RpcRequest::BatchJobEx { .. }
            | RpcRequest::Diag { .. }
            | RpcRequest::DiagEx { .. } => RpcResponse::Values(Vec::new()),
            RpcRequest::CloseJob { job_id } => {
                jobs.retain(|j| &j.id != job_id);
                RpcResponse::Empty
            }
            RpcRequest::GetExpiration { job_id } => RpcResponse::Seconds(
                jobs.iter()
                    .find(|j| &j.id == job_id)
                    .map_or(0.0, |j| j.expiration_in_seconds),
            ),
            RpcRequest::RenewLease {
                job_id,
                expiration_in_seconds,
            } => {
                let mut renewed = 0.0;
                if let Some(job) = jobs.iter_mut().find(|j| &j.id == job_id) {
                    job.expiration_in_seconds = *expiration_in_seconds;
                    renewed = *expiration_in_seconds;
                }
                RpcResponse::Seconds(renewed)
            }
            RpcRequest::GetAllJobs | RpcRequest::GetAllJobsEx => RpcResponse::Jobs(jobs.clone()),
            RpcRequest::CloseExpiredJobs => RpcResponse::Count(0),
            RpcRequest::CloseAllJobs => {
                let closed = jobs.len() as i32;
                jobs.clear();
                RpcResponse::Count(closed)
            }
        };

        Ok(response)
    }
}
