//! One worker process binding.
//!
//! A [`WorkerHandle`] owns the port a worker listens on, the launched process
//! (if any), and the retrying call path every remote operation goes through.
//! Handles are created and disposed by the [`InstancePool`](crate::pool::InstancePool);
//! nothing else should terminate their process.
//!
//! Call path, per remote operation:
//! 1. Take the one-permit availability semaphore, waiting at most
//!    `availability_timeout`, unless the caller already holds a
//!    [`WorkerClaim`].
//! 2. Open the worker if it is not running yet.
//! 3. Run the operation under the [`RetryInvoker`]; an unreachable endpoint
//!    relaunches the worker between attempts.
//! 4. Persistent handles restart their worker after a recovery-class failure.
//! 5. Drop the permit, which also renews a lease if the handle has one.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{ArbiterError, Result};
use crate::launcher::{LaunchRequest, LaunchedWorker, Termination, WorkerLauncher};
use crate::resources::ResourceLimits;
use crate::retry::{RetryInvoker, RetryPolicy};
use crate::rpc::{GridRpc, RpcRequest, RpcResponse};

/// When a freshly created handle starts its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Before the handle is returned.
    Immediate,
    /// On a background task.
    Background,
    /// On the first call.
    Lazy,
}

impl OpenMode {
    pub fn from_start_immediately(start_immediately: bool) -> Self {
        if start_immediately {
            OpenMode::Immediate
        } else {
            OpenMode::Lazy
        }
    }
}

/// Identity and role of a handle.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub persistent: bool,
    /// Only meaningful for persistent handles.
    pub poolable: bool,
    pub max_attempts: u32,
    pub lease: Option<Duration>,
}

/// Settings shared by every handle of a pool.
#[derive(Debug, Clone)]
pub struct HandleSettings {
    pub retry: RetryPolicy,
    /// How long a call waits for a busy handle.
    pub availability_timeout: Duration,
}

impl Default for HandleSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            availability_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct HandleState {
    worker: Option<LaunchedWorker>,
    open_duration: Duration,
    limits: Option<ResourceLimits>,
    lease_expires_at: Option<Instant>,
}

pub struct WorkerHandle {
    spec: WorkerSpec,
    launcher: Arc<dyn WorkerLauncher>,
    transport: Arc<dyn GridRpc>,
    invoker: RetryInvoker,
    availability_timeout: Duration,
    permit: Arc<Semaphore>,
    open_lock: tokio::sync::Mutex<()>,
    state: Mutex<HandleState>,
    use_count: AtomicU32,
    disposed: AtomicBool,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.spec.name)
            .field("host", &self.spec.host)
            .field("port", &self.spec.port)
            .field("persistent", &self.spec.persistent)
            .field("process_id", &self.process_id())
            .finish()
    }
}

impl WorkerHandle {
    pub fn new(
        spec: WorkerSpec,
        launcher: Arc<dyn WorkerLauncher>,
        transport: Arc<dyn GridRpc>,
        settings: &HandleSettings,
    ) -> Self {
        let lease_expires_at = spec.lease.map(|lease| Instant::now() + lease);
        Self {
            invoker: RetryInvoker::new(spec.max_attempts, settings.retry.clone()),
            availability_timeout: settings.availability_timeout,
            permit: Arc::new(Semaphore::new(1)),
            open_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(HandleState {
                lease_expires_at,
                ..HandleState::default()
            }),
            use_count: AtomicU32::new(0),
            disposed: AtomicBool::new(false),
            spec,
            launcher,
            transport,
        }
    }

    /// A handle for a worker that is already running, e.g. one left behind
    /// by an earlier arbiter process.
    pub fn adopt(
        spec: WorkerSpec,
        launcher: Arc<dyn WorkerLauncher>,
        transport: Arc<dyn GridRpc>,
        settings: &HandleSettings,
        worker: LaunchedWorker,
    ) -> Self {
        let handle = Self::new(spec, launcher, transport, settings);
        handle.lock().worker = Some(worker);
        handle
    }

    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn host(&self) -> &str {
        &self.spec.host
    }

    pub fn port(&self) -> u16 {
        self.spec.port
    }

    pub fn is_persistent(&self) -> bool {
        self.spec.persistent
    }

    pub fn is_poolable(&self) -> bool {
        self.spec.persistent && self.spec.poolable
    }

    pub fn is_leased(&self) -> bool {
        self.spec.lease.is_some()
    }

    pub fn max_attempts(&self) -> u32 {
        self.invoker.max_attempts()
    }

    /// Zero until the worker is opened.
    pub fn process_id(&self) -> u32 {
        self.lock().worker.as_ref().map_or(0, |w| w.pid)
    }

    pub fn is_opened(&self) -> bool {
        self.process_id() != 0
    }

    /// Duration of the most recent open; zero if it found the worker running.
    pub fn open_duration(&self) -> Duration {
        self.lock().open_duration
    }

    /// Build of the running worker, empty until opened.
    pub fn version(&self) -> String {
        self.lock()
            .worker
            .as_ref()
            .map(|w| w.version.clone())
            .unwrap_or_default()
    }

    pub fn launched(&self) -> Option<LaunchedWorker> {
        self.lock().worker.clone()
    }

    pub fn use_count(&self) -> u32 {
        self.use_count.load(Ordering::SeqCst)
    }

    /// Count one more job served; returns the new total.
    pub fn record_use(&self) -> u32 {
        self.use_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn resource_limits(&self) -> Option<ResourceLimits> {
        self.lock().limits
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// No call in flight, not expired, not disposed.
    pub fn is_available(&self) -> bool {
        self.permit.available_permits() > 0 && !self.is_expired() && !self.is_disposed()
    }

    /// Take the availability permit if it is free right now. The handle
    /// stays busy for everyone else until the claim is used or dropped.
    pub fn try_claim(&self) -> Option<WorkerClaim> {
        if self.is_expired() || self.is_disposed() {
            return None;
        }
        Arc::clone(&self.permit)
            .try_acquire_owned()
            .ok()
            .map(|permit| WorkerClaim { permit })
    }

    // =========================================================================
    // Leases
    // =========================================================================

    /// Push the lease deadline to now + lease. No-op without a lease.
    pub fn renew_lease(&self) {
        if let Some(lease) = self.spec.lease {
            self.lock().lease_expires_at = Some(Instant::now() + lease);
        }
    }

    pub fn lease_expires_at(&self) -> Option<Instant> {
        self.lock().lease_expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.lock()
            .lease_expires_at
            .is_some_and(|deadline| deadline <= Instant::now())
    }

    // =========================================================================
    // Process lifecycle
    // =========================================================================

    /// Start the worker according to `mode`.
    pub async fn start(self: &Arc<Self>, mode: OpenMode) -> Result<()> {
        match mode {
            OpenMode::Immediate => self.open().await.map(|_| ()),
            OpenMode::Background => {
                let handle = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = handle.open().await {
                        warn!(worker = %handle.name(), port = handle.port(), error = %e, "Background open failed");
                    }
                });
                Ok(())
            }
            OpenMode::Lazy => Ok(()),
        }
    }

    /// Launch the worker if it is not running. Returns how long it took.
    pub async fn open(&self) -> Result<Duration> {
        let _opening = self.open_lock.lock().await;
        self.open_locked().await
    }

    async fn open_locked(&self) -> Result<Duration> {
        if self.is_disposed() {
            return Err(ArbiterError::WorkerUnavailable {
                name: self.spec.name.clone(),
                port: self.spec.port,
            });
        }
        if self.is_opened() {
            self.lock().open_duration = Duration::ZERO;
            return Ok(Duration::ZERO);
        }

        let worker = self
            .launcher
            .launch(&LaunchRequest::grid(self.spec.port))
            .await
            .inspect_err(|e| {
                error!(worker = %self.spec.name, port = self.spec.port, error = %e, "Failed to open worker");
            })?;

        let elapsed = worker.elapsed;
        info!(
            worker = %self.spec.name,
            port = self.spec.port,
            pid = worker.pid,
            elapsed_ms = elapsed.as_millis() as u64,
            "Opened worker"
        );

        let mut state = self.lock();
        state.open_duration = elapsed;
        state.worker = Some(worker);
        Ok(elapsed)
    }

    /// Kill the worker (if running) and launch a fresh one on the same port.
    pub async fn restart(&self) -> Result<Duration> {
        let _opening = self.open_lock.lock().await;

        let previous = self.lock().worker.take();
        if let Some(worker) = previous {
            info!(worker = %self.spec.name, pid = worker.pid, "Restarting worker");
            self.terminate(&worker).await;
        }
        self.open_locked().await
    }

    /// True if the worker was opened and its process is gone.
    pub async fn has_exited(&self) -> bool {
        match self.launched() {
            Some(worker) => !self.launcher.is_running(&worker).await,
            None => false,
        }
    }

    pub async fn update_limits(&self, limits: ResourceLimits) -> Result<()> {
        if let Some(worker) = self.launched() {
            self.launcher.update_limits(&worker, &limits).await?;
        }
        self.lock().limits = Some(limits);
        Ok(())
    }

    async fn terminate(&self, worker: &LaunchedWorker) {
        match self.launcher.terminate(worker).await {
            Ok(Termination::Killed) => {
                debug!(worker = %self.spec.name, pid = worker.pid, "Worker terminated")
            }
            Ok(Termination::NotRunning) => {}
            Ok(Termination::NotPermitted) => {
                warn!(worker = %self.spec.name, pid = worker.pid, "Not permitted to terminate worker")
            }
            Err(e) => {
                warn!(worker = %self.spec.name, pid = worker.pid, error = %e, "Failed to terminate worker")
            }
        }
    }

    /// Terminate the worker and mark the handle dead. Only the first call
    /// does anything; returns whether this call was it.
    pub async fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let worker = self.lock().worker.take();
        if let Some(worker) = worker {
            self.terminate(&worker).await;
        }
        debug!(worker = %self.spec.name, port = self.spec.port, "Disposed worker handle");
        true
    }

    // =========================================================================
    // Calls
    // =========================================================================

    async fn acquire(&self) -> Result<AvailabilityGuard<'_>> {
        let acquired = tokio::time::timeout(
            self.availability_timeout,
            Arc::clone(&self.permit).acquire_owned(),
        )
        .await;
        match acquired {
            Ok(Ok(permit)) => Ok(AvailabilityGuard {
                handle: self,
                _permit: permit,
            }),
            Ok(Err(_closed)) => Err(self.unavailable()),
            Err(_) => {
                warn!(worker = %self.spec.name, waited_ms = self.availability_timeout.as_millis() as u64, "Worker stayed busy");
                Err(ArbiterError::WorkerBusy {
                    name: self.spec.name.clone(),
                    waited: self.availability_timeout,
                })
            }
        }
    }

    fn unavailable(&self) -> ArbiterError {
        ArbiterError::WorkerUnavailable {
            name: self.spec.name.clone(),
            port: self.spec.port,
        }
    }

    /// Run one remote operation under the retry protocol.
    pub async fn invoke(&self, request: &RpcRequest) -> Result<RpcResponse> {
        let guard = self.acquire().await?;
        self.invoke_held(guard, request).await
    }

    /// Like [`invoke`](Self::invoke), on a permit taken by
    /// [`try_claim`](Self::try_claim).
    pub async fn invoke_claimed(&self, claim: WorkerClaim, request: &RpcRequest) -> Result<RpcResponse> {
        if !Arc::ptr_eq(claim.permit.semaphore(), &self.permit) {
            return Err(self.unavailable());
        }
        let guard = AvailabilityGuard {
            handle: self,
            _permit: claim.permit,
        };
        self.invoke_held(guard, request).await
    }

    async fn invoke_held(&self, _guard: AvailabilityGuard<'_>, request: &RpcRequest) -> Result<RpcResponse> {
        let method = request.method().name();

        if self.is_disposed() {
            return Err(self.unavailable());
        }
        if !self.is_opened() {
            if let Err(e) = self.open().await {
                warn!(worker = %self.spec.name, method, error = %e, "Worker could not be opened");
                return Err(self.unavailable());
            }
        }

        let result = self
            .invoker
            .run(
                method,
                &self.spec.name,
                |_| self.transport.call(request),
                || async {
                    if let Err(e) = self.restart().await {
                        warn!(worker = %self.spec.name, error = %e, "Reopen after unreachable endpoint failed");
                    }
                },
            )
            .await;

        match result {
            Ok(response) => Ok(response.unwrap_or(RpcResponse::Empty)),
            Err(err) => {
                if self.spec.persistent && err.is_reason_for_recovery() {
                    warn!(worker = %self.spec.name, method, error = %err, "Recovering worker");
                    if let Err(e) = self.restart().await {
                        warn!(worker = %self.spec.name, error = %e, "Worker recovery failed");
                    }
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl GridRpc for WorkerHandle {
    async fn call(&self, request: &RpcRequest) -> Result<RpcResponse> {
        self.invoke(request).await
    }
}

/// Held for the duration of one call. Dropping it frees the handle and
/// renews its lease.
struct AvailabilityGuard<'a> {
    handle: &'a WorkerHandle,
    _permit: OwnedSemaphorePermit,
}

/// A handle's availability permit, taken ahead of the call it is for.
#[derive(Debug)]
pub struct WorkerClaim {
    permit: OwnedSemaphorePermit,
}

impl Drop for AvailabilityGuard<'_> {
    fn drop(&mut self) {
        self.handle.renew_lease();
    }
}
