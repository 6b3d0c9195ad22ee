//! Shared registry of worker handles.
//!
//! The pool owns every [`WorkerHandle`] and the set of ports reserved for
//! them. Both live behind one async mutex, and every find-or-create operation
//! runs entirely under it, so two callers can never end up with handles on the
//! same port or with duplicate persistent names.
//!
//! Handles come in three flavours:
//! - transient: serve one dispatched call, then are disposed
//! - persistent: found again by `(name, host)`, never disposed by a call
//! - leased: persistent and poolable, with a lease renewed on every call;
//!   the reaper disposes them once the lease runs out

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use grid_id::WorkerId;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ArbiterError, Result};
use crate::launcher::{LaunchedWorker, WorkerLauncher};
use crate::port::PortAllocator;
use crate::rpc::{GridRpc, RpcConnector, RpcRequest, RpcResponse};
use crate::worker::{HandleSettings, OpenMode, WorkerClaim, WorkerHandle, WorkerSpec};

const SINGLE_INSTANCE_NAME: &str = "single-instance";

/// Pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Host every worker is reached on unless a caller names another.
    pub host: String,
    /// First port tried when nothing is allocated.
    pub base_port: u16,
    pub default_max_attempts: u32,
    /// Route every dispatched call to one fixed worker on this port.
    pub single_instance_port: Option<u16>,
    /// Leased handles kept ready for anonymous calls.
    pub warm_pool_size: usize,
    pub default_lease: Duration,
    pub lease_reap_interval: Duration,
    pub handle: HandleSettings,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            base_port: 45000,
            default_max_attempts: 5,
            single_instance_port: None,
            warm_pool_size: 0,
            default_lease: Duration::from_secs(300),
            lease_reap_interval: Duration::from_secs(5),
            handle: HandleSettings::default(),
        }
    }
}

/// Which worker a dispatched call goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerTarget {
    /// Any free pooled worker, or a fresh transient one.
    Anonymous,
    /// The persistent worker with this name, created on first use.
    Named { name: String, host: String },
}

impl WorkerTarget {
    pub fn named(name: impl Into<String>, host: impl Into<String>) -> Self {
        WorkerTarget::Named {
            name: name.into(),
            host: host.into(),
        }
    }
}

// =============================================================================
// Counters
// =============================================================================

#[derive(Default)]
struct PoolStats {
    invocations: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    instances_opened: AtomicU64,
    persistent_instances_opened: AtomicU64,
    single_instance_hits: AtomicU64,
}

/// Point-in-time copy of the pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatsSnapshot {
    pub invocations: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub instances_opened: u64,
    pub persistent_instances_opened: u64,
    pub single_instance_hits: u64,
}

// =============================================================================
// Pool
// =============================================================================

#[derive(Default)]
struct Registry {
    instances: Vec<Arc<WorkerHandle>>,
    allocated_ports: HashSet<u16>,
}

impl Registry {
    fn find(&self, name: &str, host: &str) -> Option<&Arc<WorkerHandle>> {
        self.instances
            .iter()
            .find(|h| h.name() == name && h.host() == host)
    }
}

struct NewHandle<'a> {
    name: Option<&'a str>,
    host: &'a str,
    max_attempts: u32,
    persistent: bool,
    poolable: bool,
    lease: Option<Duration>,
    fixed_port: Option<u16>,
}

pub struct InstancePool {
    config: PoolConfig,
    ports: PortAllocator,
    launcher: Arc<dyn WorkerLauncher>,
    connector: Arc<dyn RpcConnector>,
    registry: Mutex<Registry>,
    stats: PoolStats,
}

impl InstancePool {
    pub fn new(
        config: PoolConfig,
        ports: PortAllocator,
        launcher: Arc<dyn WorkerLauncher>,
        connector: Arc<dyn RpcConnector>,
    ) -> Self {
        Self {
            config,
            ports,
            launcher,
            connector,
            registry: Mutex::new(Registry::default()),
            stats: PoolStats::default(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn launcher(&self) -> &Arc<dyn WorkerLauncher> {
        &self.launcher
    }

    pub fn default_host(&self) -> &str {
        &self.config.host
    }

    // =========================================================================
    // Creation
    // =========================================================================

    async fn allocate_port(&self, registry: &mut Registry) -> Result<u16> {
        let base = self.config.base_port;
        let start = registry
            .allocated_ports
            .iter()
            .max()
            .and_then(|highest| highest.checked_add(1))
            .unwrap_or(base);

        let port = match self
            .ports
            .find_next_available(start, &registry.allocated_ports)
            .await
        {
            Ok(port) => port,
            Err(ArbiterError::PortExhaustion { .. }) if start != base => {
                debug!(start, base, "Port scan exhausted, wrapping to base port");
                self.ports
                    .find_next_available(base, &registry.allocated_ports)
                    .await?
            }
            Err(e) => return Err(e),
        };

        registry.allocated_ports.insert(port);
        Ok(port)
    }

    /// Allocate, build and register a handle. Caller holds the registry lock.
    async fn register(
        &self,
        registry: &mut Registry,
        new: NewHandle<'_>,
    ) -> Result<Arc<WorkerHandle>> {
        let port = match new.fixed_port {
            Some(port) => {
                registry.allocated_ports.insert(port);
                port
            }
            None => self.allocate_port(registry).await?,
        };

        let transport = match self.connector.connect(new.host, port) {
            Ok(transport) => transport,
            Err(e) => {
                registry.allocated_ports.remove(&port);
                return Err(e);
            }
        };

        let spec = WorkerSpec {
            name: new
                .name
                .map_or_else(|| WorkerId::new().to_string(), str::to_string),
            host: new.host.to_string(),
            port,
            persistent: new.persistent,
            poolable: new.poolable,
            max_attempts: new.max_attempts,
            lease: new.lease,
        };
        let handle = Arc::new(WorkerHandle::new(
            spec,
            Arc::clone(&self.launcher),
            transport,
            &self.config.handle,
        ));
        registry.instances.push(Arc::clone(&handle));

        if new.persistent {
            self.stats
                .persistent_instances_opened
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.instances_opened.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            worker = %handle.name(),
            port,
            persistent = new.persistent,
            poolable = new.poolable,
            "Registered worker handle"
        );
        Ok(handle)
    }

    /// Start a newly registered handle; unregister it again if that fails.
    async fn start(&self, handle: Arc<WorkerHandle>, mode: OpenMode) -> Result<Arc<WorkerHandle>> {
        if let Err(e) = handle.start(mode).await {
            self.dispose_handle(&handle).await;
            return Err(e);
        }
        Ok(handle)
    }

    /// A single-use handle on the next free port.
    pub async fn queue_transient(
        &self,
        name: Option<&str>,
        max_attempts: u32,
        host: &str,
        mode: OpenMode,
    ) -> Result<Arc<WorkerHandle>> {
        let handle = {
            let mut registry = self.registry.lock().await;
            self.register(
                &mut registry,
                NewHandle {
                    name,
                    host,
                    max_attempts,
                    persistent: false,
                    poolable: false,
                    lease: None,
                    fixed_port: None,
                },
            )
            .await?
        };
        self.start(handle, mode).await
    }

    /// A named handle found again by `(name, host)`.
    pub async fn queue_persistent(
        &self,
        name: &str,
        max_attempts: u32,
        host: &str,
        poolable: bool,
        mode: OpenMode,
    ) -> Result<Arc<WorkerHandle>> {
        let handle = {
            let mut registry = self.registry.lock().await;
            if registry.find(name, host).is_some() {
                return Err(ArbiterError::WorkerExists {
                    name: name.to_string(),
                    host: host.to_string(),
                });
            }
            self.register(
                &mut registry,
                NewHandle {
                    name: Some(name),
                    host,
                    max_attempts,
                    persistent: true,
                    poolable,
                    lease: None,
                    fixed_port: None,
                },
            )
            .await?
        };
        self.start(handle, mode).await
    }

    /// A poolable persistent handle whose lease is renewed by every call.
    pub async fn queue_leased(
        &self,
        name: Option<&str>,
        lease: Option<Duration>,
        max_attempts: u32,
        host: &str,
        mode: OpenMode,
    ) -> Result<Arc<WorkerHandle>> {
        let handle = {
            let mut registry = self.registry.lock().await;
            if let Some(name) = name.filter(|n| registry.find(n, host).is_some()) {
                return Err(ArbiterError::WorkerExists {
                    name: name.to_string(),
                    host: host.to_string(),
                });
            }
            self.register(&mut registry, self.leased(name, lease, max_attempts, host))
                .await?
        };
        self.start(handle, mode).await
    }

    fn leased<'a>(
        &self,
        name: Option<&'a str>,
        lease: Option<Duration>,
        max_attempts: u32,
        host: &'a str,
    ) -> NewHandle<'a> {
        NewHandle {
            name,
            host,
            max_attempts,
            persistent: true,
            poolable: true,
            lease: Some(lease.unwrap_or(self.config.default_lease)),
            fixed_port: None,
        }
    }

    /// Register a handle for a worker that is already running.
    pub async fn adopt(&self, worker: LaunchedWorker, host: &str) -> Result<Arc<WorkerHandle>> {
        let mut registry = self.registry.lock().await;
        if !registry.allocated_ports.insert(worker.port) {
            return Err(ArbiterError::WorkerExists {
                name: worker.instance_id,
                host: host.to_string(),
            });
        }
        let transport = match self.connector.connect(host, worker.port) {
            Ok(transport) => transport,
            Err(e) => {
                registry.allocated_ports.remove(&worker.port);
                return Err(e);
            }
        };

        let spec = WorkerSpec {
            name: WorkerId::new().to_string(),
            host: host.to_string(),
            port: worker.port,
            persistent: true,
            poolable: false,
            max_attempts: self.config.default_max_attempts,
            lease: None,
        };
        info!(worker = %spec.name, pid = worker.pid, port = worker.port, "Adopted running worker");
        let handle = Arc::new(WorkerHandle::adopt(
            spec,
            Arc::clone(&self.launcher),
            transport,
            &self.config.handle,
            worker,
        ));
        registry.instances.push(Arc::clone(&handle));
        Ok(handle)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub async fn get_by_name(&self, name: &str, host: &str) -> Option<Arc<WorkerHandle>> {
        self.registry.lock().await.find(name, host).cloned()
    }

    pub async fn get_persistent(&self, name: &str, host: &str) -> Option<Arc<WorkerHandle>> {
        self.get_by_name(name, host)
            .await
            .filter(|h| h.is_persistent())
    }

    pub async fn get_or_create(
        &self,
        name: &str,
        max_attempts: u32,
        host: &str,
        mode: OpenMode,
    ) -> Result<Arc<WorkerHandle>> {
        let handle = {
            let mut registry = self.registry.lock().await;
            if let Some(existing) = registry.find(name, host) {
                return Ok(Arc::clone(existing));
            }
            self.register(
                &mut registry,
                NewHandle {
                    name: Some(name),
                    host,
                    max_attempts,
                    persistent: false,
                    poolable: false,
                    lease: None,
                    fixed_port: None,
                },
            )
            .await?
        };
        self.start(handle, mode).await
    }

    pub async fn get_or_create_persistent(
        &self,
        name: &str,
        max_attempts: u32,
        host: &str,
        poolable: bool,
        mode: OpenMode,
    ) -> Result<Arc<WorkerHandle>> {
        let handle = {
            let mut registry = self.registry.lock().await;
            match registry.find(name, host) {
                Some(existing) if existing.is_persistent() => return Ok(Arc::clone(existing)),
                Some(_) => {
                    return Err(ArbiterError::WorkerExists {
                        name: name.to_string(),
                        host: host.to_string(),
                    })
                }
                None => {}
            }
            self.register(
                &mut registry,
                NewHandle {
                    name: Some(name),
                    host,
                    max_attempts,
                    persistent: true,
                    poolable,
                    lease: None,
                    fixed_port: None,
                },
            )
            .await?
        };
        self.start(handle, mode).await
    }

    /// Claim the first handle matching `filter` that is free, under the
    /// registry lock so concurrent callers never pick the same one.
    async fn claim_first(
        &self,
        filter: fn(&WorkerHandle) -> bool,
    ) -> Option<(Arc<WorkerHandle>, WorkerClaim)> {
        self.registry
            .lock()
            .await
            .instances
            .iter()
            .filter(|h| filter(h))
            .find_map(|h| h.try_claim().map(|claim| (Arc::clone(h), claim)))
    }

    /// A free pooled handle, already claimed for one call.
    pub async fn claim_available_poolable(&self) -> Option<(Arc<WorkerHandle>, WorkerClaim)> {
        self.claim_first(WorkerHandle::is_poolable).await
    }

    /// A free leased handle, already claimed for one call.
    pub async fn claim_available_leased(&self) -> Option<(Arc<WorkerHandle>, WorkerClaim)> {
        self.claim_first(WorkerHandle::is_leased).await
    }

    /// First pooled handle that is free right now. Another caller may take
    /// it before it is used; see [`claim_available_poolable`](Self::claim_available_poolable).
    pub async fn get_available_poolable(&self) -> Option<Arc<WorkerHandle>> {
        self.registry
            .lock()
            .await
            .instances
            .iter()
            .find(|h| h.is_poolable() && h.is_available())
            .cloned()
    }

    pub async fn get_or_create_available_poolable(
        &self,
        max_attempts: u32,
        host: &str,
        mode: OpenMode,
    ) -> Result<Arc<WorkerHandle>> {
        let handle = {
            let mut registry = self.registry.lock().await;
            if let Some(existing) = registry
                .instances
                .iter()
                .find(|h| h.is_poolable() && h.is_available())
            {
                return Ok(Arc::clone(existing));
            }
            self.register(
                &mut registry,
                NewHandle {
                    name: None,
                    host,
                    max_attempts,
                    persistent: true,
                    poolable: true,
                    lease: None,
                    fixed_port: None,
                },
            )
            .await?
        };
        self.start(handle, mode).await
    }

    pub async fn get_available_leased(&self) -> Option<Arc<WorkerHandle>> {
        self.registry
            .lock()
            .await
            .instances
            .iter()
            .find(|h| h.is_leased() && h.is_available())
            .cloned()
    }

    pub async fn get_or_create_available_leased(
        &self,
        lease: Option<Duration>,
        max_attempts: u32,
        host: &str,
        mode: OpenMode,
    ) -> Result<Arc<WorkerHandle>> {
        let handle = {
            let mut registry = self.registry.lock().await;
            if let Some(existing) = registry
                .instances
                .iter()
                .find(|h| h.is_leased() && h.is_available())
            {
                return Ok(Arc::clone(existing));
            }
            self.register(&mut registry, self.leased(None, lease, max_attempts, host))
                .await?
        };
        self.start(handle, mode).await
    }

    async fn single_instance(&self, port: u16) -> Result<Arc<WorkerHandle>> {
        let host = self.config.host.clone();
        let handle = {
            let mut registry = self.registry.lock().await;
            if let Some(existing) = registry.find(SINGLE_INSTANCE_NAME, &host) {
                return Ok(Arc::clone(existing));
            }
            self.register(
                &mut registry,
                NewHandle {
                    name: Some(SINGLE_INSTANCE_NAME),
                    host: &host,
                    max_attempts: self.config.default_max_attempts,
                    persistent: true,
                    poolable: false,
                    lease: None,
                    fixed_port: Some(port),
                },
            )
            .await?
        };
        self.start(handle, OpenMode::Lazy).await
    }

    pub async fn instances(&self) -> Vec<Arc<WorkerHandle>> {
        self.registry.lock().await.instances.clone()
    }

    pub async fn instance_count(&self) -> usize {
        self.registry.lock().await.instances.len()
    }

    /// Reserved ports, ascending.
    pub async fn allocated_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .registry
            .lock()
            .await
            .allocated_ports
            .iter()
            .copied()
            .collect();
        ports.sort_unstable();
        ports
    }

    // =========================================================================
    // Disposal
    // =========================================================================

    /// Unregister a handle, release its port and terminate its worker.
    /// Returns false if the handle was no longer registered.
    pub async fn dispose_handle(&self, handle: &Arc<WorkerHandle>) -> bool {
        let removed = {
            let mut registry = self.registry.lock().await;
            let before = registry.instances.len();
            registry.instances.retain(|h| !Arc::ptr_eq(h, handle));
            let removed = registry.instances.len() != before;
            if removed {
                registry.allocated_ports.remove(&handle.port());
            }
            removed
        };

        if removed {
            self.ports.release(handle.port());
        }
        handle.dispose().await;
        removed
    }

    pub async fn kill_all(&self) -> usize {
        let handles = {
            let mut registry = self.registry.lock().await;
            registry.allocated_ports.clear();
            std::mem::take(&mut registry.instances)
        };

        for handle in &handles {
            self.ports.release(handle.port());
            handle.dispose().await;
        }
        info!(count = handles.len(), "Killed all workers");
        handles.len()
    }

    pub async fn kill_by_name(&self, name: &str, host: &str) -> bool {
        match self.get_by_name(name, host).await {
            Some(handle) => self.dispose_handle(&handle).await,
            None => false,
        }
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// The handle `target` maps to, plus its claim when it was picked from
    /// the shared leased handles.
    async fn resolve(
        &self,
        target: &WorkerTarget,
    ) -> Result<(Arc<WorkerHandle>, Option<WorkerClaim>)> {
        if let Some(port) = self.config.single_instance_port {
            self.stats
                .single_instance_hits
                .fetch_add(1, Ordering::Relaxed);
            return Ok((self.single_instance(port).await?, None));
        }

        match target {
            WorkerTarget::Named { name, host } => {
                let handle = self
                    .get_or_create_persistent(
                        name,
                        self.config.default_max_attempts,
                        host,
                        false,
                        OpenMode::Lazy,
                    )
                    .await?;
                Ok((handle, None))
            }
            WorkerTarget::Anonymous => match self.claim_available_leased().await {
                Some((handle, claim)) => Ok((handle, Some(claim))),
                None => {
                    let handle = self
                        .queue_transient(
                            None,
                            self.config.default_max_attempts,
                            &self.config.host,
                            OpenMode::Lazy,
                        )
                        .await?;
                    Ok((handle, None))
                }
            },
        }
    }

    /// Run one remote operation on the worker `target` resolves to.
    ///
    /// Transient handles are disposed afterwards whatever the outcome, also
    /// when the returned future is dropped before completion.
    pub async fn dispatch(
        self: &Arc<Self>,
        target: &WorkerTarget,
        request: &RpcRequest,
    ) -> Result<RpcResponse> {
        self.stats.invocations.fetch_add(1, Ordering::Relaxed);

        let (handle, claim) = match self.resolve(target).await {
            Ok(resolved) => resolved,
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let cleanup = (!handle.is_persistent()).then(|| TransientCleanup {
            pool: Arc::clone(self),
            handle: Some(Arc::clone(&handle)),
        });

        let result = match claim {
            Some(claim) => handle.invoke_claimed(claim, request).await,
            None => handle.invoke(request).await,
        };
        match &result {
            Ok(_) => self.stats.succeeded.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.stats.failed.fetch_add(1, Ordering::Relaxed),
        };

        if let Some(cleanup) = cleanup {
            cleanup.run().await;
        }
        result
    }

    /// A [`GridRpc`] that dispatches every call to `target`.
    pub fn client(self: &Arc<Self>, target: WorkerTarget) -> PoolClient {
        PoolClient {
            pool: Arc::clone(self),
            target,
        }
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        let s = &self.stats;
        PoolStatsSnapshot {
            invocations: s.invocations.load(Ordering::Relaxed),
            succeeded: s.succeeded.load(Ordering::Relaxed),
            failed: s.failed.load(Ordering::Relaxed),
            instances_opened: s.instances_opened.load(Ordering::Relaxed),
            persistent_instances_opened: s.persistent_instances_opened.load(Ordering::Relaxed),
            single_instance_hits: s.single_instance_hits.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Warm pool
    // =========================================================================

    /// Create leased handles until `count` exist. Workers start in the
    /// background. Returns how many were created.
    pub async fn warm_up(&self, count: usize) -> Result<usize> {
        let mut created = Vec::new();
        {
            let mut registry = self.registry.lock().await;
            let existing = registry.instances.iter().filter(|h| h.is_leased()).count();
            for _ in existing..count {
                let host = self.config.host.clone();
                let new = self.leased(None, None, self.config.default_max_attempts, &host);
                let handle = self.register(&mut registry, new).await?;
                created.push(handle);
            }
        }

        for handle in &created {
            handle.start(OpenMode::Background).await?;
        }
        if !created.is_empty() {
            info!(created = created.len(), target = count, "Warmed worker pool");
        }
        Ok(created.len())
    }

    /// Dispose leased handles whose lease ran out while idle.
    pub async fn reap_expired(&self) -> usize {
        let expired: Vec<_> = self
            .registry
            .lock()
            .await
            .instances
            .iter()
            .filter(|h| h.is_expired() && h.is_leased())
            .cloned()
            .collect();

        let mut reaped = 0;
        for handle in expired {
            if self.dispose_handle(&handle).await {
                debug!(worker = %handle.name(), port = handle.port(), "Reaped expired lease");
                reaped += 1;
            }
        }
        reaped
    }

    /// Reap expired leases and top the warm pool back up every
    /// `lease_reap_interval` until `shutdown` flips to true.
    pub fn spawn_lease_reaper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.lease_reap_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = pool.reap_expired().await;
                        if reaped > 0 {
                            info!(reaped, "Reaped expired worker leases");
                        }
                        if pool.config.warm_pool_size > 0 {
                            if let Err(e) = pool.warm_up(pool.config.warm_pool_size).await {
                                warn!(error = %e, "Failed to refill worker pool");
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Disposes a transient handle once its call is done. If dropped without
/// [`run`](Self::run), the disposal moves to a background task.
struct TransientCleanup {
    pool: Arc<InstancePool>,
    handle: Option<Arc<WorkerHandle>>,
}

impl TransientCleanup {
    async fn run(mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.dispose_handle(&handle).await;
        }
    }
}

impl Drop for TransientCleanup {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let pool = Arc::clone(&self.pool);
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    pool.dispose_handle(&handle).await;
                });
            } else {
                warn!(worker = %handle.name(), "No runtime to dispose abandoned worker");
            }
        }
    }
}

/// Dispatching view of the pool bound to one target.
pub struct PoolClient {
    pool: Arc<InstancePool>,
    target: WorkerTarget,
}

impl PoolClient {
    pub fn target(&self) -> &WorkerTarget {
        &self.target
    }
}

#[async_trait]
impl GridRpc for PoolClient {
    async fn call(&self, request: &RpcRequest) -> Result<RpcResponse> {
        self.pool.dispatch(&self.target, request).await
    }
}
