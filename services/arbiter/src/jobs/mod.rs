//! Job-to-worker binding with admission control.
//!
//! The job manager keeps a stack of ready workers and a map of active jobs.
//! Handing out a worker:
//! 1. Check the resource tracker against what active and admitting jobs
//!    already hold, and reserve the job's share in the same critical section.
//! 2. Take a ready worker, discarding any that are out of date or dead.
//! 3. Record the job with its expiration, turning the reservation into an
//!    active entry.
//!
//! Closing a job either recycles its worker into the ready stack or disposes
//! it through the pool. Background maintenance lives in [`maintenance`].

mod maintenance;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use grid_id::WorkerId;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{ArbiterError, JobRejectionReason, Result};
use crate::launcher::BackendKind;
use crate::pool::InstancePool;
use crate::resources::{ResourceLimits, ResourceTracker};
use crate::rpc::{Job, RpcRequest, RpcResponse};
use crate::worker::{OpenMode, WorkerHandle};

pub use maintenance::RecoveryReport;

/// Job manager settings.
#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    /// Ready workers kept started ahead of demand.
    pub ready_instances_to_keep_in_reserve: usize,
    /// Ceiling on ready + active + starting workers.
    pub max_instances: usize,
    /// Jobs a worker may serve before it is disposed instead of recycled.
    pub max_instance_reuses: u32,
    /// Workers started concurrently while populating.
    pub populate_tasks: usize,
    pub worker_max_attempts: u32,
    /// How long `new_job` waits for a ready worker when asked to.
    pub ready_wait_timeout: Duration,
    pub populate_interval: Duration,
    pub sweep_interval: Duration,
    /// Extra time an expired job keeps its worker before being swept.
    pub expiration_grace: Duration,
    pub version_check_interval: Duration,
    /// Expiration given to a job found on a worker at startup.
    pub recovered_job_lease: Duration,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            ready_instances_to_keep_in_reserve: 2,
            max_instances: 50,
            max_instance_reuses: 10,
            populate_tasks: 2,
            worker_max_attempts: 5,
            ready_wait_timeout: Duration::from_secs(30),
            populate_interval: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(3),
            expiration_grace: Duration::from_secs(5),
            version_check_interval: Duration::from_secs(10),
            recovered_job_lease: Duration::from_secs(300),
        }
    }
}

/// A job bound to a worker.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub handle: Arc<WorkerHandle>,
    pub expires_at: DateTime<Utc>,
    pub limits: ResourceLimits,
}

/// Outcome of [`JobManager::new_job`].
#[derive(Debug)]
pub enum JobAdmission {
    Admitted(Arc<WorkerHandle>),
    Rejected(JobRejectionReason),
}

impl JobAdmission {
    pub fn handle(&self) -> Option<&Arc<WorkerHandle>> {
        match self {
            JobAdmission::Admitted(handle) => Some(handle),
            JobAdmission::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<JobRejectionReason> {
        match self {
            JobAdmission::Admitted(_) => None,
            JobAdmission::Rejected(reason) => Some(*reason),
        }
    }
}

/// Counts for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobManagerCounts {
    pub ready: usize,
    pub active: usize,
    pub populating: usize,
}

impl JobManagerCounts {
    pub fn instances(&self) -> usize {
        self.ready + self.active + self.populating
    }
}

#[derive(Default)]
struct JobState {
    ready: Vec<Arc<WorkerHandle>>,
    active: HashMap<String, ActiveJob>,
    /// Limits of jobs past the admission check but not yet active.
    pending: HashMap<String, ResourceLimits>,
    populating: usize,
}

impl JobState {
    fn allocated(&self) -> ResourceLimits {
        let active: ResourceLimits = self.active.values().map(|job| job.limits).sum();
        let pending: ResourceLimits = self.pending.values().copied().sum();
        active + pending
    }
}

/// Releases a pending reservation unless it was turned into an active job.
struct Reservation<'a> {
    manager: &'a JobManager,
    job_id: Option<String>,
}

impl Reservation<'_> {
    /// Called with the state lock held, once the job is recorded as active
    /// or is known to be untracked.
    fn settle(&mut self, state: &mut JobState) {
        if let Some(job_id) = self.job_id.take() {
            state.pending.remove(&job_id);
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(job_id) = self.job_id.take() {
            self.manager.lock().pending.remove(&job_id);
        }
    }
}

/// Hands out workers to jobs.
pub struct JobManager {
    config: JobManagerConfig,
    pool: Arc<InstancePool>,
    resources: ResourceTracker,
    state: Mutex<JobState>,
    ready_added: Notify,
    current_version: Mutex<Option<String>>,
}

fn deadline_after(from: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(after)
        .ok()
        .and_then(|delta| from.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn job_expiration(job: &Job) -> Duration {
    Duration::try_from_secs_f64(job.expiration_in_seconds).unwrap_or(Duration::ZERO)
}

impl JobManager {
    pub fn new(config: JobManagerConfig, pool: Arc<InstancePool>, resources: ResourceTracker) -> Self {
        Self {
            config,
            pool,
            resources,
            state: Mutex::new(JobState::default()),
            ready_added: Notify::new(),
            current_version: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &JobManagerConfig {
        &self.config
    }

    /// Which launch backend the workers come from.
    pub fn backend(&self) -> BackendKind {
        self.pool.launcher().kind()
    }

    pub fn current_version(&self) -> Option<String> {
        self.current_version
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_current_version(&self, version: &str) -> bool {
        let mut current = self
            .current_version
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if current.as_deref() == Some(version) {
            return false;
        }
        *current = Some(version.to_string());
        true
    }

    fn is_current(&self, handle: &WorkerHandle) -> bool {
        self.current_version()
            .is_none_or(|current| handle.version() == current)
    }

    fn limits_for(&self, job: &Job) -> ResourceLimits {
        let mut limits = self.resources.default_limits();
        if job.cores > 0.0 {
            limits.cores = job.cores;
        }
        limits
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Resources held by active jobs and by jobs still being admitted.
    pub fn allocated_resources(&self) -> ResourceLimits {
        self.lock().allocated()
    }

    fn has_spare_capacity(&self, state: &JobState) -> bool {
        let reserve = self.config.ready_instances_to_keep_in_reserve;
        let total = state.ready.len() + state.active.len() + state.populating;
        reserve > 0 && total < self.config.max_instances
    }

    /// Whether a job needing `needed` would be admitted right now.
    pub fn is_resource_available(&self, needed: &ResourceLimits) -> Result<(), JobRejectionReason> {
        self.admission_check(&self.lock(), needed)
    }

    fn admission_check(&self, state: &JobState, needed: &ResourceLimits) -> Result<(), JobRejectionReason> {
        self.resources.check(&state.allocated(), needed)?;
        if state.ready.is_empty() && !self.has_spare_capacity(state) {
            return Err(JobRejectionReason::NoReadyInstance);
        }
        Ok(())
    }

    /// Check `needed` and set it aside for `job_id` under one lock, so
    /// concurrent admissions see each other's share.
    fn reserve(
        &self,
        job_id: &str,
        needed: ResourceLimits,
    ) -> Result<Result<Reservation<'_>, JobRejectionReason>> {
        let mut state = self.lock();
        if state.active.contains_key(job_id) || state.pending.contains_key(job_id) {
            return Err(ArbiterError::JobAlreadyActive(job_id.to_string()));
        }
        if let Err(reason) = self.admission_check(&state, &needed) {
            return Ok(Err(reason));
        }
        state.pending.insert(job_id.to_string(), needed);
        Ok(Ok(Reservation {
            manager: self,
            job_id: Some(job_id.to_string()),
        }))
    }

    /// Bind `job` to a worker.
    ///
    /// Rejections come back as [`JobAdmission::Rejected`] and leave no trace.
    /// A job id that is already active or still being admitted is an error.
    pub async fn new_job(
        &self,
        job: &Job,
        wait_for_ready: bool,
        track_as_active: bool,
    ) -> Result<JobAdmission> {
        let limits = self.limits_for(job);
        let mut reservation = match self.reserve(&job.id, limits)? {
            Ok(reservation) => reservation,
            Err(reason) => {
                info!(job_id = %job.id, reason = %reason, "Rejected job");
                return Ok(JobAdmission::Rejected(reason));
            }
        };

        let Some(handle) = self.take_ready(wait_for_ready).await else {
            info!(job_id = %job.id, wait_for_ready, "No ready worker for job");
            return Ok(JobAdmission::Rejected(JobRejectionReason::NoReadyInstance));
        };

        let uses = handle.record_use();
        if let Err(e) = handle.update_limits(limits).await {
            warn!(job_id = %job.id, worker = %handle.name(), error = %e, "Failed to apply worker limits");
        }

        let expires_at = deadline_after(Utc::now(), job_expiration(job));
        {
            let mut state = self.lock();
            reservation.settle(&mut state);
            if track_as_active {
                if state.active.contains_key(&job.id) {
                    drop(state);
                    self.return_to_ready(handle);
                    return Err(ArbiterError::JobAlreadyActive(job.id.clone()));
                }
                state.active.insert(
                    job.id.clone(),
                    ActiveJob {
                        handle: Arc::clone(&handle),
                        expires_at,
                        limits,
                    },
                );
            }
        }

        info!(
            job_id = %job.id,
            worker = %handle.name(),
            port = handle.port(),
            uses,
            expires_at = %expires_at,
            "Started job"
        );
        Ok(JobAdmission::Admitted(handle))
    }

    /// Pop a usable ready worker, discarding stale or dead ones. Starts one
    /// inline when waiting and there is room.
    async fn take_ready(&self, wait: bool) -> Option<Arc<WorkerHandle>> {
        let deadline = tokio::time::Instant::now() + self.config.ready_wait_timeout;
        loop {
            let added = self.ready_added.notified();
            let candidate = self.lock().ready.pop();

            match candidate {
                Some(handle) => {
                    if !self.is_current(&handle) {
                        debug!(worker = %handle.name(), version = %handle.version(), "Discarding out-of-date worker");
                        self.pool.dispose_handle(&handle).await;
                        continue;
                    }
                    if handle.has_exited().await || handle.is_disposed() {
                        debug!(worker = %handle.name(), "Discarding exited worker");
                        self.pool.dispose_handle(&handle).await;
                        continue;
                    }
                    return Some(handle);
                }
                None if !wait => return None,
                None if tokio::time::Instant::now() >= deadline => return None,
                None => {
                    if self.reserve_populate_slot() {
                        if let Err(e) = self.create_ready_instance().await {
                            warn!(error = %e, "Failed to start worker for waiting job");
                            return None;
                        }
                        continue;
                    }
                    if tokio::time::timeout_at(deadline, added).await.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    fn return_to_ready(&self, handle: Arc<WorkerHandle>) {
        self.lock().ready.push(handle);
        self.ready_added.notify_waiters();
    }

    // =========================================================================
    // Active jobs
    // =========================================================================

    /// Push a job's expiration to now + `extra`. Never moves it earlier.
    pub async fn renew_lease(&self, job_id: &str, extra: Duration) -> Result<DateTime<Utc>> {
        let handle = self.active_handle(job_id)?;
        if handle.has_exited().await {
            return Err(ArbiterError::JobExited(job_id.to_string()));
        }

        let mut state = self.lock();
        let job = state
            .active
            .get_mut(job_id)
            .ok_or_else(|| ArbiterError::JobNotFound(job_id.to_string()))?;
        let renewed = deadline_after(Utc::now(), extra);
        if renewed > job.expires_at {
            job.expires_at = renewed;
        }
        debug!(job_id, expires_at = %job.expires_at, "Renewed job lease");
        Ok(job.expires_at)
    }

    fn active_handle(&self, job_id: &str) -> Result<Arc<WorkerHandle>> {
        self.lock()
            .active
            .get(job_id)
            .map(|job| Arc::clone(&job.handle))
            .ok_or_else(|| ArbiterError::JobNotFound(job_id.to_string()))
    }

    /// The worker serving an active job. A job whose worker exited is dropped.
    pub async fn get_job(&self, job_id: &str) -> Result<Arc<WorkerHandle>> {
        let handle = self.active_handle(job_id)?;
        if handle.has_exited().await {
            warn!(job_id, worker = %handle.name(), "Worker for job has exited");
            self.remove_active(job_id, &handle);
            self.pool.dispose_handle(&handle).await;
            return Err(ArbiterError::JobExited(job_id.to_string()));
        }
        Ok(handle)
    }

    pub fn active_job(&self, job_id: &str) -> Option<ActiveJob> {
        self.lock().active.get(job_id).cloned()
    }

    fn remove_active(&self, job_id: &str, handle: &Arc<WorkerHandle>) -> bool {
        let mut state = self.lock();
        match state.active.get(job_id) {
            Some(job) if Arc::ptr_eq(&job.handle, handle) => {
                state.active.remove(job_id);
                true
            }
            _ => false,
        }
    }

    /// Forget a job. Returns true if its worker went back to the ready stack.
    pub async fn close_job(&self, job_id: &str, attempt_to_recycle: bool) -> Result<bool> {
        let job = self
            .lock()
            .active
            .remove(job_id)
            .ok_or_else(|| ArbiterError::JobNotFound(job_id.to_string()))?;

        let recycled = self.release_instance(&job.handle, attempt_to_recycle).await;
        info!(job_id, worker = %job.handle.name(), recycled, "Closed job");
        Ok(recycled)
    }

    /// Return a worker that served a job (tracked or not). It is recycled
    /// if asked and still fit for reuse, otherwise disposed.
    pub async fn release_instance(&self, handle: &Arc<WorkerHandle>, attempt_to_recycle: bool) -> bool {
        if attempt_to_recycle
            && handle.use_count() < self.config.max_instance_reuses
            && self.is_current(handle)
            && handle.is_opened()
            && !handle.is_disposed()
            && !handle.has_exited().await
        {
            self.return_to_ready(Arc::clone(handle));
            return true;
        }
        self.pool.dispose_handle(handle).await;
        false
    }

    pub fn active_jobs_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn running_job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().active.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close every active job whose worker died, returning their ids.
    pub async fn unexpected_exit_jobs(&self) -> Vec<String> {
        let active: Vec<(String, Arc<WorkerHandle>)> = self
            .lock()
            .active
            .iter()
            .map(|(id, job)| (id.clone(), Arc::clone(&job.handle)))
            .collect();

        let mut exited = Vec::new();
        for (job_id, handle) in active {
            if !handle.has_exited().await {
                continue;
            }
            if self.remove_active(&job_id, &handle) {
                warn!(job_id = %job_id, worker = %handle.name(), "Worker exited unexpectedly");
                self.pool.dispose_handle(&handle).await;
                exited.push(job_id);
            }
        }
        exited.sort();
        exited
    }

    /// Send `request` to the worker of every active job that is still alive.
    /// Results are ordered by job id.
    pub async fn dispatch_to_all_active_jobs(
        &self,
        request: &RpcRequest,
    ) -> Vec<(String, Result<RpcResponse>)> {
        let active: Vec<(String, Arc<WorkerHandle>)> = self
            .lock()
            .active
            .iter()
            .map(|(id, job)| (id.clone(), Arc::clone(&job.handle)))
            .collect();

        let mut calls = JoinSet::new();
        for (job_id, handle) in active {
            let request = request.clone();
            calls.spawn(async move {
                if handle.has_exited().await {
                    return None;
                }
                Some((job_id, handle.invoke(&request).await))
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Broadcast call task failed"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Apply new limits to an active job's worker.
    pub async fn update_worker_resources(&self, job_id: &str, limits: ResourceLimits) -> Result<()> {
        let handle = self.get_job(job_id).await?;
        handle.update_limits(limits).await?;
        if let Some(job) = self.lock().active.get_mut(job_id) {
            job.limits = limits;
        }
        Ok(())
    }

    pub fn ready_count(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn counts(&self) -> JobManagerCounts {
        let state = self.lock();
        JobManagerCounts {
            ready: state.ready.len(),
            active: state.active.len(),
            populating: state.populating,
        }
    }

    // =========================================================================
    // Population
    // =========================================================================

    fn reserve_populate_slot(&self) -> bool {
        let mut state = self.lock();
        let in_flight = state.ready.len() + state.populating;
        if in_flight < self.config.ready_instances_to_keep_in_reserve
            && in_flight + state.active.len() < self.config.max_instances
        {
            state.populating += 1;
            true
        } else {
            false
        }
    }

    /// Start one worker into the ready stack. The caller must have reserved
    /// a populate slot; it is given back here whatever the outcome.
    async fn create_ready_instance(&self) -> Result<Arc<WorkerHandle>> {
        let name = WorkerId::new().to_string();
        let result = self
            .pool
            .queue_persistent(
                &name,
                self.config.worker_max_attempts,
                self.pool.default_host(),
                false,
                OpenMode::Immediate,
            )
            .await;

        let mut state = self.lock();
        state.populating = state.populating.saturating_sub(1);
        let handle = result?;
        state.ready.push(Arc::clone(&handle));
        drop(state);

        self.ready_added.notify_waiters();
        debug!(worker = %handle.name(), port = handle.port(), "Worker ready");
        Ok(handle)
    }

    /// Start workers until the reserve is full or the instance ceiling is
    /// hit. Returns how many were started.
    pub async fn populate(self: &Arc<Self>) -> usize {
        let mut started = 0;
        loop {
            let mut batch = JoinSet::new();
            while batch.len() < self.config.populate_tasks.max(1) && self.reserve_populate_slot() {
                let manager = Arc::clone(self);
                batch.spawn(async move { manager.create_ready_instance().await });
            }
            if batch.is_empty() {
                break;
            }

            let mut failed = false;
            while let Some(joined) = batch.join_next().await {
                match joined {
                    Ok(Ok(_)) => started += 1,
                    Ok(Err(e)) => {
                        warn!(error = %e, "Failed to start ready worker");
                        failed = true;
                    }
                    Err(e) => {
                        warn!(error = %e, "Populate task failed");
                        failed = true;
                    }
                }
            }
            if failed {
                break;
            }
        }
        started
    }
}
