//! Configuration for the arbiter.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::jobs::JobManagerConfig;
use crate::launcher::{BackendKind, ContainerLauncherConfig, ProcessLauncherConfig};
use crate::pool::PoolConfig;
use crate::port::PortAllocatorConfig;
use crate::resources::{ResourceLimits, ResourceSettings};
use crate::retry::{BackoffPolicy, RetryPolicy};
use crate::worker::HandleSettings;

/// Arbiter configuration.
#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    // ports
    pub base_port: u16,
    pub port_range_end: u16,
    pub port_lock_path: PathBuf,
    pub port_lock_timeout: Duration,
    pub port_release_cooldown: Duration,

    /// Host workers are reached on.
    pub worker_host: String,

    // retry
    pub max_attempts: u32,
    /// Per-call transport timeout.
    pub call_timeout: Duration,
    pub reopen_on_unreachable: bool,
    pub fail_on_max_attempts: bool,
    pub retry_backoff: bool,

    /// How long a call waits for a busy worker.
    pub availability_timeout: Duration,

    /// Route every call to one fixed worker.
    pub single_instance_mode: bool,
    pub single_instance_port: u16,

    // pool
    pub pool_size: usize,
    pub default_lease: Duration,
    pub lease_reap_interval: Duration,

    // backend
    pub backend: BackendKind,
    pub worker_executable: PathBuf,
    pub web_executable: Option<PathBuf>,
    pub docker_socket: PathBuf,
    pub docker_image: String,
    pub launch_attempts: u32,

    // jobs
    pub ready_instances_to_keep_in_reserve: usize,
    pub max_instances: usize,
    pub max_instance_reuses: u32,
    pub populate_tasks: usize,

    // resources
    pub check_cores: bool,
    pub check_threads: bool,
    pub check_memory: bool,
    pub core_allocation_ratio: f64,
    pub thread_allocation_ratio: f64,
    pub memory_allocation_ratio: f64,
    pub max_threads: i64,
    pub default_worker_limits: ResourceLimits,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

fn lookup_parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value {raw:?} for {key}")),
        _ => Ok(default),
    }
}

fn lookup_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool> {
    match lookup(key).as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => bail!("invalid boolean {other:?} for {key}"),
    }
}

fn lookup_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    lookup_parse(lookup, key, default).map(Duration::from_secs)
}

fn lookup_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    lookup_parse(lookup, key, default).map(Duration::from_millis)
}

impl ArbiterConfig {
    /// Load configuration from `GRID_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let l = &lookup;

        let port_lock_path = lookup("GRID_PORT_LOCK_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("grid-arbiter-ports.lock"));

        Ok(Self {
            base_port: lookup_parse(l, "GRID_BASE_PORT", 45000)?,
            port_range_end: lookup_parse(l, "GRID_PORT_RANGE_END", u16::MAX)?,
            port_lock_path,
            port_lock_timeout: lookup_millis(l, "GRID_PORT_LOCK_TIMEOUT_MS", 5000)?,
            port_release_cooldown: lookup_secs(l, "GRID_PORT_RELEASE_COOLDOWN_SECS", 30)?,

            worker_host: lookup("GRID_WORKER_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),

            max_attempts: lookup_parse(l, "GRID_MAX_ATTEMPTS", 5)?,
            call_timeout: lookup_secs(l, "GRID_CALL_TIMEOUT_SECS", 30)?,
            reopen_on_unreachable: lookup_bool(l, "GRID_REOPEN_ON_UNREACHABLE", true)?,
            fail_on_max_attempts: lookup_bool(l, "GRID_FAIL_ON_MAX_ATTEMPTS", true)?,
            retry_backoff: lookup_bool(l, "GRID_RETRY_BACKOFF", true)?,

            availability_timeout: lookup_secs(l, "GRID_AVAILABILITY_TIMEOUT_SECS", 30)?,

            single_instance_mode: lookup_bool(l, "GRID_SINGLE_INSTANCE_MODE", false)?,
            single_instance_port: lookup_parse(l, "GRID_SINGLE_INSTANCE_PORT", 53640)?,

            pool_size: lookup_parse(l, "GRID_POOL_SIZE", 25)?,
            default_lease: lookup_secs(l, "GRID_DEFAULT_LEASE_SECS", 300)?,
            lease_reap_interval: lookup_secs(l, "GRID_LEASE_REAP_INTERVAL_SECS", 5)?,

            backend: lookup_parse(l, "GRID_BACKEND", BackendKind::Process)?,
            worker_executable: lookup("GRID_WORKER_EXECUTABLE")
                .map_or_else(|| PathBuf::from("grid-worker"), PathBuf::from),
            web_executable: lookup("GRID_WEB_EXECUTABLE").map(PathBuf::from),
            docker_socket: lookup("GRID_DOCKER_SOCKET")
                .map_or_else(|| PathBuf::from("/var/run/docker.sock"), PathBuf::from),
            docker_image: lookup("GRID_DOCKER_IMAGE")
                .unwrap_or_else(|| "grid-worker:latest".to_string()),
            launch_attempts: lookup_parse(l, "GRID_LAUNCH_ATTEMPTS", 3)?,

            ready_instances_to_keep_in_reserve: lookup_parse(l, "GRID_READY_RESERVE", 2)?,
            max_instances: lookup_parse(l, "GRID_MAX_INSTANCES", 50)?,
            max_instance_reuses: lookup_parse(l, "GRID_MAX_INSTANCE_REUSES", 10)?,
            populate_tasks: lookup_parse(l, "GRID_POPULATE_TASKS", 2)?,

            check_cores: lookup_bool(l, "GRID_CHECK_CORES", true)?,
            check_threads: lookup_bool(l, "GRID_CHECK_THREADS", false)?,
            check_memory: lookup_bool(l, "GRID_CHECK_MEMORY", true)?,
            core_allocation_ratio: lookup_parse(l, "GRID_CORE_ALLOCATION_RATIO", 1.0)?,
            thread_allocation_ratio: lookup_parse(l, "GRID_THREAD_ALLOCATION_RATIO", 1.0)?,
            memory_allocation_ratio: lookup_parse(l, "GRID_MEMORY_ALLOCATION_RATIO", 1.0)?,
            max_threads: lookup_parse(l, "GRID_MAX_THREADS", 4096)?,
            default_worker_limits: ResourceLimits::new(
                lookup_parse(l, "GRID_WORKER_CORES", 1.0)?,
                lookup_parse(l, "GRID_WORKER_THREADS", 64)?,
                lookup_parse(l, "GRID_WORKER_MEMORY_MB", 1024)?,
            ),

            log_level: lookup("GRID_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Reject settings the arbiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.base_port == 0 {
            bail!("base port must be non-zero");
        }
        if self.base_port > self.port_range_end {
            bail!(
                "base port {} is above the port range end {}",
                self.base_port,
                self.port_range_end
            );
        }
        if self.single_instance_mode && self.single_instance_port == 0 {
            bail!("single instance mode needs a non-zero port");
        }
        if self.max_attempts == 0 {
            bail!("max attempts must be at least 1");
        }
        if self.call_timeout.is_zero() {
            bail!("call timeout must be non-zero");
        }
        if self.lease_reap_interval.is_zero() {
            bail!("lease reap interval must be non-zero");
        }
        if self.max_instances < self.ready_instances_to_keep_in_reserve {
            bail!(
                "max instances ({}) is below the ready reserve ({})",
                self.max_instances,
                self.ready_instances_to_keep_in_reserve
            );
        }
        for (name, ratio) in [
            ("core", self.core_allocation_ratio),
            ("thread", self.thread_allocation_ratio),
            ("memory", self.memory_allocation_ratio),
        ] {
            if !ratio.is_finite() || ratio <= 0.0 {
                bail!("{name} allocation ratio must be positive, got {ratio}");
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            reopen_on_unreachable: self.reopen_on_unreachable,
            fail_on_max_attempts: self.fail_on_max_attempts,
            backoff: self.retry_backoff.then(BackoffPolicy::default),
        }
    }

    pub fn port_allocator_config(&self) -> PortAllocatorConfig {
        PortAllocatorConfig {
            range_end: self.port_range_end,
            lock_path: self.port_lock_path.clone(),
            lock_timeout: self.port_lock_timeout,
            release_cooldown: self.port_release_cooldown,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            host: self.worker_host.clone(),
            base_port: self.base_port,
            default_max_attempts: self.max_attempts,
            single_instance_port: self.single_instance_mode.then_some(self.single_instance_port),
            warm_pool_size: if self.single_instance_mode { 0 } else { self.pool_size },
            default_lease: self.default_lease,
            lease_reap_interval: self.lease_reap_interval,
            handle: HandleSettings {
                retry: self.retry_policy(),
                availability_timeout: self.availability_timeout,
            },
        }
    }

    pub fn process_launcher_config(&self) -> ProcessLauncherConfig {
        ProcessLauncherConfig {
            executable: self.worker_executable.clone(),
            web_executable: self.web_executable.clone(),
            launch_attempts: self.launch_attempts,
            ..ProcessLauncherConfig::default()
        }
    }

    pub fn container_launcher_config(&self) -> ContainerLauncherConfig {
        ContainerLauncherConfig {
            socket_path: self.docker_socket.clone(),
            image: self.docker_image.clone(),
            launch_attempts: self.launch_attempts,
            ..ContainerLauncherConfig::default()
        }
    }

    pub fn job_manager_config(&self) -> JobManagerConfig {
        JobManagerConfig {
            ready_instances_to_keep_in_reserve: self.ready_instances_to_keep_in_reserve,
            max_instances: self.max_instances,
            max_instance_reuses: self.max_instance_reuses,
            populate_tasks: self.populate_tasks,
            worker_max_attempts: self.max_attempts,
            ..JobManagerConfig::default()
        }
    }

    pub fn resource_settings(&self) -> ResourceSettings {
        ResourceSettings {
            check_cores: self.check_cores,
            check_threads: self.check_threads,
            check_memory: self.check_memory,
            core_allocation_ratio: self.core_allocation_ratio,
            thread_allocation_ratio: self.thread_allocation_ratio,
            memory_allocation_ratio: self.memory_allocation_ratio,
            max_threads: self.max_threads,
            default_limits: self.default_worker_limits,
        }
    }
}
