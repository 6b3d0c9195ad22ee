//! Host capacity and admission accounting.

use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::Serialize;
use tracing::debug;

use crate::error::JobRejectionReason;

const EPSILON: f64 = 1e-5;

/// Resources a worker may consume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceLimits {
    pub cores: f64,
    pub threads: i64,
    pub memory_mb: i64,
}

impl ResourceLimits {
    pub fn new(cores: f64, threads: i64, memory_mb: i64) -> Self {
        Self {
            cores,
            threads,
            memory_mb,
        }
    }
}

impl Add for ResourceLimits {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            cores: self.cores + rhs.cores,
            threads: self.threads + rhs.threads,
            memory_mb: self.memory_mb + rhs.memory_mb,
        }
    }
}

impl AddAssign for ResourceLimits {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sum for ResourceLimits {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

// =============================================================================
// Host measurement
// =============================================================================

#[derive(Debug, Clone)]
pub struct SystemResources {
    pub cpu_cores: u32,
    pub total_memory_mb: i64,
    pub available_memory_mb: i64,
}

impl SystemResources {
    pub fn measure() -> Self {
        let (total, available) = memory_info_bytes();
        Self {
            cpu_cores: cpu_count(),
            total_memory_mb: total / (1024 * 1024),
            available_memory_mb: available / (1024 * 1024),
        }
    }
}

fn cpu_count() -> u32 {
    #[cfg(unix)]
    {
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if count > 0 {
            return count as u32;
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get() as u32)
        .unwrap_or(1)
}

const FALLBACK_MEMORY: (i64, i64) = (16 * 1024 * 1024 * 1024, 8 * 1024 * 1024 * 1024);

fn memory_info_bytes() -> (i64, i64) {
    #[cfg(target_os = "linux")]
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        let parsed = parse_meminfo(&meminfo);
        if parsed.0 > 0 {
            return parsed;
        }
    }

    #[cfg(unix)]
    {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
        if page_size > 0 && total_pages > 0 {
            let total = page_size as i64 * total_pages as i64;
            return (total, total / 2);
        }
    }

    FALLBACK_MEMORY
}

/// `(total, available)` bytes from a `/proc/meminfo` dump.
pub fn parse_meminfo(content: &str) -> (i64, i64) {
    let mut total = 0;
    let mut available = 0;
    let mut reclaimable = 0;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let bytes = value.parse::<i64>().unwrap_or(0) * 1024;
        match key {
            "MemTotal:" => total = bytes,
            "MemAvailable:" => available = bytes,
            "MemFree:" | "Buffers:" | "Cached:" => reclaimable += bytes,
            _ => {}
        }
    }

    if available == 0 {
        available = reclaimable;
    }
    (total, available)
}

// =============================================================================
// Admission
// =============================================================================

/// Which dimensions are checked and how far each may be over-committed.
#[derive(Debug, Clone)]
pub struct ResourceSettings {
    pub check_cores: bool,
    pub check_threads: bool,
    pub check_memory: bool,
    pub core_allocation_ratio: f64,
    pub thread_allocation_ratio: f64,
    pub memory_allocation_ratio: f64,
    /// Host thread ceiling; not measurable, so configured.
    pub max_threads: i64,
    /// Limits assumed for a job that does not state its own.
    pub default_limits: ResourceLimits,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            check_cores: true,
            check_threads: false,
            check_memory: true,
            core_allocation_ratio: 1.0,
            thread_allocation_ratio: 1.0,
            memory_allocation_ratio: 1.0,
            max_threads: 4096,
            default_limits: ResourceLimits::new(1.0, 64, 1024),
        }
    }
}

/// Decides whether a new job fits next to the ones already running.
#[derive(Debug, Clone)]
pub struct ResourceTracker {
    settings: ResourceSettings,
    totals: ResourceLimits,
}

impl ResourceTracker {
    pub fn new(settings: ResourceSettings, totals: ResourceLimits) -> Self {
        Self { settings, totals }
    }

    /// Totals taken from the host.
    pub fn from_system(settings: ResourceSettings) -> Self {
        let system = SystemResources::measure();
        let totals = ResourceLimits::new(
            f64::from(system.cpu_cores),
            settings.max_threads,
            system.total_memory_mb,
        );
        debug!(
            cores = totals.cores,
            threads = totals.threads,
            memory_mb = totals.memory_mb,
            "Measured host resources"
        );
        Self::new(settings, totals)
    }

    pub fn totals(&self) -> ResourceLimits {
        self.totals
    }

    pub fn default_limits(&self) -> ResourceLimits {
        self.settings.default_limits
    }

    /// Check `needed` against what is left after `allocated`.
    ///
    /// Dimensions are checked in order cores, threads, memory; the first one
    /// that does not fit names the rejection.
    pub fn check(
        &self,
        allocated: &ResourceLimits,
        needed: &ResourceLimits,
    ) -> Result<(), JobRejectionReason> {
        let s = &self.settings;

        if s.check_cores
            && !fits(
                allocated.cores,
                needed.cores,
                self.totals.cores,
                s.core_allocation_ratio,
            )
        {
            return Err(JobRejectionReason::CpuAllocationExceeded);
        }
        if s.check_threads
            && !fits(
                allocated.threads as f64,
                needed.threads as f64,
                self.totals.threads as f64,
                s.thread_allocation_ratio,
            )
        {
            return Err(JobRejectionReason::ThreadsAllocationExceeded);
        }
        if s.check_memory
            && !fits(
                allocated.memory_mb as f64,
                needed.memory_mb as f64,
                self.totals.memory_mb as f64,
                s.memory_allocation_ratio,
            )
        {
            return Err(JobRejectionReason::MemoryAllocationExceeded);
        }
        Ok(())
    }
}

fn fits(allocated: f64, needed: f64, total: f64, ratio: f64) -> bool {
    needed <= 0.0 || allocated + needed < total * ratio + EPSILON
}
