//! TCP port allocation for new workers.
//!
//! A port is handed out only if:
//! - nobody on the host is listening on it (per the OS listener table)
//! - the pool has not already reserved it
//! - it was not released within the cool-down window
//!
//! The scan runs under an advisory file lock so two arbiter processes on the
//! same host never pick the same "free" port from the same snapshot. The
//! result is still best effort: an unrelated process can bind the port before
//! the worker does, which surfaces later as a worker open failure.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cache::{ExpirationPolicy, ExpiringMap};
use crate::error::{ArbiterError, Result};

/// Allocator settings.
#[derive(Debug, Clone)]
pub struct PortAllocatorConfig {
    /// Highest port (inclusive) the scan may return.
    pub range_end: u16,

    /// File used as the cross-process allocation lock.
    pub lock_path: PathBuf,

    /// How long to wait for another process holding the lock.
    pub lock_timeout: Duration,

    /// How long a released port is skipped.
    pub release_cooldown: Duration,
}

impl Default for PortAllocatorConfig {
    fn default() -> Self {
        Self {
            range_end: u16::MAX,
            lock_path: std::env::temp_dir().join("grid-arbiter-ports.lock"),
            lock_timeout: Duration::from_secs(5),
            release_cooldown: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Listener probes
// =============================================================================

/// Source of the host's listening TCP ports.
pub trait ListenerProbe: Send + Sync {
    /// Ports with an active TCP listener. `Err` makes the allocator fall back
    /// to a bind probe per candidate port.
    fn listening_ports(&self) -> io::Result<HashSet<u16>>;
}

/// Reads the kernel's socket tables.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemListenerProbe;

impl ListenerProbe for SystemListenerProbe {
    #[cfg(target_os = "linux")]
    fn listening_ports(&self) -> io::Result<HashSet<u16>> {
        let mut ports = parse_proc_net_tcp(&std::fs::read_to_string("/proc/net/tcp")?);
        // IPv6 may be disabled; the v4 table alone is still a valid snapshot.
        if let Ok(v6) = std::fs::read_to_string("/proc/net/tcp6") {
            ports.extend(parse_proc_net_tcp(&v6));
        }
        Ok(ports)
    }

    #[cfg(not(target_os = "linux"))]
    fn listening_ports(&self) -> io::Result<HashSet<u16>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no listener table on this platform",
        ))
    }
}

/// A fixed set of "occupied" ports.
#[derive(Debug, Default, Clone)]
pub struct StaticListenerProbe {
    ports: HashSet<u16>,
}

impl StaticListenerProbe {
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            ports: ports.into_iter().collect(),
        }
    }
}

impl ListenerProbe for StaticListenerProbe {
    fn listening_ports(&self) -> io::Result<HashSet<u16>> {
        Ok(self.ports.clone())
    }
}

const TCP_LISTEN: &str = "0A";

/// Extract local ports in LISTEN state from `/proc/net/tcp` style content.
pub fn parse_proc_net_tcp(content: &str) -> HashSet<u16> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let local = fields.nth(1)?;
            let state = fields.nth(1)?;
            if state != TCP_LISTEN {
                return None;
            }
            let (_, port_hex) = local.rsplit_once(':')?;
            u16::from_str_radix(port_hex, 16).ok()
        })
        .collect()
}

fn bind_probe_is_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

// =============================================================================
// Cross-process lock
// =============================================================================

/// Held while scanning; dropping the file releases the flock.
struct PortLockGuard {
    _file: File,
}

fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: `file` owns a valid descriptor for the duration of the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}

// =============================================================================
// Allocator
// =============================================================================

/// Finds free ports for new workers. Cheap to clone; clones share the
/// cool-down set.
#[derive(Clone)]
pub struct PortAllocator {
    shared: Arc<Shared>,
}

struct Shared {
    config: PortAllocatorConfig,
    probe: Box<dyn ListenerProbe>,
    recently_released: ExpiringMap<u16, ()>,
}

impl PortAllocator {
    pub fn new(config: PortAllocatorConfig) -> Self {
        Self::with_probe(config, SystemListenerProbe)
    }

    pub fn with_probe(config: PortAllocatorConfig, probe: impl ListenerProbe + 'static) -> Self {
        let recently_released =
            ExpiringMap::new(config.release_cooldown, ExpirationPolicy::NeverRenew);
        Self {
            shared: Arc::new(Shared {
                config,
                probe: Box::new(probe),
                recently_released,
            }),
        }
    }

    pub fn range_end(&self) -> u16 {
        self.shared.config.range_end
    }

    /// First usable port at or above `start`.
    ///
    /// `reserved` holds ports already claimed by the caller's registry. The
    /// lock wait and the listener scan run on the blocking pool.
    pub async fn find_next_available(&self, start: u16, reserved: &HashSet<u16>) -> Result<u16> {
        let end = self.shared.config.range_end;
        if start == 0 || start > end {
            return Err(ArbiterError::PortExhaustion { start, end });
        }

        let shared = Arc::clone(&self.shared);
        let reserved = reserved.clone();
        tokio::task::spawn_blocking(move || shared.scan(start, &reserved))
            .await
            .map_err(|e| ArbiterError::PortLock {
                path: self.shared.config.lock_path.display().to_string(),
                reason: format!("port scan task failed: {e}"),
            })?
    }

    /// Put a port into the cool-down set after its worker is gone.
    pub fn release(&self, port: u16) {
        if self.shared.config.release_cooldown.is_zero() {
            return;
        }
        self.shared.recently_released.insert(port, ());
    }

    pub fn is_cooling_down(&self, port: u16) -> bool {
        self.shared.recently_released.contains_key(&port)
    }
}

impl Shared {
    /// Blocks the calling thread while another process holds the lock.
    fn acquire_lock(&self) -> Result<PortLockGuard> {
        let path = &self.config.lock_path;
        let lock_err = |reason: String| ArbiterError::PortLock {
            path: path.display().to_string(),
            reason,
        };

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| lock_err(e.to_string()))?;

        let deadline = Instant::now() + self.config.lock_timeout;
        loop {
            match try_flock_exclusive(&file) {
                Ok(true) => return Ok(PortLockGuard { _file: file }),
                Ok(false) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Ok(false) => {
                    return Err(lock_err(format!(
                        "still held by another process after {:?}",
                        self.config.lock_timeout
                    )))
                }
                Err(e) => return Err(lock_err(e.to_string())),
            }
        }
    }

    fn scan(&self, start: u16, reserved: &HashSet<u16>) -> Result<u16> {
        let end = self.config.range_end;
        let _lock = self.acquire_lock()?;

        let listening = match self.probe.listening_ports() {
            Ok(ports) => Some(ports),
            Err(e) => {
                debug!(error = %e, "Listener table unavailable, probing by bind");
                None
            }
        };

        for port in start..=end {
            if reserved.contains(&port) || self.recently_released.contains_key(&port) {
                continue;
            }
            let free = match &listening {
                Some(ports) => !ports.contains(&port),
                None => bind_probe_is_free(port),
            };
            if free {
                debug!(port, start, "Allocated port");
                return Ok(port);
            }
        }

        warn!(start, end, "No free port found");
        Err(ArbiterError::PortExhaustion { start, end })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &tempfile::TempDir) -> PortAllocatorConfig {
        PortAllocatorConfig {
            range_end: 48010,
            lock_path: dir.path().join("ports.lock"),
            lock_timeout: Duration::from_millis(200),
            release_cooldown: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_parse_proc_net_tcp() {
        let sample = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12345 1 0000000000000000 100 0 0 10 0
   1: 0100007F:BB80 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 23456 1 0000000000000000 100 0 0 10 0
   2: 0100007F:BB81 0100007F:1F90 01 00000000:00000000 00:00000000 00000000  1000        0 34567 1 0000000000000000 20 4 30 10 -1
";
        let ports = parse_proc_net_tcp(sample);
        assert_eq!(ports, HashSet::from([8080, 48000]));
    }

    #[test]
    fn test_parse_proc_net_tcp6() {
        let sample = "  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000000000000:0016 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 1 1 0000000000000000 100 0 0 10 0
";
        assert_eq!(parse_proc_net_tcp(sample), HashSet::from([22]));
    }

    #[tokio::test]
    async fn test_skips_listeners_and_reserved() {
        let dir = tempfile::tempdir().unwrap();
        let allocator =
            PortAllocator::with_probe(config(&dir), StaticListenerProbe::new([48000, 48002]));
        let reserved = HashSet::from([48001]);

        assert_eq!(allocator.find_next_available(48000, &reserved).await.unwrap(), 48003);
    }

    #[tokio::test]
    async fn test_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let allocator =
            PortAllocator::with_probe(config(&dir), StaticListenerProbe::new(48005..=48010));

        let err = allocator
            .find_next_available(48005, &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ArbiterError::PortExhaustion {
                start: 48005,
                end: 48010
            }
        ));
    }

    #[tokio::test]
    async fn test_start_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = PortAllocator::with_probe(config(&dir), StaticListenerProbe::default());
        assert!(allocator.find_next_available(0, &HashSet::new()).await.is_err());
        assert!(allocator.find_next_available(48011, &HashSet::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_released_port_cools_down() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = PortAllocator::with_probe(config(&dir), StaticListenerProbe::default());

        allocator.release(48000);
        assert!(allocator.is_cooling_down(48000));
        assert_eq!(
            allocator
                .find_next_available(48000, &HashSet::new())
                .await
                .unwrap(),
            48001
        );
    }

    #[tokio::test]
    async fn test_zero_cooldown_disables_release_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.release_cooldown = Duration::ZERO;
        let allocator = PortAllocator::with_probe(cfg, StaticListenerProbe::default());

        allocator.release(48000);
        assert_eq!(
            allocator
                .find_next_available(48000, &HashSet::new())
                .await
                .unwrap(),
            48000
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lock_held_elsewhere_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let holder = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&cfg.lock_path)
            .unwrap();
        assert!(try_flock_exclusive(&holder).unwrap());

        let allocator = PortAllocator::with_probe(cfg, StaticListenerProbe::default());
        let err = allocator
            .find_next_available(48000, &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ArbiterError::PortLock { .. }));

        drop(holder);
        assert!(allocator.find_next_available(48000, &HashSet::new()).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lock_wait_keeps_runtime_responsive() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.lock_timeout = Duration::from_millis(500);
        let holder = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&cfg.lock_path)
            .unwrap();
        assert!(try_flock_exclusive(&holder).unwrap());

        let allocator = PortAllocator::with_probe(cfg, StaticListenerProbe::default());
        let reserved = HashSet::new();
        let started = tokio::time::Instant::now();
        let (timer_elapsed, result) = tokio::join!(
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                started.elapsed()
            },
            allocator.find_next_available(48000, &reserved),
        );

        assert!(timer_elapsed < Duration::from_millis(250));
        assert!(matches!(result, Err(ArbiterError::PortLock { .. })));
        drop(holder);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_system_probe_sees_real_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let ports = SystemListenerProbe.listening_ports().unwrap();
        assert!(ports.contains(&port));
    }
}
