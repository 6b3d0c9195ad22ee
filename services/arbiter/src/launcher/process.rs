//! Native process backend.
//!
//! Workers are started as child processes of the arbiter:
//! `<executable> [-onlygrid] <port>`, or `<web executable> -onlyweb` for the
//! companion web server. Workers left behind by an earlier arbiter are found by
//! scanning `/proc` for the executable name.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant, SystemTime};

use anyhow::bail;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{BackendKind, LaunchRequest, LaunchedWorker, RunningWorker, Termination, WorkerLauncher};
use crate::cache::LazyWithRetry;
use crate::error::{ArbiterError, LaunchFailure, Result};

/// Native launcher settings.
#[derive(Debug, Clone)]
pub struct ProcessLauncherConfig {
    /// Worker binary; a bare name is looked up on `PATH`.
    pub executable: PathBuf,

    /// Web server binary, if installed.
    pub web_executable: Option<PathBuf>,

    /// Spawn attempts before giving up.
    pub launch_attempts: u32,

    /// A worker that exits within this window is reported as a failed launch.
    pub startup_grace: Duration,

    /// How long to wait for a killed worker to be reaped.
    pub stop_timeout: Duration,
}

impl Default for ProcessLauncherConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("grid-worker"),
            web_executable: None,
            launch_attempts: 3,
            startup_grace: Duration::from_millis(250),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Identifies one build of the worker binary on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BinaryStamp {
    path: PathBuf,
    len: u64,
    modified: Option<SystemTime>,
}

pub struct ProcessLauncher {
    config: ProcessLauncherConfig,
    executable: LazyWithRetry<PathBuf>,
    /// Fingerprint of the binary, rehashed only when its stamp changes.
    fingerprint: std::sync::Mutex<Option<(BinaryStamp, String)>>,
    children: Mutex<HashMap<u32, Child>>,
}

impl ProcessLauncher {
    pub fn new(config: ProcessLauncherConfig) -> Self {
        let configured = config.executable.clone();
        Self {
            executable: LazyWithRetry::new(move || resolve_executable(&configured)),
            fingerprint: std::sync::Mutex::new(None),
            config,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn worker_executable(&self) -> Result<PathBuf> {
        self.executable.get().map(|path| (*path).clone()).map_err(|e| {
            warn!(error = %e, cached = e.cached, "Worker binary is not available");
            ArbiterError::LaunchFailure(LaunchFailure::WorkerNotRegistered)
        })
    }

    fn cached_fingerprint(&self, stamp: &BinaryStamp) -> Option<String> {
        let cached = self.fingerprint.lock().unwrap_or_else(|e| e.into_inner());
        cached
            .as_ref()
            .filter(|(seen, _)| seen == stamp)
            .map(|(_, fingerprint)| fingerprint.clone())
    }

    async fn spawn(&self, program: &Path, args: &[String]) -> Result<Child> {
        let attempts = self.config.launch_attempts.max(1);

        for attempt in 1..=attempts {
            let spawned = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();

            match spawned {
                Ok(child) => return Ok(child),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    self.executable.reset();
                    warn!(program = %program.display(), "Worker binary disappeared");
                    return Err(LaunchFailure::WorkerNotRegistered.into());
                }
                Err(e) => {
                    warn!(
                        program = %program.display(),
                        attempt,
                        attempts,
                        error = %e,
                        "Failed to spawn worker process"
                    );
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        Err(LaunchFailure::LaunchAttemptsExceeded.into())
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchedWorker> {
        let started = Instant::now();

        let (program, args, port) = if request.only_web {
            let web = self
                .config
                .web_executable
                .clone()
                .filter(|path| path.is_file())
                .ok_or(LaunchFailure::WebServerMissing)?;
            (web, vec!["-onlyweb".to_string()], request.port.unwrap_or(0))
        } else {
            let port = request
                .port
                .filter(|port| *port > 0)
                .ok_or(LaunchFailure::BadPort)?;
            let mut args = Vec::with_capacity(2);
            if request.only_grid {
                args.push("-onlygrid".to_string());
            }
            args.push(port.to_string());
            (self.worker_executable()?, args, port)
        };

        let mut child = self.spawn(&program, &args).await?;

        if let Ok(status) = tokio::time::timeout(self.config.startup_grace, child.wait()).await {
            let code = status?.code().unwrap_or(0);
            warn!(port, code, "Worker exited during startup");
            let failure = LaunchFailure::from_code(code).unwrap_or(LaunchFailure::Unknown(code));
            return Err(failure.into());
        }

        let pid = child.id().ok_or(LaunchFailure::Unknown(0))?;
        self.children.lock().await.insert(pid, child);

        let version = match self.version().await {
            Ok(version) => version,
            Err(e) => {
                debug!(error = %e, "Could not fingerprint worker binary");
                String::new()
            }
        };
        let elapsed = started.elapsed();
        info!(
            pid,
            port,
            elapsed_ms = elapsed.as_millis() as u64,
            "Launched worker process"
        );

        Ok(LaunchedWorker {
            pid,
            instance_id: pid.to_string(),
            port,
            elapsed,
            version,
        })
    }

    async fn terminate(&self, worker: &LaunchedWorker) -> Result<Termination> {
        let pid = worker.pid;
        let child = self.children.lock().await.remove(&pid);

        if let Some(mut child) = child {
            if matches!(child.try_wait(), Ok(Some(_))) {
                info!(pid, "Worker process not running, ignoring");
                return Ok(Termination::NotRunning);
            }
            child.start_kill()?;
            if tokio::time::timeout(self.config.stop_timeout, child.wait())
                .await
                .is_err()
            {
                warn!(pid, "Worker process did not exit after kill");
            }
            info!(pid, port = worker.port, "Killed worker process");
            return Ok(Termination::Killed);
        }

        if !process_alive(pid) {
            info!(pid, "Worker process not running, ignoring");
            return Ok(Termination::NotRunning);
        }
        if !owned_by_current_user(pid) {
            warn!(pid, "Worker process belongs to another user, not killing");
            return Ok(Termination::NotPermitted);
        }
        if send_kill(pid)? {
            info!(pid, port = worker.port, "Killed adopted worker process");
            Ok(Termination::Killed)
        } else {
            Ok(Termination::NotRunning)
        }
    }

    async fn is_running(&self, worker: &LaunchedWorker) -> bool {
        let mut children = self.children.lock().await;
        if let Some(child) = children.get_mut(&worker.pid) {
            return match child.try_wait() {
                Ok(None) => true,
                _ => {
                    children.remove(&worker.pid);
                    false
                }
            };
        }
        drop(children);
        process_alive(worker.pid)
    }

    async fn version(&self) -> Result<String> {
        let path = self.executable.get().map_err(|e| ArbiterError::Backend(e.message))?;
        let meta = tokio::fs::metadata(path.as_path()).await?;
        let stamp = BinaryStamp {
            path: path.to_path_buf(),
            len: meta.len(),
            modified: meta.modified().ok(),
        };
        if let Some(cached) = self.cached_fingerprint(&stamp) {
            return Ok(cached);
        }

        let bytes = tokio::fs::read(path.as_path()).await?;
        let version = fingerprint(&bytes);
        debug!(path = %path.display(), version = %version, "Fingerprinted worker binary");
        *self.fingerprint.lock().unwrap_or_else(|e| e.into_inner()) = Some((stamp, version.clone()));
        Ok(version)
    }

    async fn list_running(&self) -> Result<Vec<RunningWorker>> {
        let Some(name) = self.config.executable.file_name().map(|n| n.to_os_string()) else {
            return Ok(Vec::new());
        };
        let name = name.to_string_lossy().into_owned();

        tokio::task::spawn_blocking(move || scan_proc(&name))
            .await
            .map_err(|e| ArbiterError::Backend(format!("process scan panicked: {e}")))?
            .map_err(ArbiterError::from)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn resolve_executable(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() || path.components().count() > 1 {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        bail!("worker binary {} not found", path.display());
    }

    let search = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&search)
        .map(|dir| dir.join(path))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| anyhow::anyhow!("worker binary {} not found on PATH", path.display()))
}

/// Short content hash identifying a worker build.
pub(crate) fn fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..8])
}

fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: signal 0 only checks that `pid` exists and may be signalled;
    // kill(2) reads no memory from us.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Returns `Ok(false)` if the process vanished before the signal landed.
fn send_kill(pid: u32) -> io::Result<bool> {
    // SAFETY: kill(2) takes plain integers. Callers check `pid` is a live
    // worker owned by this user before sending.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(target_os = "linux")]
fn owned_by_current_user(pid: u32) -> bool {
    use std::os::unix::fs::MetadataExt;

    // SAFETY: geteuid(2) has no arguments and always succeeds.
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        return true;
    }
    std::fs::metadata(format!("/proc/{pid}"))
        .map(|meta| meta.uid() == euid)
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn owned_by_current_user(_pid: u32) -> bool {
    true
}

/// Port a worker was started with, if `cmdline` (NUL-separated argv) belongs
/// to the worker binary `exe_name`.
pub fn parse_worker_cmdline(cmdline: &[u8], exe_name: &str) -> Option<u16> {
    let mut args = cmdline
        .split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(String::from_utf8_lossy);

    let argv0 = args.next()?;
    let base = argv0.rsplit('/').next().unwrap_or(argv0.as_ref());
    if base != exe_name {
        return None;
    }

    let rest: Vec<_> = args.collect();
    if rest.iter().any(|arg| arg == "-onlyweb") {
        return None;
    }
    rest.iter().rev().find_map(|arg| arg.parse::<u16>().ok())
}

#[cfg(target_os = "linux")]
fn scan_proc(exe_name: &str) -> io::Result<Vec<RunningWorker>> {
    let mut workers = Vec::new();
    for entry in std::fs::read_dir("/proc")? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(cmdline) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        if let Some(port) = parse_worker_cmdline(&cmdline, exe_name) {
            workers.push(RunningWorker {
                pid,
                instance_id: pid.to_string(),
                port,
            });
        }
    }
    workers.sort_by_key(|w| w.pid);
    Ok(workers)
}

#[cfg(not(target_os = "linux"))]
fn scan_proc(_exe_name: &str) -> io::Result<Vec<RunningWorker>> {
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(b"/opt/grid/grid-worker\0-onlygrid\x0048000\0".as_slice(), Some(48000))]
    #[case(b"grid-worker\x0053640\0".as_slice(), Some(53640))]
    #[case(b"/usr/bin/python3\0grid-worker\x0048000\0".as_slice(), None)]
    #[case(b"grid-worker\0-onlyweb\0".as_slice(), None)]
    #[case(b"grid-worker\0".as_slice(), None)]
    #[case(b"".as_slice(), None)]
    fn test_parse_worker_cmdline(#[case] cmdline: &[u8], #[case] expected: Option<u16>) {
        assert_eq!(parse_worker_cmdline(cmdline, "grid-worker"), expected);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(fingerprint(b"abc"), fingerprint(b"abc"));
        assert_ne!(fingerprint(b"abc"), fingerprint(b"abd"));
        assert_eq!(fingerprint(b"abc").len(), 16);
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_registered() {
        let launcher = ProcessLauncher::new(ProcessLauncherConfig {
            executable: PathBuf::from("/nonexistent/grid-worker"),
            ..ProcessLauncherConfig::default()
        });
        let err = launcher.launch(&LaunchRequest::grid(48000)).await.unwrap_err();
        assert!(matches!(
            err,
            ArbiterError::LaunchFailure(LaunchFailure::WorkerNotRegistered)
        ));
    }

    #[tokio::test]
    async fn test_bad_port_and_missing_web_server() {
        let launcher = ProcessLauncher::new(ProcessLauncherConfig::default());

        let err = launcher
            .launch(&LaunchRequest {
                only_grid: true,
                port: Some(0),
                ..LaunchRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ArbiterError::LaunchFailure(LaunchFailure::BadPort)));

        let err = launcher
            .launch(&LaunchRequest {
                only_web: true,
                ..LaunchRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ArbiterError::LaunchFailure(LaunchFailure::WebServerMissing)
        ));
    }

    #[cfg(unix)]
    fn script(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("grid-worker");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_and_terminate_real_process() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(ProcessLauncherConfig {
            executable: script(&dir, "exec sleep 30"),
            startup_grace: Duration::from_millis(100),
            ..ProcessLauncherConfig::default()
        });

        let worker = launcher.launch(&LaunchRequest::grid(48123)).await.unwrap();
        assert!(worker.pid > 0);
        assert_eq!(worker.port, 48123);
        assert_eq!(worker.version.len(), 16);
        assert!(launcher.is_running(&worker).await);

        assert_eq!(launcher.terminate(&worker).await.unwrap(), Termination::Killed);
        assert!(!launcher.is_running(&worker).await);
        assert_eq!(
            launcher.terminate(&worker).await.unwrap(),
            Termination::NotRunning
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_version_is_rehashed_only_when_binary_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "echo build-a");
        let launcher = ProcessLauncher::new(ProcessLauncherConfig {
            executable: path.clone(),
            ..ProcessLauncherConfig::default()
        });

        let first = launcher.version().await.unwrap();
        let stamp = std::fs::metadata(&path).unwrap().modified().unwrap();

        // same length and mtime: the cached fingerprint is served
        std::fs::write(&path, "#!/bin/sh\necho build-b\n").unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(stamp).unwrap();
        assert_eq!(launcher.version().await.unwrap(), first);

        file.set_modified(stamp + Duration::from_secs(60)).unwrap();
        let second = launcher.version().await.unwrap();
        assert_ne!(second, first);
        assert_eq!(second, fingerprint(b"#!/bin/sh\necho build-b\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_is_a_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(ProcessLauncherConfig {
            executable: script(&dir, "exit 3"),
            startup_grace: Duration::from_secs(2),
            ..ProcessLauncherConfig::default()
        });

        let err = launcher.launch(&LaunchRequest::grid(48124)).await.unwrap_err();
        assert!(matches!(
            err,
            ArbiterError::LaunchFailure(LaunchFailure::Unknown(3))
        ));
    }
}
