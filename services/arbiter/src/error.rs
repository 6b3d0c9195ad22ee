//! Error taxonomy for the arbiter.
//!
//! Errors are split by how the retry loop must treat them:
//! - `EndpointUnreachable` and `Transient` are retried in place
//! - `Fault` and `Timeout` abort the call immediately
//! - everything else is raised by allocation, launch or bookkeeping code and
//!   goes straight back to the caller
//!
//! Admission rejections are not errors; see [`JobRejectionReason`].

use std::time::Duration;

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T, E = ArbiterError> = std::result::Result<T, E>;

/// Errors surfaced by the port allocator, worker handles, the pool and the
/// job manager.
#[derive(Debug, Error)]
pub enum ArbiterError {
    #[error("no free port in {start}..={end}")]
    PortExhaustion { start: u16, end: u16 },

    #[error("failed to take port allocation lock {path}: {reason}")]
    PortLock { path: String, reason: String },

    #[error("worker launch failed: {0}")]
    LaunchFailure(#[from] LaunchFailure),

    #[error("worker {name} on port {port} could not be opened")]
    WorkerUnavailable { name: String, port: u16 },

    #[error("worker {name} stayed busy for {waited:?}")]
    WorkerBusy { name: String, waited: Duration },

    #[error("worker {name} already exists on {host}")]
    WorkerExists { name: String, host: String },

    #[error("endpoint unreachable: {0}")]
    EndpointUnreachable(String),

    #[error("protocol fault from {method}: {message}")]
    Fault { method: &'static str, message: String },

    #[error("{method} timed out after {elapsed:?}")]
    Timeout {
        method: &'static str,
        elapsed: Duration,
    },

    #[error("transient RPC error: {0}")]
    Transient(String),

    #[error("{method} on {worker} reached its max attempts ({attempts})")]
    MaxAttemptsExceeded {
        method: &'static str,
        worker: String,
        attempts: u32,
    },

    #[error("job {0} is already active")]
    JobAlreadyActive(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job {0} found but its worker has already exited")]
    JobExited(String),

    #[error("no worker backend configured")]
    NoBackend,

    #[error("backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How the retry loop reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// The worker endpoint could not be reached; retry, possibly after a reopen.
    Unreachable,
    /// Retry without further action.
    Transient,
    /// Stop and propagate.
    Fatal,
}

const BATCH_JOB_TIMED_OUT: &str = "BatchJob Timeout";
const BATCH_JOB_ALREADY_RUNNING: &str = "Cannot invoke BatchJob while another job is running";

impl ArbiterError {
    pub fn retry_class(&self) -> RetryClass {
        match self {
            ArbiterError::EndpointUnreachable(_) => RetryClass::Unreachable,
            ArbiterError::Transient(_) => RetryClass::Transient,
            _ => RetryClass::Fatal,
        }
    }

    /// Whether this failure means the worker process should be restarted.
    ///
    /// A wedged or vanished worker shows up as an unreachable endpoint, a call
    /// timeout, or one of two well-known batch-job faults.
    pub fn is_reason_for_recovery(&self) -> bool {
        match self {
            ArbiterError::EndpointUnreachable(_) | ArbiterError::Timeout { .. } => true,
            ArbiterError::Fault { message, .. } => {
                message == BATCH_JOB_TIMED_OUT || message == BATCH_JOB_ALREADY_RUNNING
            }
            _ => false,
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, ArbiterError::Fault { .. })
    }
}

/// Known launch failure codes reported by a worker launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LaunchFailure {
    #[error("invalid worker port")]
    BadPort,

    #[error("web server is not installed")]
    WebServerMissing,

    #[error("exceeded the maximum number of launch attempts")]
    LaunchAttemptsExceeded,

    #[error("worker binary is not registered")]
    WorkerNotRegistered,

    #[error("launcher exited with unknown code {0}")]
    Unknown(i32),
}

impl LaunchFailure {
    /// Maps a launcher result code.
    ///
    /// Positive codes are process ids and therefore not failures; zero means
    /// "nothing was launched" and is reported as [`LaunchFailure::Unknown`].
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            c if c > 0 => None,
            -1 => Some(LaunchFailure::BadPort),
            -2 => Some(LaunchFailure::WebServerMissing),
            -3 => Some(LaunchFailure::LaunchAttemptsExceeded),
            -4 => Some(LaunchFailure::WorkerNotRegistered),
            other => Some(LaunchFailure::Unknown(other)),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            LaunchFailure::BadPort => -1,
            LaunchFailure::WebServerMissing => -2,
            LaunchFailure::LaunchAttemptsExceeded => -3,
            LaunchFailure::WorkerNotRegistered => -4,
            LaunchFailure::Unknown(code) => *code,
        }
    }
}

/// Why the job manager declined to hand out a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRejectionReason {
    #[error("no ready worker instance")]
    NoReadyInstance,

    #[error("CPU allocation exceeded")]
    CpuAllocationExceeded,

    #[error("thread allocation exceeded")]
    ThreadsAllocationExceeded,

    #[error("memory allocation exceeded")]
    MemoryAllocationExceeded,
}

impl JobRejectionReason {
    /// True for the capacity-accounting rejections.
    pub fn is_resource_exhausted(&self) -> bool {
        !matches!(self, JobRejectionReason::NoReadyInstance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ArbiterError::EndpointUnreachable("refused".into()), RetryClass::Unreachable)]
    #[case(ArbiterError::Transient("reset".into()), RetryClass::Transient)]
    #[case(ArbiterError::Fault { method: "execute", message: "boom".into() }, RetryClass::Fatal)]
    #[case(ArbiterError::Timeout { method: "execute", elapsed: Duration::from_secs(1) }, RetryClass::Fatal)]
    #[case(ArbiterError::PortExhaustion { start: 1, end: 2 }, RetryClass::Fatal)]
    fn test_retry_class(#[case] err: ArbiterError, #[case] expected: RetryClass) {
        assert_eq!(err.retry_class(), expected);
    }

    #[rstest]
    #[case("BatchJob Timeout", true)]
    #[case("Cannot invoke BatchJob while another job is running", true)]
    #[case("Script error on line 3", false)]
    fn test_fault_recovery_reasons(#[case] message: &str, #[case] expected: bool) {
        let err = ArbiterError::Fault {
            method: "batch_job_ex",
            message: message.to_string(),
        };
        assert_eq!(err.is_reason_for_recovery(), expected);
    }

    #[test]
    fn test_timeouts_and_unreachable_trigger_recovery() {
        assert!(ArbiterError::EndpointUnreachable("x".into()).is_reason_for_recovery());
        assert!(ArbiterError::Timeout {
            method: "hello_world",
            elapsed: Duration::from_millis(5)
        }
        .is_reason_for_recovery());
        assert!(!ArbiterError::Transient("x".into()).is_reason_for_recovery());
    }

    #[rstest]
    #[case(-1, Some(LaunchFailure::BadPort))]
    #[case(-2, Some(LaunchFailure::WebServerMissing))]
    #[case(-3, Some(LaunchFailure::LaunchAttemptsExceeded))]
    #[case(-4, Some(LaunchFailure::WorkerNotRegistered))]
    #[case(-99, Some(LaunchFailure::Unknown(-99)))]
    #[case(0, Some(LaunchFailure::Unknown(0)))]
    #[case(4242, None)]
    fn test_launch_failure_codes(#[case] code: i32, #[case] expected: Option<LaunchFailure>) {
        let mapped = LaunchFailure::from_code(code);
        assert_eq!(mapped, expected);
        if let Some(failure) = mapped {
            assert_eq!(failure.code(), code);
        }
    }

    #[test]
    fn test_rejection_resource_exhausted() {
        assert!(!JobRejectionReason::NoReadyInstance.is_resource_exhausted());
        assert!(JobRejectionReason::MemoryAllocationExceeded.is_resource_exhausted());
    }
}
