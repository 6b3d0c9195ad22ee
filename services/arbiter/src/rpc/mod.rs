//! Remote operation surface of a grid worker.
//!
//! The set of operations is fixed. Every call is a [`RpcRequest`] answered by a
//! [`RpcResponse`]; [`GridRpc`] is the single entry point implemented by:
//! - [`HttpRpcClient`], the thin transport adapter
//! - [`crate::worker::WorkerHandle`], which wraps a transport in the retry
//!   protocol
//! - [`crate::pool::PoolClient`], which routes through the pool's dispatch
//!
//! [`GridRpcExt`] layers the typed per-operation methods over any of them.

mod http;
mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use grid_id::JobId;
use serde::{Deserialize, Serialize};

use crate::error::{ArbiterError, Result};

pub use http::{HttpConnector, HttpRpcClient};
pub use mock::{MockConnector, MockFailure, MockGridRpc};

// =============================================================================
// Payload types
// =============================================================================

/// A job as the worker sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub expiration_in_seconds: f64,
    #[serde(default)]
    pub category: i32,
    #[serde(default)]
    pub cores: f64,
}

impl Job {
    pub fn new(id: impl Into<String>, expiration_in_seconds: f64) -> Self {
        Self {
            id: id.into(),
            expiration_in_seconds,
            category: 0,
            cores: 1.0,
        }
    }

    /// A job with a freshly minted `job_` identifier.
    pub fn generate(expiration_in_seconds: f64) -> Self {
        Self::new(JobId::new().to_string(), expiration_in_seconds)
    }
}

/// Script payload. Its content is opaque to the arbiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptExecution {
    pub name: String,
    pub script: String,
    #[serde(default)]
    pub arguments: Vec<LuaValue>,
}

impl ScriptExecution {
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            arguments: Vec::new(),
        }
    }
}

/// Script argument / return value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum LuaValue {
    Nil,
    Boolean(bool),
    Number(f64),
    String(String),
    Table(Vec<LuaValue>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub version: String,
    pub environment_count: i32,
}

// =============================================================================
// Requests and responses
// =============================================================================

/// Names of the remote operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    HelloWorld,
    GetVersion,
    GetStatus,
    OpenJob,
    OpenJobEx,
    Execute,
    ExecuteEx,
    CloseJob,
    BatchJob,
    BatchJobEx,
    GetExpiration,
    RenewLease,
    GetAllJobs,
    GetAllJobsEx,
    CloseExpiredJobs,
    CloseAllJobs,
    Diag,
    DiagEx,
}

impl RpcMethod {
    pub const fn name(self) -> &'static str {
        match self {
            RpcMethod::HelloWorld => "hello_world",
            RpcMethod::GetVersion => "get_version",
            RpcMethod::GetStatus => "get_status",
            RpcMethod::OpenJob => "open_job",
            RpcMethod::OpenJobEx => "open_job_ex",
            RpcMethod::Execute => "execute",
            RpcMethod::ExecuteEx => "execute_ex",
            RpcMethod::CloseJob => "close_job",
            RpcMethod::BatchJob => "batch_job",
            RpcMethod::BatchJobEx => "batch_job_ex",
            RpcMethod::GetExpiration => "get_expiration",
            RpcMethod::RenewLease => "renew_lease",
            RpcMethod::GetAllJobs => "get_all_jobs",
            RpcMethod::GetAllJobsEx => "get_all_jobs_ex",
            RpcMethod::CloseExpiredJobs => "close_expired_jobs",
            RpcMethod::CloseAllJobs => "close_all_jobs",
            RpcMethod::Diag => "diag",
            RpcMethod::DiagEx => "diag_ex",
        }
    }
}

impl std::fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One remote call with its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum RpcRequest {
    HelloWorld,
    GetVersion,
    GetStatus,
    OpenJob { job: Job, script: ScriptExecution },
    OpenJobEx { job: Job, script: ScriptExecution },
    Execute { job_id: String, script: ScriptExecution },
    ExecuteEx { job_id: String, script: ScriptExecution },
    CloseJob { job_id: String },
    BatchJob { job: Job, script: ScriptExecution },
    BatchJobEx { job: Job, script: ScriptExecution },
    GetExpiration { job_id: String },
    RenewLease { job_id: String, expiration_in_seconds: f64 },
    GetAllJobs,
    GetAllJobsEx,
    CloseExpiredJobs,
    CloseAllJobs,
    Diag { kind: i32, job_id: Option<String> },
    DiagEx { kind: i32, job_id: Option<String> },
}

impl RpcRequest {
    pub fn method(&self) -> RpcMethod {
        match self {
            RpcRequest::HelloWorld => RpcMethod::HelloWorld,
            RpcRequest::GetVersion => RpcMethod::GetVersion,
            RpcRequest::GetStatus => RpcMethod::GetStatus,
            RpcRequest::OpenJob { .. } => RpcMethod::OpenJob,
            RpcRequest::OpenJobEx { .. } => RpcMethod::OpenJobEx,
            RpcRequest::Execute { .. } => RpcMethod::Execute,
            RpcRequest::ExecuteEx { .. } => RpcMethod::ExecuteEx,
            RpcRequest::CloseJob { .. } => RpcMethod::CloseJob,
            RpcRequest::BatchJob { .. } => RpcMethod::BatchJob,
            RpcRequest::BatchJobEx { .. } => RpcMethod::BatchJobEx,
            RpcRequest::GetExpiration { .. } => RpcMethod::GetExpiration,
            RpcRequest::RenewLease { .. } => RpcMethod::RenewLease,
            RpcRequest::GetAllJobs => RpcMethod::GetAllJobs,
            RpcRequest::GetAllJobsEx => RpcMethod::GetAllJobsEx,
            RpcRequest::CloseExpiredJobs => RpcMethod::CloseExpiredJobs,
            RpcRequest::CloseAllJobs => RpcMethod::CloseAllJobs,
            RpcRequest::Diag { .. } => RpcMethod::Diag,
            RpcRequest::DiagEx { .. } => RpcMethod::DiagEx,
        }
    }
}

/// Result of a remote call.
///
/// `Empty` is also what a lenient retry policy yields after exhausting its
/// attempts; the typed accessors turn it into the operation's default value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RpcResponse {
    Empty,
    Text(String),
    Status(WorkerStatus),
    Values(Vec<LuaValue>),
    Seconds(f64),
    Jobs(Vec<Job>),
    Count(i32),
}

impl RpcResponse {
    fn kind(&self) -> &'static str {
        match self {
            RpcResponse::Empty => "empty",
            RpcResponse::Text(_) => "text",
            RpcResponse::Status(_) => "status",
            RpcResponse::Values(_) => "values",
            RpcResponse::Seconds(_) => "seconds",
            RpcResponse::Jobs(_) => "jobs",
            RpcResponse::Count(_) => "count",
        }
    }
}

fn unexpected(method: RpcMethod, response: &RpcResponse) -> ArbiterError {
    ArbiterError::Fault {
        method: method.name(),
        message: format!("unexpected {} response", response.kind()),
    }
}

// =============================================================================
// Traits
// =============================================================================

/// A worker's remote operation surface.
#[async_trait]
pub trait GridRpc: Send + Sync {
    async fn call(&self, request: &RpcRequest) -> Result<RpcResponse>;
}

/// Builds transports for worker endpoints.
pub trait RpcConnector: Send + Sync {
    fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn GridRpc>>;
}

macro_rules! expect_response {
    ($response:expr, $method:expr, $variant:ident) => {
        match $response {
            RpcResponse::$variant(value) => Ok(value),
            RpcResponse::Empty => Ok(Default::default()),
            other => Err(unexpected($method, &other)),
        }
    };
}

/// Typed operations over any [`GridRpc`].
#[async_trait]
pub trait GridRpcExt: GridRpc {
    async fn hello_world(&self) -> Result<String> {
        let response = self.call(&RpcRequest::HelloWorld).await?;
        expect_response!(response, RpcMethod::HelloWorld, Text)
    }

    async fn get_version(&self) -> Result<String> {
        let response = self.call(&RpcRequest::GetVersion).await?;
        expect_response!(response, RpcMethod::GetVersion, Text)
    }

    async fn get_status(&self) -> Result<WorkerStatus> {
        let response = self.call(&RpcRequest::GetStatus).await?;
        expect_response!(response, RpcMethod::GetStatus, Status)
    }

    async fn open_job(&self, job: &Job, script: &ScriptExecution) -> Result<Vec<LuaValue>> {
        let request = RpcRequest::OpenJob {
            job: job.clone(),
            script: script.clone(),
        };
        let response = self.call(&request).await?;
        expect_response!(response, RpcMethod::OpenJob, Values)
    }

    async fn open_job_ex(&self, job: &Job, script: &ScriptExecution) -> Result<Vec<LuaValue>> {
        let request = RpcRequest::OpenJobEx {
            job: job.clone(),
            script: script.clone(),
        };
        let response = self.call(&request).await?;
        expect_response!(response, RpcMethod::OpenJobEx, Values)
    }

    async fn execute(&self, job_id: &str, script: &ScriptExecution) -> Result<Vec<LuaValue>> {
        let request = RpcRequest::Execute {
            job_id: job_id.to_string(),
            script: script.clone(),
        };
        let response = self.call(&request).await?;
        expect_response!(response, RpcMethod::Execute, Values)
    }

    async fn execute_ex(&self, job_id: &str, script: &ScriptExecution) -> Result<Vec<LuaValue>> {
        let request = RpcRequest::ExecuteEx {
            job_id: job_id.to_string(),
            script: script.clone(),
        };
        let response = self.call(&request).await?;
        expect_response!(response, RpcMethod::ExecuteEx, Values)
    }

    async fn close_job(&self, job_id: &str) -> Result<()> {
        let request = RpcRequest::CloseJob {
            job_id: job_id.to_string(),
        };
        self.call(&request).await.map(|_| ())
    }

    async fn batch_job(&self, job: &Job, script: &ScriptExecution) -> Result<Vec<LuaValue>> {
        let request = RpcRequest::BatchJob {
            job: job.clone(),
            script: script.clone(),
        };
        let response = self.call(&request).await?;
        expect_response!(response, RpcMethod::BatchJob, Values)
    }

    async fn batch_job_ex(&self, job: &Job, script: &ScriptExecution) -> Result<Vec<LuaValue>> {
        let request = RpcRequest::BatchJobEx {
            job: job.clone(),
            script: script.clone(),
        };
        let response = self.call(&request).await?;
        expect_response!(response, RpcMethod::BatchJobEx, Values)
    }

    async fn get_expiration(&self, job_id: &str) -> Result<f64> {
        let request = RpcRequest::GetExpiration {
            job_id: job_id.to_string(),
        };
        let response = self.call(&request).await?;
        expect_response!(response, RpcMethod::GetExpiration, Seconds)
    }

    async fn renew_lease(&self, job_id: &str, expiration_in_seconds: f64) -> Result<f64> {
        let request = RpcRequest::RenewLease {
            job_id: job_id.to_string(),
            expiration_in_seconds,
        };
        let response = self.call(&request).await?;
        expect_response!(response, RpcMethod::RenewLease, Seconds)
    }

    async fn get_all_jobs(&self) -> Result<Vec<Job>> {
        let response = self.call(&RpcRequest::GetAllJobs).await?;
        expect_response!(response, RpcMethod::GetAllJobs, Jobs)
    }

    async fn get_all_jobs_ex(&self) -> Result<Vec<Job>> {
        let response = self.call(&RpcRequest::GetAllJobsEx).await?;
        expect_response!(response, RpcMethod::GetAllJobsEx, Jobs)
    }

    async fn close_expired_jobs(&self) -> Result<i32> {
        let response = self.call(&RpcRequest::CloseExpiredJobs).await?;
        expect_response!(response, RpcMethod::CloseExpiredJobs, Count)
    }

    async fn close_all_jobs(&self) -> Result<i32> {
        let response = self.call(&RpcRequest::CloseAllJobs).await?;
        expect_response!(response, RpcMethod::CloseAllJobs, Count)
    }

    async fn diag(&self, kind: i32, job_id: Option<&str>) -> Result<Vec<LuaValue>> {
        let request = RpcRequest::Diag {
            kind,
            job_id: job_id.map(str::to_string),
        };
        let response = self.call(&request).await?;
        expect_response!(response, RpcMethod::Diag, Values)
    }

    async fn diag_ex(&self, kind: i32, job_id: Option<&str>) -> Result<Vec<LuaValue>> {
        let request = RpcRequest::DiagEx {
            kind,
            job_id: job_id.map(str::to_string),
        };
        let response = self.call(&request).await?;
        expect_response!(response, RpcMethod::DiagEx, Values)
    }
}

impl<T: GridRpc + ?Sized> GridRpcExt for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let request = RpcRequest::RenewLease {
            job_id: "job-1".into(),
            expiration_in_seconds: 30.0,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["method"], "renew_lease");
        assert_eq!(json["params"]["job_id"], "job-1");

        let json = serde_json::to_value(&RpcRequest::HelloWorld).unwrap();
        assert_eq!(json, serde_json::json!({ "method": "hello_world" }));
    }

    #[test]
    fn test_request_method_names_match_wire_tags() {
        let script = ScriptExecution::new("s", "return 1");
        let job = Job::new("j", 10.0);
        let requests = vec![
            RpcRequest::HelloWorld,
            RpcRequest::GetStatus,
            RpcRequest::BatchJobEx {
                job: job.clone(),
                script: script.clone(),
            },
            RpcRequest::ExecuteEx {
                job_id: "j".into(),
                script,
            },
            RpcRequest::CloseAllJobs,
            RpcRequest::DiagEx {
                kind: 1,
                job_id: None,
            },
        ];
        for request in requests {
            let json = serde_json::to_value(&request).unwrap();
            assert_eq!(json["method"], request.method().name());
        }
    }

    #[test]
    fn test_response_wire_shape() {
        let response = RpcResponse::Values(vec![LuaValue::Number(2.0), LuaValue::Nil]);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["kind"], "values");
        assert_eq!(json["value"][0], serde_json::json!({ "type": "number", "value": 2.0 }));
        assert_eq!(json["value"][1], serde_json::json!({ "type": "nil" }));

        let back: RpcResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back, response);
    }

    #[test]
    fn test_generated_job_ids_are_typed() {
        let job = Job::generate(20.0);
        assert!(JobId::matches(&job.id));
        assert_eq!(job.expiration_in_seconds, 20.0);
    }

    struct Fixed(RpcResponse);

    #[async_trait]
    impl GridRpc for Fixed {
        async fn call(&self, _request: &RpcRequest) -> Result<RpcResponse> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_ext_maps_empty_to_default() {
        let rpc = Fixed(RpcResponse::Empty);
        assert_eq!(rpc.hello_world().await.unwrap(), "");
        assert!(rpc.get_all_jobs().await.unwrap().is_empty());
        assert_eq!(rpc.close_all_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ext_rejects_mismatched_kind() {
        let rpc = Fixed(RpcResponse::Count(3));
        let err = rpc.hello_world().await.unwrap_err();
        assert!(err.is_fault());
    }
}
