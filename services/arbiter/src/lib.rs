//! Grid Arbiter Library
//!
//! The arbiter sits between callers and a fleet of script worker processes on
//! one host. It decides which worker serves a call, starts and stops workers,
//! and keeps each worker bound to at most one job at a time.
//!
//! ## Architecture
//!
//! ```text
//! JobManager            (admission control, ready stack, job leases)
//! └── InstancePool      (handle registry, dispatch, lease reaper)
//!     ├── PortAllocator (free-port scan under a host-wide lock)
//!     └── WorkerHandle  (one worker, retrying call path)
//!         ├── WorkerLauncher (process or container backend)
//!         └── GridRpc        (HTTP transport to the worker)
//! ```
//!
//! ## Modules
//!
//! - `port`: port allocation
//! - `rpc`: the worker's remote operations and their transports
//! - `retry`: the retry loop every remote operation runs under
//! - `worker`: worker handles
//! - `pool`: the handle registry and call dispatch
//! - `jobs`: job-to-worker binding
//! - `launcher`: process and container launch backends
//! - `resources`: host capacity and admission checks
//! - `cache`: expiring map and lazily computed values

pub mod cache;
pub mod config;
pub mod error;
pub mod jobs;
pub mod launcher;
pub mod pool;
pub mod port;
pub mod resources;
pub mod retry;
pub mod rpc;
pub mod worker;

pub use config::ArbiterConfig;
pub use error::{ArbiterError, JobRejectionReason, LaunchFailure, Result};
pub use jobs::{JobAdmission, JobManager, JobManagerConfig};
pub use pool::{InstancePool, PoolClient, PoolConfig, WorkerTarget};
pub use port::{PortAllocator, PortAllocatorConfig};
pub use rpc::{GridRpc, GridRpcExt, RpcRequest, RpcResponse};
pub use worker::{OpenMode, WorkerHandle};
