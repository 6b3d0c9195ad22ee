//! Container backend.
//!
//! Each worker runs in its own Docker container with the worker port published
//! one-to-one on the host. The Docker Engine API is spoken over its unix
//! socket. Containers are labelled so a restarted arbiter can find the ones it
//! owns and leave everything else alone.
//!
//! Reference: https://docs.docker.com/engine/api/v1.43/

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::{BackendKind, LaunchRequest, LaunchedWorker, RunningWorker, Termination, WorkerLauncher};
use crate::error::{ArbiterError, LaunchFailure, Result};
use crate::resources::ResourceLimits;

const MANAGED_LABEL: &str = "grid-arbiter.managed";
const PORT_LABEL: &str = "grid-arbiter.port";

/// Errors from the Docker Engine API.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Docker API error {status}: {message}")]
    Api { status: u16, message: String },
}

impl DockerError {
    fn status(&self) -> Option<u16> {
        match self {
            DockerError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<DockerError> for ArbiterError {
    fn from(err: DockerError) -> Self {
        ArbiterError::Backend(err.to_string())
    }
}

// =============================================================================
// API client
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub exit_code: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub id: String,
    pub state: ContainerState,
    #[serde(default)]
    pub config: ContainerConfig,
}

impl ContainerInspect {
    fn label(&self, key: &str) -> Option<&str> {
        self.config.labels.as_ref()?.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: String,
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
    #[serde(default)]
    pub state: String,
}

/// Docker Engine API client for unix socket communication.
pub struct DockerClient {
    socket_path: PathBuf,
    client: Client<UnixConnector>,
}

impl DockerClient {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            client: Client::unix(),
        }
    }

    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> std::result::Result<(StatusCode, Bytes), DockerError> {
        let uri = Uri::new(&self.socket_path, path);
        debug!(%method, path, "Docker API request");

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");
        let body = match body {
            Some(bytes) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(bytes)
            }
            None => Body::empty(),
        };

        let response = self.client.request(builder.body(body)?).await?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await?;
        Ok((status, bytes))
    }

    async fn expect_success(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> std::result::Result<Bytes, DockerError> {
        let (status, bytes) = self.send(method, path, body).await?;
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(bytes);
        }
        let message = api_message(&bytes);
        error!(status = %status, message = %message, path, "Docker API error");
        Err(DockerError::Api {
            status: status.as_u16(),
            message,
        })
    }

    /// Create a container and return its id.
    pub async fn create_container(
        &self,
        name: &str,
        spec: &serde_json::Value,
    ) -> std::result::Result<String, DockerError> {
        #[derive(Deserialize)]
        struct Created {
            #[serde(rename = "Id")]
            id: String,
        }

        let path = format!("/containers/create?name={}", encode_query(name));
        let bytes = self
            .expect_success(Method::POST, &path, Some(serde_json::to_vec(spec)?))
            .await?;
        let created: Created = serde_json::from_slice(&bytes)?;
        Ok(created.id)
    }

    pub async fn start_container(&self, id: &str) -> std::result::Result<(), DockerError> {
        self.expect_success(Method::POST, &format!("/containers/{id}/start"), None)
            .await
            .map(|_| ())
    }

    /// `None` if the container does not exist.
    pub async fn inspect_container(
        &self,
        id: &str,
    ) -> std::result::Result<Option<ContainerInspect>, DockerError> {
        match self
            .expect_success(Method::GET, &format!("/containers/{id}/json"), None)
            .await
        {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.status() == Some(404) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns false if the container was missing or already stopped.
    pub async fn kill_container(&self, id: &str) -> std::result::Result<bool, DockerError> {
        match self
            .expect_success(Method::POST, &format!("/containers/{id}/kill"), None)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.status(), Some(404 | 409)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn remove_container(&self, id: &str) -> std::result::Result<(), DockerError> {
        match self
            .expect_success(Method::DELETE, &format!("/containers/{id}?force=true"), None)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.status() == Some(404) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Containers carrying `label` (in `key=value` form).
    pub async fn list_containers(
        &self,
        label: &str,
    ) -> std::result::Result<Vec<ContainerSummary>, DockerError> {
        let filters = json!({ "label": [label] }).to_string();
        let path = format!("/containers/json?filters={}", encode_query(&filters));
        let bytes = self.expect_success(Method::GET, &path, None).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn image_id(&self, image: &str) -> std::result::Result<String, DockerError> {
        #[derive(Deserialize)]
        struct Image {
            #[serde(rename = "Id")]
            id: String,
        }

        let bytes = self
            .expect_success(Method::GET, &format!("/images/{image}/json"), None)
            .await?;
        let image: Image = serde_json::from_slice(&bytes)?;
        Ok(image.id)
    }

    pub async fn update_container<T: Serialize>(
        &self,
        id: &str,
        update: &T,
    ) -> std::result::Result<(), DockerError> {
        self.expect_success(
            Method::POST,
            &format!("/containers/{id}/update"),
            Some(serde_json::to_vec(update)?),
        )
        .await
        .map(|_| ())
    }
}

fn api_message(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct ApiMessage {
        message: String,
    }

    serde_json::from_slice::<ApiMessage>(body)
        .map(|m| m.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned())
}

/// Percent-encode a query parameter value.
fn encode_query(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{other:02X}")),
        }
    }
    encoded
}

/// `sha256:0123...` to its first 16 hex digits.
fn short_image_id(id: &str) -> String {
    let hex = id.strip_prefix("sha256:").unwrap_or(id);
    hex.chars().take(16).collect()
}

// =============================================================================
// Launcher
// =============================================================================

/// Container launcher settings.
#[derive(Debug, Clone)]
pub struct ContainerLauncherConfig {
    pub socket_path: PathBuf,
    pub image: String,
    /// Container names are `<prefix>-<port>`.
    pub name_prefix: String,
    pub launch_attempts: u32,
}

impl Default for ContainerLauncherConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/docker.sock"),
            image: "grid-worker:latest".to_string(),
            name_prefix: "grid-worker".to_string(),
            launch_attempts: 3,
        }
    }
}

pub struct ContainerLauncher {
    config: ContainerLauncherConfig,
    docker: DockerClient,
}

impl ContainerLauncher {
    pub fn new(config: ContainerLauncherConfig) -> Self {
        let docker = DockerClient::new(&config.socket_path);
        Self { config, docker }
    }

    fn container_spec(&self, port: u16) -> serde_json::Value {
        let port_key = format!("{port}/tcp");
        json!({
            "Image": self.config.image,
            "Cmd": ["-onlygrid", port.to_string()],
            "ExposedPorts": { port_key.clone(): {} },
            "Labels": {
                MANAGED_LABEL: "true",
                PORT_LABEL: port.to_string(),
            },
            "HostConfig": {
                "PortBindings": { port_key: [{ "HostPort": port.to_string() }] },
            },
        })
    }

    async fn create(&self, port: u16) -> Result<String> {
        let name = format!("{}-{port}", self.config.name_prefix);
        let spec = self.container_spec(port);
        let attempts = self.config.launch_attempts.max(1);

        for attempt in 1..=attempts {
            match self.docker.create_container(&name, &spec).await {
                Ok(id) => return Ok(id),
                Err(e) if e.status() == Some(404) => {
                    warn!(image = %self.config.image, "Worker image not found");
                    return Err(LaunchFailure::WorkerNotRegistered.into());
                }
                Err(e) if e.status() == Some(409) => {
                    warn!(container = %name, attempt, "Removing stale worker container");
                    if let Err(e) = self.docker.remove_container(&name).await {
                        debug!(container = %name, error = %e, "Stale container removal failed");
                    }
                }
                Err(e) => {
                    warn!(container = %name, attempt, attempts, error = %e, "Container create failed");
                }
            }
        }

        Err(LaunchFailure::LaunchAttemptsExceeded.into())
    }

    async fn discard(&self, id: &str) {
        if let Err(e) = self.docker.remove_container(id).await {
            warn!(container = %id, error = %e, "Failed to remove container");
        }
    }
}

#[async_trait]
impl WorkerLauncher for ContainerLauncher {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchedWorker> {
        if request.only_web {
            return Err(LaunchFailure::WebServerMissing.into());
        }
        let port = request
            .port
            .filter(|port| *port > 0)
            .ok_or(LaunchFailure::BadPort)?;

        let started = Instant::now();
        let id = self.create(port).await?;

        if let Err(e) = self.docker.start_container(&id).await {
            self.discard(&id).await;
            if e.to_string().contains("port is already allocated") {
                return Err(LaunchFailure::BadPort.into());
            }
            return Err(e.into());
        }

        let state = match self.docker.inspect_container(&id).await? {
            Some(inspect) if inspect.state.running => inspect.state,
            Some(inspect) => {
                self.discard(&id).await;
                return Err(LaunchFailure::Unknown(inspect.state.exit_code).into());
            }
            None => return Err(LaunchFailure::Unknown(0).into()),
        };

        let version = self.version().await.unwrap_or_default();
        let elapsed = started.elapsed();
        info!(
            container = %id,
            pid = state.pid,
            port,
            elapsed_ms = elapsed.as_millis() as u64,
            "Launched worker container"
        );

        Ok(LaunchedWorker {
            pid: state.pid,
            instance_id: id,
            port,
            elapsed,
            version,
        })
    }

    async fn terminate(&self, worker: &LaunchedWorker) -> Result<Termination> {
        let id = &worker.instance_id;
        let Some(inspect) = self.docker.inspect_container(id).await? else {
            info!(container = %id, "Worker container not running, ignoring");
            return Ok(Termination::NotRunning);
        };

        if inspect.label(MANAGED_LABEL) != Some("true") {
            warn!(container = %id, "Container is not managed by the arbiter, not killing");
            return Ok(Termination::NotPermitted);
        }

        let killed = inspect.state.running && self.docker.kill_container(id).await?;
        self.docker.remove_container(id).await?;

        if killed {
            info!(container = %id, port = worker.port, "Killed worker container");
            Ok(Termination::Killed)
        } else {
            info!(container = %id, "Worker container not running, ignoring");
            Ok(Termination::NotRunning)
        }
    }

    async fn is_running(&self, worker: &LaunchedWorker) -> bool {
        match self.docker.inspect_container(&worker.instance_id).await {
            Ok(Some(inspect)) => inspect.state.running,
            Ok(None) => false,
            Err(e) => {
                warn!(container = %worker.instance_id, error = %e, "Container inspect failed");
                false
            }
        }
    }

    async fn version(&self) -> Result<String> {
        let id = self.docker.image_id(&self.config.image).await?;
        Ok(short_image_id(&id))
    }

    async fn list_running(&self) -> Result<Vec<RunningWorker>> {
        let containers = self
            .docker
            .list_containers(&format!("{MANAGED_LABEL}=true"))
            .await?;

        let mut workers = Vec::new();
        for container in containers.into_iter().filter(|c| c.state == "running") {
            let port = container
                .labels
                .as_ref()
                .and_then(|labels| labels.get(PORT_LABEL))
                .and_then(|port| port.parse::<u16>().ok());
            let Some(port) = port else {
                warn!(container = %container.id, "Managed container has no port label");
                continue;
            };
            let pid = match self.docker.inspect_container(&container.id).await? {
                Some(inspect) => inspect.state.pid,
                None => continue,
            };
            workers.push(RunningWorker {
                pid,
                instance_id: container.id,
                port,
            });
        }
        Ok(workers)
    }

    async fn update_limits(&self, worker: &LaunchedWorker, limits: &ResourceLimits) -> Result<()> {
        #[derive(Serialize)]
        #[serde(rename_all = "PascalCase")]
        struct Update {
            #[serde(skip_serializing_if = "Option::is_none")]
            nano_cpus: Option<i64>,
            #[serde(skip_serializing_if = "Option::is_none")]
            memory: Option<i64>,
            #[serde(skip_serializing_if = "Option::is_none")]
            pids_limit: Option<i64>,
        }

        let update = Update {
            nano_cpus: (limits.cores > 0.0).then(|| (limits.cores * 1e9) as i64),
            memory: (limits.memory_mb > 0).then(|| limits.memory_mb * 1024 * 1024),
            pids_limit: (limits.threads > 0).then_some(limits.threads),
        };
        self.docker
            .update_container(&worker.instance_id, &update)
            .await?;
        debug!(
            container = %worker.instance_id,
            cores = limits.cores,
            threads = limits.threads,
            memory_mb = limits.memory_mb,
            "Updated container limits"
        );
        Ok(())
    }
}
