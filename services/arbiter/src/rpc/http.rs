//! JSON-over-HTTP transport for worker calls.
//!
//! Every operation is `POST {base}/rpc/{method}` with the request as body.
//! Transport failures are classified for the retry loop:
//! - connect failures and 404 are an unreachable endpoint
//! - client-side timeouts are a call timeout
//! - a 4xx/5xx body of the form `{"fault": "..."}` is a protocol fault
//! - anything else is transient

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{GridRpc, RpcConnector, RpcRequest, RpcResponse};
use crate::error::{ArbiterError, Result};

#[derive(Deserialize)]
struct FaultBody {
    fault: String,
}

/// Transport for one worker endpoint.
pub struct HttpRpcClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpRpcClient {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ArbiterError::Backend(format!("failed to build HTTP client: {e}")))?;

        Ok(Self::with_client(
            client,
            format!("http://{host}:{port}"),
            timeout,
        ))
    }

    /// Build from an existing client; `base_url` has no trailing slash.
    pub fn with_client(client: reqwest::Client, base_url: String, timeout: Duration) -> Self {
        Self {
            client,
            base_url,
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn classify_send_error(&self, method: &'static str, err: reqwest::Error) -> ArbiterError {
        if err.is_timeout() {
            ArbiterError::Timeout {
                method,
                elapsed: self.timeout,
            }
        } else if err.is_connect() {
            ArbiterError::EndpointUnreachable(format!("{}: {err}", self.base_url))
        } else {
            ArbiterError::Transient(err.to_string())
        }
    }
}

#[async_trait]
impl GridRpc for HttpRpcClient {
    async fn call(&self, request: &RpcRequest) -> Result<RpcResponse> {
        let method = request.method().name();
        let url = format!("{}/rpc/{}", self.base_url, method);
        debug!(url = %url, method, "Calling worker");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| self.classify_send_error(method, e))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<RpcResponse>()
                .await
                .map_err(|e| ArbiterError::Transient(format!("malformed {method} response: {e}")));
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ArbiterError::EndpointUnreachable(format!(
                "{url} returned 404"
            )));
        }

        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<FaultBody>(&body) {
            Ok(fault) => Err(ArbiterError::Fault {
                method,
                message: fault.fault,
            }),
            Err(_) => Err(ArbiterError::Transient(format!(
                "{method} returned {status}: {body}"
            ))),
        }
    }
}

/// Connector producing [`HttpRpcClient`]s that share one connection pool.
pub struct HttpConnector {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ArbiterError::Backend(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, timeout })
    }
}

impl RpcConnector for HttpConnector {
    fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn GridRpc>> {
        Ok(Arc::new(HttpRpcClient::with_client(
            self.client.clone(),
            format!("http://{host}:{port}"),
            self.timeout,
        )))
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::rpc::{GridRpcExt, Job, LuaValue, ScriptExecution};

    fn client_for(server: &MockServer, timeout: Duration) -> HttpRpcClient {
        HttpRpcClient::with_client(reqwest::Client::builder().timeout(timeout).build().unwrap(), server.uri(), timeout)
    }

    #[tokio::test]
    async fn test_success_decodes_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/hello_world"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "kind": "text", "value": "Hello World" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Duration::from_secs(5));
        assert_eq!(client.hello_world().await.unwrap(), "Hello World");
    }

    #[tokio::test]
    async fn test_request_body_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/batch_job_ex"))
            .and(body_partial_json(serde_json::json!({
                "method": "batch_job_ex",
                "params": { "job": { "id": "job-7" } }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "kind": "values",
                "value": [{ "type": "boolean", "value": true }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Duration::from_secs(5));
        let values = client
            .batch_job_ex(&Job::new("job-7", 10.0), &ScriptExecution::new("s", "return true"))
            .await
            .unwrap();
        assert_eq!(values, vec![LuaValue::Boolean(true)]);
    }

    #[tokio::test]
    async fn test_fault_body_is_protocol_fault() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/execute"))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_json(serde_json::json!({ "fault": "BatchJob Timeout" })),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, Duration::from_secs(5));
        let err = client
            .execute("job-1", &ScriptExecution::new("s", "while true do end"))
            .await
            .unwrap_err();
        match err {
            ArbiterError::Fault { method, message } => {
                assert_eq!(method, "execute");
                assert_eq!(message, "BatchJob Timeout");
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unstructured_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = client_for(&server, Duration::from_secs(5));
        let err = client.get_status().await.unwrap_err();
        assert!(matches!(err, ArbiterError::Transient(_)));
    }

    #[tokio::test]
    async fn test_not_found_is_unreachable() {
        let server = MockServer::start().await;

        let client = client_for(&server, Duration::from_secs(5));
        let err = client.get_version().await.unwrap_err();
        assert!(matches!(err, ArbiterError::EndpointUnreachable(_)));
    }

    #[tokio::test]
    async fn test_slow_worker_is_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "kind": "empty" }))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, Duration::from_millis(50));
        let err = client.close_all_jobs().await.unwrap_err();
        assert!(matches!(err, ArbiterError::Timeout { method: "close_all_jobs", .. }));
    }

    #[tokio::test]
    async fn test_closed_port_is_unreachable() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let client = HttpRpcClient::new("127.0.0.1", port, Duration::from_secs(2)).unwrap();
        let err = client.hello_world().await.unwrap_err();
        assert!(matches!(err, ArbiterError::EndpointUnreachable(_)));
    }

    #[test]
    fn test_connector_builds_base_url() {
        let connector = HttpConnector::new(Duration::from_secs(1)).unwrap();
        let _rpc = connector.connect("10.0.0.5", 48000).unwrap();
        let client = HttpRpcClient::new("10.0.0.5", 48000, Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://10.0.0.5:48000");
    }
}
