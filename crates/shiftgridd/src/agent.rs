//! HTTP client for a tier's compute agent.
//!
//! The agent owns the hosts a tier runs on. Shiftgrid only asks it to
//! prepare artifacts and to start, drain and delete instances:
//!
//! | Method | Path | Body | Response |
//! |---|---|---|---|
//! | POST | `/v1/artifacts/prepare` | `{tier, artifact}` | any 2xx |
//! | POST | `/v1/instances` | `{id, tier, artifact}` | `{address}` |
//! | POST | `/v1/instances/{id}/drain` | | 2xx once in-flight work is done |
//! | DELETE | `/v1/instances/{id}` | | any 2xx |
//!
//! Connection errors, timeouts and 5xx answers are transient; 4xx answers
//! are fatal.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use serde::{Deserialize, Serialize};
use tracing::debug;

use shiftgrid_health::{BoxFuture, HttpProbe, Probe};
use shiftgrid_rollout::{ProvisionError, Provisioner};
use shiftgrid_state::{InstanceSlot, Revision};

#[derive(Serialize)]
struct PrepareRequest<'a> {
    tier: &'a str,
    artifact: &'a str,
}

#[derive(Serialize)]
struct StartRequest<'a> {
    id: &'a str,
    tier: &'a str,
    artifact: &'a str,
}

#[derive(Deserialize)]
struct StartResponse {
    address: String,
}

/// Drives one tier's agent.
#[derive(Debug, Clone)]
pub struct AgentProvisioner {
    agent: String,
    health_path: String,
    probe_timeout: Duration,
    request_timeout: Duration,
}

impl AgentProvisioner {
    /// `agent` is the agent's `host:port`. Started instances are probed
    /// with `GET http://{address}{health_path}`.
    pub fn new(
        agent: &str,
        health_path: &str,
        probe_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            agent: agent.to_string(),
            health_path: health_path.to_string(),
            probe_timeout,
            request_timeout,
        }
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        timeout: Option<Duration>,
    ) -> Result<Bytes, ProvisionError> {
        let exchange = send(&self.agent, method.clone(), path, body);
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .unwrap_or_else(|_| {
                    Err(ProvisionError::Transient(format!(
                        "agent {} timed out after {limit:?}",
                        self.agent
                    )))
                }),
            None => exchange.await,
        };
        debug!(agent = %self.agent, %method, %path, ok = result.is_ok(), "agent call");
        result
    }
}

async fn send(
    agent: &str,
    method: Method,
    path: &str,
    body: Option<Vec<u8>>,
) -> Result<Bytes, ProvisionError> {
    let uri = format!("http://{agent}{path}");

    let stream = tokio::net::TcpStream::connect(agent)
        .await
        .map_err(|e| unreachable(agent, e))?;
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| unreachable(agent, e))?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut builder = http::Request::builder()
        .method(method)
        .uri(&uri)
        .header("host", agent)
        .header("user-agent", "shiftgridd/0.1");
    if body.is_some() {
        builder = builder.header("content-type", "application/json");
    }
    let req = builder
        .body(Full::new(Bytes::from(body.unwrap_or_default())))
        .map_err(|e| ProvisionError::Fatal(format!("invalid agent request {uri}: {e}")))?;

    let resp = sender.send_request(req).await.map_err(|e| unreachable(agent, e))?;
    let status = resp.status();
    let payload = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| unreachable(agent, e))?
        .to_bytes();

    if status.is_success() {
        return Ok(payload);
    }
    let detail = String::from_utf8_lossy(&payload);
    let msg = format!("agent {agent} answered {status} for {uri}: {detail}");
    Err(classify(status, msg))
}

fn unreachable(agent: &str, e: impl std::fmt::Display) -> ProvisionError {
    ProvisionError::Transient(format!("agent {agent} unreachable: {e}"))
}

fn classify(status: StatusCode, msg: String) -> ProvisionError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ProvisionError::Transient(msg)
    } else {
        ProvisionError::Fatal(msg)
    }
}

fn encode<T: Serialize>(body: &T) -> Result<Vec<u8>, ProvisionError> {
    serde_json::to_vec(body).map_err(|e| ProvisionError::Fatal(format!("encode request: {e}")))
}

impl Provisioner for AgentProvisioner {
    fn prepare<'a>(&'a self, revision: &'a Revision) -> BoxFuture<'a, Result<(), ProvisionError>> {
        Box::pin(async move {
            let body = encode(&PrepareRequest {
                tier: &revision.tier,
                artifact: &revision.artifact,
            })?;
            self.call(
                Method::POST,
                "/v1/artifacts/prepare",
                Some(body),
                Some(self.request_timeout),
            )
            .await?;
            Ok(())
        })
    }

    fn start<'a>(
        &'a self,
        slot: &'a InstanceSlot,
    ) -> BoxFuture<'a, Result<Arc<dyn Probe>, ProvisionError>> {
        Box::pin(async move {
            let body = encode(&StartRequest {
                id: &slot.id,
                tier: &slot.tier,
                artifact: &slot.revision.artifact,
            })?;
            let payload = self
                .call(Method::POST, "/v1/instances", Some(body), Some(self.request_timeout))
                .await?;
            let started: StartResponse = serde_json::from_slice(&payload).map_err(|e| {
                ProvisionError::Fatal(format!("agent {} sent a bad start response: {e}", self.agent))
            })?;
            let probe: Arc<dyn Probe> = Arc::new(HttpProbe::new(
                &started.address,
                &self.health_path,
                self.probe_timeout,
            ));
            Ok(probe)
        })
    }

    fn drain<'a>(&'a self, slot: &'a InstanceSlot) -> BoxFuture<'a, Result<(), ProvisionError>> {
        Box::pin(async move {
            // Bounded by the controller's drain timeout.
            let path = format!("/v1/instances/{}/drain", slot.id);
            self.call(Method::POST, &path, None, None).await?;
            Ok(())
        })
    }

    fn terminate<'a>(
        &'a self,
        slot: &'a InstanceSlot,
    ) -> BoxFuture<'a, Result<(), ProvisionError>> {
        Box::pin(async move {
            let path = format!("/v1/instances/{}", slot.id);
            self.call(Method::DELETE, &path, None, Some(self.request_timeout))
                .await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::Router;
    use axum::extract::Path;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{delete, post};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr.to_string()
    }

    fn provisioner(agent: &str) -> AgentProvisioner {
        AgentProvisioner::new(agent, "/healthz", Duration::from_secs(1), Duration::from_secs(5))
    }

    fn slot() -> InstanceSlot {
        InstanceSlot::new(
            "web-7",
            Revision::new("web", "web:v2"),
            shiftgrid_state::Lifecycle::Starting,
        )
    }

    #[test]
    fn status_classification() {
        assert!(classify(StatusCode::BAD_GATEWAY, String::new()).is_transient());
        assert!(classify(StatusCode::TOO_MANY_REQUESTS, String::new()).is_transient());
        assert!(!classify(StatusCode::NOT_FOUND, String::new()).is_transient());
        assert!(!classify(StatusCode::UNPROCESSABLE_ENTITY, String::new()).is_transient());
    }

    #[tokio::test]
    async fn start_returns_probe_for_reported_address() {
        let router = Router::new().route(
            "/v1/instances",
            post(|| async { axum::Json(serde_json::json!({"address": "10.0.0.7:8080"})) }),
        );
        let agent = serve(router).await;

        let probe = provisioner(&agent).start(&slot()).await.unwrap();
        assert_eq!(probe.target(), "http://10.0.0.7:8080/healthz");
    }

    #[tokio::test]
    async fn client_errors_are_fatal_server_errors_transient() {
        let router = Router::new()
            .route(
                "/v1/artifacts/prepare",
                post(|| async { (AxumStatus::SERVICE_UNAVAILABLE, "pulling") }),
            )
            .route(
                "/v1/instances/{id}",
                delete(|Path(_id): Path<String>| async { AxumStatus::NOT_FOUND }),
            );
        let agent = serve(router).await;
        let p = provisioner(&agent);

        let err = p.prepare(&Revision::new("web", "web:v2")).await.unwrap_err();
        assert!(err.is_transient());

        let err = p.terminate(&slot()).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn unreachable_agent_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = provisioner(&addr).drain(&slot()).await.unwrap_err();
        assert!(err.is_transient());
    }
}
