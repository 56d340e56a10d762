//! Health check probe logic.
//!
//! A `HealthTracker` turns a stream of probe results into a health status
//! with hysteresis: a status only flips after a configured number of
//! consecutive like results. Probes are pluggable through the `Probe`
//! trait; HTTP and TCP probes are provided.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, warn};

use shiftgrid_core::HealthSettings;
use shiftgrid_state::{HealthState, HealthStatus};

/// Boxed future returned by probe implementations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The entity answered and reported itself healthy.
    Success,
    /// The entity answered with a failure (non-2xx, refused check, ...).
    Failure,
    /// The entity could not be reached or did not answer in time.
    Unreachable,
}

impl ProbeResult {
    pub fn is_success(self) -> bool {
        self == ProbeResult::Success
    }
}

/// The external health-check contract for an instance or datastore node.
pub trait Probe: Send + Sync {
    /// Run one check. Implementations should not retry internally.
    fn check(&self) -> BoxFuture<'_, ProbeResult>;

    /// Human-readable target, for logs.
    fn target(&self) -> String;
}

/// Probe cadence and hysteresis thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub success_threshold: u32,
    pub failure_threshold: u32,
}

impl From<&HealthSettings> for ProbeSettings {
    fn from(s: &HealthSettings) -> Self {
        Self {
            interval: s.interval,
            timeout: s.timeout,
            success_threshold: s.success_threshold,
            failure_threshold: s.failure_threshold,
        }
    }
}

/// Tracks consecutive probe results for a single entity.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    state: HealthState,
    /// Successes needed to become healthy.
    success_threshold: u32,
    /// Failures needed to become unhealthy.
    failure_threshold: u32,
}

impl HealthTracker {
    /// Create a tracker in the `Unknown` state.
    ///
    /// Thresholds below 1 are treated as 1.
    pub fn new(success_threshold: u32, failure_threshold: u32) -> Self {
        Self {
            state: HealthState::unknown(),
            success_threshold: success_threshold.max(1),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Create a tracker from probe settings.
    pub fn from_settings(settings: &ProbeSettings) -> Self {
        Self::new(settings.success_threshold, settings.failure_threshold)
    }

    /// Record a probe result observed at `now_ms` and return the resulting status.
    pub fn record(&mut self, result: ProbeResult, now_ms: u64) -> HealthStatus {
        let previous = self.state.status;
        self.state.last_probe_at = Some(now_ms);

        if result.is_success() {
            self.state.consecutive_failures = 0;
            self.state.consecutive_successes = self.state.consecutive_successes.saturating_add(1);
            if self.state.consecutive_successes >= self.success_threshold {
                self.state.status = HealthStatus::Healthy;
            }
        } else {
            self.state.consecutive_successes = 0;
            self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
            if self.state.consecutive_failures >= self.failure_threshold {
                self.state.status = HealthStatus::Unhealthy;
            }
        }

        if self.state.status != previous {
            self.state.changed_at = Some(now_ms);
            match self.state.status {
                HealthStatus::Healthy => debug!(
                    successes = self.state.consecutive_successes,
                    ?previous,
                    "entity became healthy"
                ),
                HealthStatus::Unhealthy => warn!(
                    failures = self.state.consecutive_failures,
                    threshold = self.failure_threshold,
                    ?previous,
                    "entity marked unhealthy"
                ),
                HealthStatus::Unknown => {}
            }
        }

        self.state.status
    }

    /// Current health status.
    pub fn status(&self) -> HealthStatus {
        self.state.status
    }

    /// Full health record.
    pub fn state(&self) -> &HealthState {
        &self.state
    }
}

// ── Probes ────────────────────────────────────────────────────────

/// HTTP GET against an instance's health path; 2xx is healthy.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    address: String,
    path: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(address: &str, path: &str, timeout: Duration) -> Self {
        Self {
            address: address.to_string(),
            path: path.to_string(),
            timeout,
        }
    }
}

impl Probe for HttpProbe {
    fn check(&self) -> BoxFuture<'_, ProbeResult> {
        Box::pin(http_probe(&self.address, &self.path, self.timeout))
    }

    fn target(&self) -> String {
        format!("http://{}{}", self.address, self.path)
    }
}

/// TCP connect check, used for datastore nodes.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    address: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(address: &str, timeout: Duration) -> Self {
        Self {
            address: address.to_string(),
            timeout,
        }
    }
}

impl Probe for TcpProbe {
    fn check(&self) -> BoxFuture<'_, ProbeResult> {
        Box::pin(tcp_probe(&self.address, self.timeout))
    }

    fn target(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

/// Perform an HTTP health probe against an endpoint.
///
/// Returns `Success` if the response is 2xx, `Failure` for non-2xx,
/// or `Unreachable` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Unreachable;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Unreachable;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "shiftgrid-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, %uri, "invalid health probe request");
                return ProbeResult::Failure;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Success,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "health probe non-2xx");
                ProbeResult::Failure
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Unreachable
            }
        }
    })
    .await;

    result.unwrap_or_else(|_| {
        debug!(%uri, "health probe timed out");
        ProbeResult::Unreachable
    })
}

/// Check that a TCP listener accepts connections.
pub async fn tcp_probe(address: &str, timeout: Duration) -> ProbeResult {
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(address)).await {
        Ok(Ok(_)) => ProbeResult::Success,
        Ok(Err(e)) => {
            debug!(error = %e, %address, "tcp probe failed");
            ProbeResult::Unreachable
        }
        Err(_) => {
            debug!(%address, "tcp probe timed out");
            ProbeResult::Unreachable
        }
    }
}
