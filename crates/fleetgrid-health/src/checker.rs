//! Health check probe logic.
//!
//! Performs HTTP readiness checks against worker endpoints and tracks
//! consecutive outcomes against the unhealthy (K) and healthy (M)
//! thresholds.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use serde::Deserialize;
use tracing::{debug, info, warn};

use fleetgrid_state::HealthStatus;

/// Result of a single readiness probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeResult {
    /// The worker reported itself ready, with its current load.
    Ready { load: f64 },
    /// The worker answered but is not ready to take traffic.
    NotReady { load: Option<f64> },
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

impl ProbeResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    /// Load reported by the worker, if it answered.
    pub fn load(&self) -> Option<f64> {
        match self {
            Self::Ready { load } => Some(*load),
            Self::NotReady { load } => *load,
            Self::Failed => None,
        }
    }
}

/// Anything that can report readiness for an endpoint.
#[async_trait]
pub trait HealthCheckable: Send + Sync {
    /// Probe `endpoint` (ip:port). Timeouts are enforced by the caller.
    async fn probe(&self, endpoint: &str) -> ProbeResult;
}

/// Tracks consecutive probe results for a single instance.
#[derive(Debug)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Failures in a row before marking unhealthy (K).
    unhealthy_threshold: u32,
    /// Successes in a row needed to leave `Unhealthy` (M).
    healthy_threshold: u32,
}

impl HealthTracker {
    pub fn new(unhealthy_threshold: u32, healthy_threshold: u32) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            healthy_threshold: healthy_threshold.max(1),
        }
    }

    /// Record a probe result and return the new health status.
    pub fn record(&mut self, result: &ProbeResult) -> HealthStatus {
        if result.is_success() {
            self.consecutive_failures = 0;
            self.consecutive_successes += 1;

            let next = match self.status {
                HealthStatus::Unhealthy
                    if self.consecutive_successes < self.healthy_threshold =>
                {
                    HealthStatus::Unhealthy
                }
                _ => HealthStatus::Healthy,
            };
            if self.status == HealthStatus::Unhealthy && next == HealthStatus::Healthy {
                info!(
                    successes = self.consecutive_successes,
                    "instance recovered to healthy"
                );
            }
            self.status = next;
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures += 1;

            if self.consecutive_failures >= self.unhealthy_threshold {
                if self.status != HealthStatus::Unhealthy {
                    warn!(
                        failures = self.consecutive_failures,
                        threshold = self.unhealthy_threshold,
                        "instance marked unhealthy"
                    );
                }
                self.status = HealthStatus::Unhealthy;
            } else if self.status == HealthStatus::Healthy {
                self.status = HealthStatus::Degraded;
            }
        }

        self.status
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }
}

/// Body returned by a worker readiness endpoint.
#[derive(Debug, Deserialize)]
struct ReadinessBody {
    #[serde(default = "default_ready")]
    ready: bool,
    #[serde(default)]
    load: f64,
}

fn default_ready() -> bool {
    true
}

/// HTTP/1 readiness probe: `GET http://{endpoint}{path}`.
///
/// A 2xx with `{"ready": true, "load": 0.4}` is `Ready`; `ready: false` or a
/// non-2xx status is `NotReady`; a 2xx without a parseable body is treated
/// as ready with zero load.
#[derive(Debug, Clone)]
pub struct HttpReadinessProbe {
    path: String,
}

impl HttpReadinessProbe {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl HealthCheckable for HttpReadinessProbe {
    async fn probe(&self, endpoint: &str) -> ProbeResult {
        http_probe(endpoint, &self.path).await
    }
}

async fn http_probe(address: &str, path: &str) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let stream = match tokio::net::TcpStream::connect(address).await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, %uri, "readiness probe connection failed");
            return ProbeResult::Failed;
        }
    };

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => {
            debug!(error = %e, %uri, "readiness probe handshake failed");
            return ProbeResult::Failed;
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
        .header("user-agent", "fleetgrid-health/0.1")
        .body(Empty::<Bytes>::new())
    {
        Ok(req) => req,
        Err(e) => {
            debug!(error = %e, %uri, "invalid readiness probe request");
            return ProbeResult::Failed;
        }
    };

    let resp = match sender.send_request(req).await {
        Ok(resp) => resp,
        Err(e) => {
            debug!(error = %e, %uri, "readiness probe request failed");
            return ProbeResult::Failed;
        }
    };

    let status = resp.status();
    let body = match resp.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, %uri, "readiness probe body read failed");
            return ProbeResult::Failed;
        }
    };
    let parsed = serde_json::from_slice::<ReadinessBody>(&body).ok();

    if !status.is_success() {
        debug!(%status, %uri, "readiness probe non-2xx");
        return ProbeResult::NotReady {
            load: parsed.map(|b| b.load),
        };
    }

    match parsed {
        Some(body) if body.ready => ProbeResult::Ready { load: body.load },
        Some(body) => ProbeResult::NotReady {
            load: Some(body.load),
        },
        None => ProbeResult::Ready { load: 0.0 },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const OK: ProbeResult = ProbeResult::Ready { load: 0.5 };
    const FAIL: ProbeResult = ProbeResult::Failed;

    #[test]
    fn tracker_starts_unknown() {
        let tracker = HealthTracker::new(3, 2);
        assert_eq!(tracker.status(), HealthStatus::Unknown);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn tracker_becomes_healthy_on_first_success() {
        let mut tracker = HealthTracker::new(3, 2);
        assert_eq!(tracker.record(&OK), HealthStatus::Healthy);
    }

    #[test]
    fn tracker_degrades_under_threshold() {
        let mut tracker = HealthTracker::new(3, 2);
        tracker.record(&OK);

        // Two failures: under the threshold of 3.
        tracker.record(&FAIL);
        assert_eq!(tracker.record(&FAIL), HealthStatus::Degraded);
        assert_eq!(tracker.consecutive_failures(), 2);

        // A success clears the degradation immediately.
        assert_eq!(tracker.record(&OK), HealthStatus::Healthy);
    }

    #[test]
    fn tracker_becomes_unhealthy_at_threshold() {
        let mut tracker = HealthTracker::new(3, 2);
        tracker.record(&OK);

        tracker.record(&FAIL);
        tracker.record(&ProbeResult::NotReady { load: Some(1.0) });
        assert_eq!(tracker.record(&FAIL), HealthStatus::Unhealthy);
    }

    #[test]
    fn unknown_instance_stays_unknown_while_failing() {
        let mut tracker = HealthTracker::new(3, 2);
        tracker.record(&FAIL);
        assert_eq!(tracker.record(&FAIL), HealthStatus::Unknown);
        assert_eq!(tracker.record(&FAIL), HealthStatus::Unhealthy);
    }

    #[test]
    fn single_success_does_not_recover_unhealthy() {
        let mut tracker = HealthTracker::new(3, 2);
        for _ in 0..3 {
            tracker.record(&FAIL);
        }
        assert_eq!(tracker.record(&OK), HealthStatus::Unhealthy);
        assert_eq!(tracker.record(&OK), HealthStatus::Healthy);
    }

    #[test]
    fn interrupted_recovery_starts_over() {
        let mut tracker = HealthTracker::new(2, 3);
        tracker.record(&FAIL);
        tracker.record(&FAIL);
        assert_eq!(tracker.status(), HealthStatus::Unhealthy);

        tracker.record(&OK);
        tracker.record(&OK);
        tracker.record(&FAIL);
        tracker.record(&OK);
        tracker.record(&OK);
        assert_eq!(tracker.status(), HealthStatus::Unhealthy);
        assert_eq!(tracker.record(&OK), HealthStatus::Healthy);
    }

    /// Every path back to Healthy after K failures passes through M
    /// consecutive successes.
    #[test]
    fn no_flap_for_any_outcome_sequence() {
        let (k, m) = (3u32, 2u32);
        // Enumerate every outcome sequence of length 12.
        for bits in 0u32..(1 << 12) {
            let mut tracker = HealthTracker::new(k, m);
            let mut run_of_successes = 0u32;
            let mut was_unhealthy = false;
            for i in 0..12 {
                let ok = bits & (1 << i) != 0;
                let result = if ok { OK } else { FAIL };
                let before = tracker.status();
                let after = tracker.record(&result);
                run_of_successes = if ok { run_of_successes + 1 } else { 0 };
                if before == HealthStatus::Unhealthy {
                    was_unhealthy = true;
                }
                if was_unhealthy && before == HealthStatus::Unhealthy && after == HealthStatus::Healthy {
                    assert!(run_of_successes >= m, "recovered after {run_of_successes} successes");
                }
            }
        }
    }

    #[test]
    fn probe_result_accessors() {
        assert!(OK.is_success());
        assert_eq!(OK.load(), Some(0.5));
        assert!(!FAIL.is_success());
        assert_eq!(FAIL.load(), None);
    }

    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let resp = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(resp.as_bytes()).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn http_probe_parses_ready_body() {
        let addr = serve_once("200 OK", r#"{"ready":true,"load":0.42}"#).await;
        let result = HttpReadinessProbe::new("/ready").probe(&addr).await;
        assert_eq!(result, ProbeResult::Ready { load: 0.42 });
    }

    #[tokio::test]
    async fn http_probe_not_ready_body() {
        let addr = serve_once("200 OK", r#"{"ready":false,"load":0.9}"#).await;
        let result = HttpReadinessProbe::new("/ready").probe(&addr).await;
        assert_eq!(result, ProbeResult::NotReady { load: Some(0.9) });
    }

    #[tokio::test]
    async fn http_probe_non_2xx_is_not_ready() {
        let addr = serve_once("503 Service Unavailable", "").await;
        let result = HttpReadinessProbe::new("/ready").probe(&addr).await;
        assert_eq!(result, ProbeResult::NotReady { load: None });
    }

    #[tokio::test]
    async fn http_probe_to_closed_port_returns_failed() {
        let result = HttpReadinessProbe::new("/ready").probe("127.0.0.1:1").await;
        assert_eq!(result, ProbeResult::Failed);
    }
}
