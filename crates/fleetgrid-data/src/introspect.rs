//! Replica lag introspection.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use serde::Deserialize;
use tracing::debug;

use crate::error::{DataError, DataResult};

/// Reports replication lag and primary liveness.
#[async_trait]
pub trait LagIntrospector: Send + Sync {
    /// Current replication lag of `replica`.
    async fn replica_lag(&self, replica: &str) -> DataResult<Duration>;

    /// Check that the primary accepts connections.
    async fn ping_primary(&self, primary: &str) -> DataResult<()>;
}

#[derive(Debug, Deserialize)]
struct LagBody {
    lag_ms: u64,
}

/// Talks to a small HTTP sidecar next to each database node:
/// `GET /lag` returns `{"lag_ms": n}` and `GET /ping` returns 2xx.
#[derive(Debug, Clone)]
pub struct HttpLagIntrospector {
    timeout: Duration,
}

impl HttpLagIntrospector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl LagIntrospector for HttpLagIntrospector {
    async fn replica_lag(&self, replica: &str) -> DataResult<Duration> {
        let (status, body) = http_get(replica, "/lag", self.timeout)
            .await
            .map_err(|_| DataError::ReplicaUnreachable(replica.to_string()))?;
        if !status.is_success() {
            return Err(DataError::Introspection {
                endpoint: replica.to_string(),
                reason: format!("status {status}"),
            });
        }
        let parsed: LagBody =
            serde_json::from_slice(&body).map_err(|e| DataError::Introspection {
                endpoint: replica.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Duration::from_millis(parsed.lag_ms))
    }

    async fn ping_primary(&self, primary: &str) -> DataResult<()> {
        match http_get(primary, "/ping", self.timeout).await {
            Ok((status, _)) if status.is_success() => Ok(()),
            _ => Err(DataError::PrimaryUnreachable(primary.to_string())),
        }
    }
}

async fn http_get(
    address: &str,
    path: &str,
    timeout: Duration,
) -> Result<(http::StatusCode, Bytes), String> {
    let fetch = async {
        let stream = tokio::net::TcpStream::connect(address)
            .await
            .map_err(|e| e.to_string())?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| e.to_string())?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(path)
            .header("host", address)
            .body(Empty::<Bytes>::new())
            .map_err(|e| e.to_string())?;
        let resp = sender.send_request(req).await.map_err(|e| e.to_string())?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| e.to_string())?
            .to_bytes();
        Ok::<_, String>((status, body))
    };

    match tokio::time::timeout(timeout, fetch).await {
        Ok(result) => {
            if let Err(e) = &result {
                debug!(%address, path, error = %e, "introspection request failed");
            }
            result
        }
        Err(_) => Err(format!("timed out after {timeout:?}")),
    }
}
