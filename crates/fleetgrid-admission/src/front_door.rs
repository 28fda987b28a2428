//! HTTP front door.
//!
//! `FrontDoor` accepts HTTP/1 requests, admits each one through the
//! [`AdmissionRouter`], and forwards it to the chosen worker. The request
//! body is read before admission; the lease is held until the worker's
//! response has been read in full. Both bodies are capped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::AdmissionError;
use crate::router::AdmissionRouter;

pub const SESSION_HEADER: &str = "x-session-id";
pub const SESSION_COOKIE: &str = "session";
/// Response header naming the worker that served the request.
pub const INSTANCE_HEADER: &str = "x-fleetgrid-instance";

/// Seconds clients are told to back off after a capacity rejection.
const RETRY_AFTER_SECS: &str = "1";

const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Reverse proxy in front of the worker pool.
pub struct FrontDoor {
    bind_addr: SocketAddr,
    router: Arc<AdmissionRouter>,
    upstream_timeout: Duration,
    max_body_bytes: usize,
}

impl FrontDoor {
    pub fn new(bind_addr: SocketAddr, router: Arc<AdmissionRouter>, upstream_timeout: Duration) -> Self {
        Self {
            bind_addr,
            router,
            upstream_timeout,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Cap buffered request and response bodies at `bytes`.
    pub fn with_body_limit(mut self, bytes: u64) -> Self {
        self.max_body_bytes = usize::try_from(bytes).unwrap_or(usize::MAX);
        self
    }

    /// Bind and serve until shutdown.
    pub async fn serve(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .context("failed to bind front door")?;
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve_on(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let local = listener.local_addr().context("front door has no local address")?;
        info!(addr = %local, "front door listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let router = Arc::clone(&self.router);
                    let limits = Limits {
                        upstream_timeout: self.upstream_timeout,
                        max_body_bytes: self.max_body_bytes,
                    };

                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let svc = service_fn(move |req: Request<Incoming>| {
                            let router = Arc::clone(&router);
                            async move {
                                Ok::<_, hyper::Error>(handle(&router, req, limits).await)
                            }
                        });

                        if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                            debug!(%peer_addr, error = %e, "connection error");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!("front door shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    upstream_timeout: Duration,
    max_body_bytes: usize,
}

async fn handle(router: &AdmissionRouter, req: Request<Incoming>, limits: Limits) -> Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();
    let body = match read_limited(body, limits.max_body_bytes).await {
        Ok(body) => body,
        Err(BodyError::TooLarge) => {
            debug!(limit = limits.max_body_bytes, "request body over limit");
            return plain(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large");
        }
        Err(BodyError::Read(e)) => {
            debug!(error = %e, "reading request body failed");
            return plain(StatusCode::BAD_REQUEST, "Bad Request");
        }
    };

    let session = session_token(&parts.headers);
    let admitted = match router.route(session.as_deref()).await {
        Ok(admitted) => admitted,
        Err(AdmissionError::CapacityExhausted(reason)) => {
            let mut resp = plain(StatusCode::SERVICE_UNAVAILABLE, format!("capacity exhausted: {reason}"));
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
            return resp;
        }
        Err(e) => {
            error!(error = %e, "admission failed");
            return plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
    };

    let forwarded = tokio::time::timeout(
        limits.upstream_timeout,
        forward(&admitted.endpoint, parts, body, limits.max_body_bytes),
    )
    .await;
    let resp = match forwarded {
        Ok(Ok(mut resp)) => {
            if let Ok(value) = HeaderValue::from_str(&admitted.instance_id) {
                resp.headers_mut().insert(INSTANCE_HEADER, value);
            }
            resp
        }
        Ok(Err(e)) => {
            warn!(instance_id = %admitted.instance_id, error = %e, "upstream request failed");
            plain(StatusCode::BAD_GATEWAY, "Bad Gateway")
        }
        Err(_) => {
            warn!(
                instance_id = %admitted.instance_id,
                timeout = ?limits.upstream_timeout,
                "upstream request timed out"
            );
            plain(StatusCode::BAD_GATEWAY, "Bad Gateway")
        }
    };
    drop(admitted);
    resp
}

enum BodyError {
    TooLarge,
    Read(Box<dyn std::error::Error + Send + Sync>),
}

/// Buffer `body`, failing once it exceeds `limit` bytes.
async fn read_limited<B>(body: B, limit: usize) -> Result<Bytes, BodyError>
where
    B: hyper::body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(BodyError::TooLarge),
        Err(e) => Err(BodyError::Read(e)),
    }
}

/// Send the buffered request to `endpoint` and buffer the response.
async fn forward(
    endpoint: &str,
    parts: http::request::Parts,
    body: Bytes,
    max_body_bytes: usize,
) -> anyhow::Result<Response<Full<Bytes>>> {
    let stream = TcpStream::connect(endpoint)
        .await
        .with_context(|| format!("connecting to {endpoint}"))?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .context("upstream handshake")?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut upstream = Request::builder()
        .method(parts.method)
        .uri(path)
        .body(Full::new(body))
        .context("building upstream request")?;
    *upstream.headers_mut() = parts.headers;
    upstream.headers_mut().remove(header::TRANSFER_ENCODING);
    upstream
        .headers_mut()
        .insert(header::HOST, HeaderValue::from_str(endpoint).context("endpoint is not a valid host")?);

    let resp = sender.send_request(upstream).await.context("sending upstream request")?;
    let (parts, body) = resp.into_parts();
    let body = match read_limited(body, max_body_bytes).await {
        Ok(body) => body,
        Err(BodyError::TooLarge) => anyhow::bail!("upstream body over {max_body_bytes} bytes"),
        Err(BodyError::Read(e)) => anyhow::bail!("reading upstream body: {e}"),
    };
    let mut out = Response::from_parts(parts, Full::new(body));
    // The body was re-framed; let hyper compute its length.
    out.headers_mut().remove(header::TRANSFER_ENCODING);
    Ok(out)
}

/// Session token from `x-session-id`, else the `session` cookie.
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok())
        && !value.is_empty()
    {
        return Some(value.to_string());
    }
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

fn plain(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    resp
}
