//! Probe HTTP Server
//!
//! Serves the endpoints peers probe and Prometheus scrapes:
//!
//! - `GET /ping` - `pong`, the latency probe target
//! - `GET /data` - exactly `data_size` random bytes, the throughput target
//! - `GET /metrics` - text exposition of the probe metrics
//! - `GET /healthz` - liveness

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rand::RngCore;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::metrics::ProbeMetrics;

/// `/data` payloads are generated and written in chunks of this size.
pub const DATA_CHUNK_SIZE: usize = 64 * 1024;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Response body shared by every endpoint.
pub type ResponseBody = BoxBody<Bytes, Infallible>;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the probe server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_address: SocketAddr,

    /// Size in bytes of the `/data` payload
    pub data_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            data_size: 16 * 1024 * 1024,
        }
    }
}

/// Parse a listen address, accepting the `:8080` shorthand for all
/// interfaces.
pub fn parse_listen_address(addr: &str) -> Result<SocketAddr> {
    let addr = addr.trim();
    let normalized = match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => addr.to_string(),
    };

    normalized
        .parse()
        .map_err(|e| Error::Config(format!("invalid listen address '{}': {}", addr, e)))
}

// =============================================================================
// Server
// =============================================================================

/// HTTP server for the probe and metrics endpoints.
pub struct ProbeServer {
    config: ServerConfig,
    metrics: Arc<ProbeMetrics>,
}

impl ProbeServer {
    pub fn new(config: ServerConfig, metrics: Arc<ProbeMetrics>) -> Self {
        Self { config, metrics }
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(self.config.listen_address)
            .await
            .map_err(|e| {
                Error::Internal(format!(
                    "Failed to bind {}: {}",
                    self.config.listen_address, e
                ))
            })
    }

    /// Accept connections on `listener` until `shutdown` fires. Accept
    /// errors are logged and retried after a short pause.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!("Probe server listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Probe server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted_connection(accepted) {
                    Some(conn) => conn,
                    None => {
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { Ok::<_, Infallible>(server.handle(&req)) }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Connection from {} closed with error: {}", peer, e);
                }
            });
        }
    }

    /// Route a request. Only the path is inspected.
    pub fn handle<B>(&self, req: &Request<B>) -> Response<ResponseBody> {
        match req.uri().path() {
            "/ping" => text(StatusCode::OK, "pong"),
            "/data" => self.data(),
            "/metrics" => self.metrics(),
            "/healthz" => text(StatusCode::OK, "ok"),
            _ => text(StatusCode::NOT_FOUND, "not found"),
        }
    }

    fn data(&self) -> Response<ResponseBody> {
        let size = self.config.data_size;

        let mut response = Response::new(random_body(size));
        let headers = response.headers_mut();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        headers.insert(CONTENT_LENGTH, HeaderValue::from(size));
        response
    }

    fn metrics(&self) -> Response<ResponseBody> {
        match self.metrics.encode_text() {
            Ok(buffer) => {
                let mut response = Response::new(Full::new(Bytes::from(buffer)).boxed());
                if let Ok(content_type) = HeaderValue::from_str(&self.metrics.content_type()) {
                    response.headers_mut().insert(CONTENT_TYPE, content_type);
                }
                response
            }
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                text(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics")
            }
        }
    }
}

impl std::fmt::Debug for ProbeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeServer")
            .field("config", &self.config)
            .finish()
    }
}

/// A body of exactly `size` random bytes, generated one chunk at a time as
/// the connection asks for more.
fn random_body(size: usize) -> ResponseBody {
    let chunks = stream::iter((0..size).step_by(DATA_CHUNK_SIZE)).map(move |offset| {
        let mut chunk = vec![0u8; DATA_CHUNK_SIZE.min(size - offset)];
        rand::thread_rng().fill_bytes(&mut chunk);
        Ok::<_, Infallible>(Frame::data(Bytes::from(chunk)))
    });

    BodyExt::boxed(StreamBody::new(chunks))
}

fn accepted_connection<T>(accepted: std::io::Result<T>) -> Option<T> {
    match accepted {
        Ok(conn) => Some(conn),
        Err(e) => {
            warn!("Failed to accept connection: {}", e);
            None
        }
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<ResponseBody> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())).boxed());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(data_size: usize) -> ProbeServer {
        ProbeServer::new(
            ServerConfig {
                data_size,
                ..Default::default()
            },
            Arc::new(ProbeMetrics::new().unwrap()),
        )
    }

    fn get(path: &str) -> Request<()> {
        Request::get(path).body(()).unwrap()
    }

    async fn body_bytes(response: Response<ResponseBody>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_address, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.data_size, 16 * 1024 * 1024);
    }

    #[test]
    fn test_parse_listen_address() {
        assert_eq!(
            parse_listen_address(":8080").unwrap(),
            "0.0.0.0:8080".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_listen_address("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_listen_address("[::]:8080").unwrap(),
            "[::]:8080".parse::<SocketAddr>().unwrap()
        );
        assert!(matches!(parse_listen_address("8080"), Err(Error::Config(_))));
        assert!(matches!(parse_listen_address(":http"), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_ping_returns_pong() {
        let response = server(16).handle(&get("/ping"));

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn test_data_returns_configured_size() {
        let response = server(1024).handle(&get("/data"));

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/octet-stream"
        );
        assert_eq!(body_bytes(response).await.len(), 1024);
    }

    #[tokio::test]
    async fn test_data_is_random() {
        let server = server(256);

        let first = body_bytes(server.handle(&get("/data"))).await;
        let second = body_bytes(server.handle(&get("/data"))).await;

        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_data_streams_partial_last_chunk() {
        let size = 2 * DATA_CHUNK_SIZE + 17;
        let response = server(size).handle(&get("/data"));
        assert_eq!(
            response.headers().get(CONTENT_LENGTH).unwrap(),
            &size.to_string()
        );

        let mut body = response.into_body();
        let mut frames = Vec::new();
        while let Some(frame) = body.frame().await {
            frames.push(frame.unwrap().into_data().unwrap().len());
        }

        assert_eq!(frames, vec![DATA_CHUNK_SIZE, DATA_CHUNK_SIZE, 17]);
    }

    #[test]
    fn test_accept_error_is_not_fatal() {
        let aborted: std::io::Result<u8> =
            Err(std::io::Error::from(std::io::ErrorKind::ConnectionAborted));

        assert_eq!(accepted_connection(aborted), None);
        assert_eq!(accepted_connection(Ok(7u8)), Some(7));
    }

    #[tokio::test]
    async fn test_zero_sized_data() {
        let response = server(0).handle(&get("/data"));
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = server(16).handle(&get("/metrics"));

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get(CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let srv = server(16);

        assert_eq!(srv.handle(&get("/nope")).status(), StatusCode::NOT_FOUND);
        assert_eq!(srv.handle(&get("/healthz")).status(), StatusCode::OK);
        assert_eq!(srv.handle(&get("/ping?x=1")).status(), StatusCode::OK);
    }
}
