//! HTTP Prober Adapter
//!
//! Implements the `Prober` port with a hyper HTTP/1 client connection that
//! is opened fresh for every probe, so each round trip includes connection
//! setup and every phase boundary can be timestamped.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Empty};
use hyper::header::{HOST, USER_AGENT};
use hyper::{Request, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::debug;

use crate::domain::{PhaseTimings, ProbeResult, Prober};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the HTTP prober
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Deadline for a whole round trip, body included
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Prober
// =============================================================================

/// Timed plain-HTTP prober.
#[derive(Debug, Clone, Default)]
pub struct HttpProber {
    config: ProbeConfig,
}

impl HttpProber {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    async fn round_trip(&self, url: &str) -> Result<ProbeResult> {
        let uri: Uri = url
            .parse()
            .map_err(|e| Error::InvalidUrl(format!("{}: {}", url, e)))?;

        if uri.scheme_str() != Some("http") {
            return Err(Error::InvalidUrl(format!("{}: only http is supported", url)));
        }
        let authority = uri
            .authority()
            .ok_or_else(|| Error::InvalidUrl(format!("{}: missing host", url)))?
            .clone();
        let port = authority.port_u16().unwrap_or(80);
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();

        let started = Instant::now();

        let addr = resolve(authority.host(), port).await?;
        let resolved = Instant::now();

        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let connected = Instant::now();

        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Probe connection closed with error: {}", e);
            }
        });

        let request = Request::get(path)
            .header(HOST, authority.as_str())
            .header(USER_AGENT, concat!("kube-latency/", env!("CARGO_PKG_VERSION")))
            .body(Empty::<Bytes>::new())
            .map_err(|e| Error::HttpClient(e.to_string()))?;

        let response = sender.send_request(request).await?;
        let first_byte = Instant::now();
        let status = response.status();

        let mut body = response.into_body();
        let mut bytes_received = 0u64;
        while let Some(frame) = body.frame().await {
            if let Ok(data) = frame?.into_data() {
                bytes_received += data.len() as u64;
            }
        }
        let drained = Instant::now();
        let finished_at = Utc::now();

        debug!(
            url = %url,
            status = status.as_u16(),
            bytes = bytes_received,
            total_ms = drained.duration_since(started).as_millis() as u64,
            "Probe completed"
        );

        Ok(ProbeResult {
            timings: PhaseTimings {
                dns_lookup: resolved.duration_since(started),
                tcp_connection: connected.duration_since(resolved),
                tls_handshake: Duration::ZERO,
                server_processing: first_byte.duration_since(connected),
                content_transfer: drained.duration_since(first_byte),
            },
            finished_at,
            status: status.as_u16(),
            bytes_received,
        })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, url: &str) -> Result<ProbeResult> {
        match tokio::time::timeout(self.config.timeout, self.round_trip(url)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ProbeTimeout {
                url: url.to_string(),
                timeout: self.config.timeout,
            }),
        }
    }
}

/// Resolve a URI host to a socket address; IP literals skip DNS.
async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let host = host.trim_start_matches('[').trim_end_matches(']');

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| Error::HttpClient(format!("no addresses found for {}", host)))
}
