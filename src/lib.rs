//! kube-latency - In-cluster Network Prober
//!
//! Every pod of a Kubernetes service runs one instance. Each instance
//! periodically discovers its sibling pods, probes latency and throughput
//! from itself to every other pod, and exposes the results as Prometheus
//! summaries labeled with both ends' pod name, IP, node and zone.
//!
//! # Architecture
//!
//! ```text
//! Campaign ──▶ PeerResolver ──▶ TopologyCache ──▶ PeerRegistry (Kubernetes)
//!    │
//!    └──▶ probe tasks ──▶ Prober (HTTP) ──▶ ProbeMetrics ──▶ /metrics
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Kubernetes registry, HTTP prober and in-memory doubles
//! - [`campaign`] - The periodic discover-pair-probe loop
//! - [`discovery`] - Peer resolution and node zone cache
//! - [`domain`] - Value objects and ports
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus summaries and gauges
//! - [`server`] - `/ping`, `/data` and `/metrics` endpoints

pub mod adapters;
pub mod campaign;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod server;

// Re-export commonly used types
pub use campaign::{Campaign, CampaignConfig};
pub use discovery::{PeerResolver, TopologyCache};
pub use error::{Error, Result};
pub use metrics::ProbeMetrics;
pub use server::{ProbeServer, ServerConfig};

/// Crate version, as reported at startup and in the probe User-Agent
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
