//! Domain Ports (Port/Adapter Pattern)
//!
//! This module defines the value objects the measurement loop works with and
//! the two abstractions (ports) it depends on. Infrastructure adapters
//! implement these traits to provide concrete implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │          PeerRegistry      │      Prober            │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  KubernetesRegistry │ HttpProber │ InMemory doubles  │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;

/// Metric label names, source identity first, then destination identity.
pub const LABEL_NAMES: [&str; 8] = [
    "source_pod_name",
    "source_pod_ip",
    "source_zone",
    "source_node_name",
    "dest_pod_name",
    "dest_pod_ip",
    "dest_zone",
    "dest_node_name",
];

// =============================================================================
// Value Objects
// =============================================================================

/// A peer as reported by the registry, before any validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Pod name
    pub name: String,
    /// Pod IP as reported; may be missing while the pod is being scheduled
    pub ip: Option<String>,
    /// Node the pod is placed on
    pub node_name: String,
    /// Pod phase (Pending, Running, ...)
    pub phase: Option<String>,
}

impl PeerRecord {
    pub fn new(name: impl Into<String>, ip: Option<&str>, node_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: ip.map(str::to_string),
            node_name: node_name.into(),
            phase: Some("Running".to_string()),
        }
    }

    /// Parsed pod address, `None` when missing or malformed.
    pub fn address(&self) -> Option<IpAddr> {
        self.ip.as_deref().and_then(|ip| ip.trim().parse().ok())
    }
}

/// Labeled identity of a pod for one measurement iteration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PeerIdentity {
    pub name: String,
    pub address: IpAddr,
    pub node: String,
    pub zone: String,
}

impl PeerIdentity {
    pub fn new(
        name: impl Into<String>,
        address: IpAddr,
        node: impl Into<String>,
        zone: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            node: node.into(),
            zone: zone.into(),
        }
    }

    /// Label values in `pod_name, pod_ip, zone, node_name` order.
    pub fn label_values(&self) -> [String; 4] {
        [
            self.name.clone(),
            self.address.to_string(),
            self.zone.clone(),
            self.node.clone(),
        ]
    }

    /// URL of an endpoint served by this peer on the given port.
    pub fn endpoint(&self, port: u16, path: &str) -> String {
        format!("http://{}{}", SocketAddr::new(self.address, port), path)
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Directed pair of the local pod and one peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProbePairing {
    pub source: PeerIdentity,
    pub destination: PeerIdentity,
}

impl ProbePairing {
    pub fn new(source: PeerIdentity, destination: PeerIdentity) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// The eight metric label values for this pair, matching [`LABEL_NAMES`].
    pub fn label_values(&self) -> Vec<String> {
        let mut values = Vec::with_capacity(LABEL_NAMES.len());
        values.extend(self.source.label_values());
        values.extend(self.destination.label_values());
        values
    }
}

/// Per-phase breakdown of a single HTTP round trip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PhaseTimings {
    pub dns_lookup: Duration,
    pub tcp_connection: Duration,
    /// Always zero: probes run over plain HTTP
    pub tls_handshake: Duration,
    /// Request written until the response head arrived
    pub server_processing: Duration,
    /// Response head until the body was fully drained
    pub content_transfer: Duration,
}

impl PhaseTimings {
    pub fn total(&self) -> Duration {
        self.dns_lookup
            + self.tcp_connection
            + self.tls_handshake
            + self.server_processing
            + self.content_transfer
    }
}

/// Outcome of one successful probe round trip.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub timings: PhaseTimings,
    /// Wall-clock time at which the body was fully drained
    pub finished_at: DateTime<Utc>,
    pub status: u16,
    pub bytes_received: u64,
}

impl ProbeResult {
    pub fn content_transfer(&self) -> Duration {
        self.timings.content_transfer
    }
}

// =============================================================================
// Registry Port
// =============================================================================

/// Port for the cluster registry that owns the peer set.
///
/// Failures surface as errors, never as partial data.
#[async_trait]
pub trait PeerRegistry: Send + Sync {
    /// List all peers matching a label selector (`k=v,k2=v2`).
    async fn list_peers(&self, selector: &str) -> Result<Vec<PeerRecord>>;

    /// Zone of a node. An unlabeled node yields `Ok("")`.
    async fn node_zone(&self, node_name: &str) -> Result<String>;
}

// =============================================================================
// Probe Port
// =============================================================================

/// Port for executing a single timed round trip against a peer endpoint.
///
/// Implementations must not retry; retry policy belongs to the caller.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, url: &str) -> Result<ProbeResult>;
}

// =============================================================================
// Tests
// =============================================================================
