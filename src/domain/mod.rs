//! Domain Layer
//!
//! Value objects shared by discovery, probing and aggregation, plus the
//! ports the measurement loop depends on.
//!
//! # Usage
//!
//! ```ignore
//! use kube_latency::domain::{PeerRegistry, Prober};
//!
//! // Use traits for dependency injection
//! async fn ping_once<P: Prober>(prober: &P, url: &str) -> Result<Duration> {
//!     let result = prober.probe(url).await?;
//!     Ok(result.content_transfer())
//! }
//! ```

pub mod ports;

pub use ports::{
    PeerIdentity, PeerRecord, PeerRegistry, PhaseTimings, ProbePairing, ProbeResult, Prober,
    LABEL_NAMES,
};
