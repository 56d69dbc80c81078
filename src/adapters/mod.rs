//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │            Ports: PeerRegistry │ Prober                     │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ KubernetesRegistry │ HttpProber                             │ │
//! │  │ InMemoryRegistry   │ ScriptedProber                         │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use kube_latency::adapters::{HttpProber, KubernetesRegistry, ProbeConfig};
//! use kube_latency::domain::Prober;
//!
//! let prober = HttpProber::new(ProbeConfig::default());
//! let result = prober.probe("http://10.0.0.2:8080/ping").await?;
//! ```

mod http_prober;
mod in_memory;
mod kubernetes;

pub use http_prober::{HttpProber, ProbeConfig};
pub use in_memory::{InMemoryRegistry, ScriptedProber};
pub use kubernetes::{
    render_selector, zone_from_labels, KubernetesRegistry, LEGACY_ZONE_LABEL, ZONE_LABEL,
};
