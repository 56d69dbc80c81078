//! Discovery module
//!
//! Resolves the pods backing the probed service and their topology
//! (node, zone) from the cluster registry.

mod resolver;
mod topology;

pub use resolver::{PeerResolver, ResolvedPeers};
pub use topology::TopologyCache;
