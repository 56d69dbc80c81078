//! Peer Resolver
//!
//! Turns the registry's current listing into labeled peer identities and
//! splits the local pod (the probe source) from everyone else.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, instrument};

use super::topology::TopologyCache;
use crate::domain::{PeerIdentity, PeerRegistry, ProbePairing};
use crate::error::Result;

/// Result of one resolution cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPeers {
    /// The local pod, if it is part of the current listing
    pub source: Option<PeerIdentity>,
    /// Every other pod with a usable address, in listing order
    pub destinations: Vec<PeerIdentity>,
}

impl ResolvedPeers {
    /// One pairing per destination; empty when the source is unknown.
    pub fn pairings(&self) -> Vec<ProbePairing> {
        match &self.source {
            Some(source) => self
                .destinations
                .iter()
                .map(|dest| ProbePairing::new(source.clone(), dest.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Names of every resolved pod, source included.
    pub fn pod_names(&self) -> HashSet<String> {
        self.source
            .iter()
            .chain(self.destinations.iter())
            .map(|peer| peer.name.clone())
            .collect()
    }

    /// Label values (name, ip, zone, node) of every resolved pod, source
    /// included.
    pub fn identities(&self) -> HashSet<Vec<String>> {
        self.source
            .iter()
            .chain(self.destinations.iter())
            .map(|peer| peer.label_values().to_vec())
            .collect()
    }
}

/// Resolves the peer set of a service against the registry.
pub struct PeerResolver {
    registry: Arc<dyn PeerRegistry>,
    topology: TopologyCache,
}

impl PeerResolver {
    pub fn new(registry: Arc<dyn PeerRegistry>) -> Self {
        let topology = TopologyCache::new(registry.clone());
        Self { registry, topology }
    }

    /// Access the node → zone cache owned by this resolver.
    pub fn topology(&self) -> &TopologyCache {
        &self.topology
    }

    /// List peers matching `selector` and partition them around `local_name`.
    ///
    /// Peers without a parseable address are skipped. A listing failure is
    /// returned as an error; callers skip the cycle.
    #[instrument(skip(self))]
    pub async fn resolve_peers(&self, selector: &str, local_name: &str) -> Result<ResolvedPeers> {
        let records = self.registry.list_peers(selector).await?;

        let mut resolved = ResolvedPeers::default();

        for record in records {
            let Some(address) = record.address() else {
                debug!(
                    pod = %record.name,
                    phase = ?record.phase,
                    "Skipping pod without a usable IP"
                );
                continue;
            };

            let zone = self.topology.resolve_zone(&record.node_name).await;
            let identity = PeerIdentity::new(record.name, address, record.node_name, zone);

            if identity.name == local_name {
                resolved.source = Some(identity);
            } else {
                resolved.destinations.push(identity);
            }
        }

        debug!(
            source = resolved.source.is_some(),
            destinations = resolved.destinations.len(),
            "Resolved peers"
        );

        Ok(resolved)
    }
}

impl std::fmt::Debug for PeerResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerResolver")
            .field("topology", &self.topology)
            .finish()
    }
}
