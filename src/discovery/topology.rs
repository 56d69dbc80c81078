//! Topology Cache
//!
//! Memoizes node → zone lookups so that resolving the peer set does not cost
//! one registry round trip per pod. Nodes never change zone, so a resolved
//! entry is kept for the lifetime of the cache. Failed lookups are never
//! stored and are retried on the next request for that node.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::domain::PeerRegistry;

/// Node name → zone cache backed by the peer registry.
pub struct TopologyCache {
    registry: Arc<dyn PeerRegistry>,
    zones: DashMap<String, String>,
}

impl TopologyCache {
    pub fn new(registry: Arc<dyn PeerRegistry>) -> Self {
        Self {
            registry,
            zones: DashMap::new(),
        }
    }

    /// Zone of `node_name`, or `""` when it cannot be resolved right now.
    /// An unscheduled pod has no node and never triggers a lookup.
    pub async fn resolve_zone(&self, node_name: &str) -> String {
        if node_name.is_empty() {
            return String::new();
        }

        if let Some(zone) = self.zones.get(node_name) {
            return zone.clone();
        }

        match self.registry.node_zone(node_name).await {
            Ok(zone) => {
                debug!(node = %node_name, zone = %zone, "Cached node zone");
                self.zones.insert(node_name.to_string(), zone.clone());
                zone
            }
            Err(e) => {
                warn!("Error getting zone for node {}: {}", node_name, e);
                String::new()
            }
        }
    }

    /// Cached zone for a node without triggering a lookup.
    pub fn get(&self, node_name: &str) -> Option<String> {
        self.zones.get(node_name).map(|zone| zone.clone())
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

impl std::fmt::Debug for TopologyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyCache")
            .field("entries", &self.zones.len())
            .finish()
    }
}
