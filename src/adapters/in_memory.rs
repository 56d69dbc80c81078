//! In-memory port implementations.
//!
//! Deterministic stand-ins for the cluster registry and the HTTP prober,
//! used by unit and integration tests and for running the measurement loop
//! without a cluster.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use crate::domain::{PeerRecord, PeerRegistry, PhaseTimings, ProbeResult, Prober};
use crate::error::{Error, Result};

// =============================================================================
// Registry
// =============================================================================

/// In-memory peer registry.
///
/// Peers are stored per exact selector string; unknown selectors list as
/// empty. Listing and individual node lookups can be made to fail.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    peers: RwLock<HashMap<String, Vec<PeerRecord>>>,
    zones: RwLock<HashMap<String, String>>,
    failing_nodes: RwLock<HashSet<String>>,
    listing_fails: AtomicBool,
    listings: AtomicUsize,
    zone_lookups: AtomicUsize,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the peers returned for `selector`.
    pub fn set_peers(&self, selector: &str, peers: Vec<PeerRecord>) {
        self.peers.write().insert(selector.to_string(), peers);
    }

    pub fn set_zone(&self, node_name: &str, zone: &str) {
        self.zones
            .write()
            .insert(node_name.to_string(), zone.to_string());
    }

    /// Make lookups for `node_name` fail until [`Self::recover_node`].
    pub fn fail_node(&self, node_name: &str) {
        self.failing_nodes.write().insert(node_name.to_string());
    }

    pub fn recover_node(&self, node_name: &str) {
        self.failing_nodes.write().remove(node_name);
    }

    pub fn fail_listing(&self, fail: bool) {
        self.listing_fails.store(fail, Ordering::SeqCst);
    }

    /// Number of `list_peers` calls served so far.
    pub fn listings(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }

    /// Number of `node_zone` calls served so far, failed ones included.
    pub fn zone_lookups(&self) -> usize {
        self.zone_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerRegistry for InMemoryRegistry {
    async fn list_peers(&self, selector: &str) -> Result<Vec<PeerRecord>> {
        self.listings.fetch_add(1, Ordering::SeqCst);

        if self.listing_fails.load(Ordering::SeqCst) {
            return Err(Error::Registry(format!(
                "listing pods with selector '{}' failed",
                selector
            )));
        }

        Ok(self.peers.read().get(selector).cloned().unwrap_or_default())
    }

    async fn node_zone(&self, node_name: &str) -> Result<String> {
        self.zone_lookups.fetch_add(1, Ordering::SeqCst);

        if self.failing_nodes.read().contains(node_name) {
            return Err(Error::Registry(format!("node {} unavailable", node_name)));
        }

        Ok(self
            .zones
            .read()
            .get(node_name)
            .cloned()
            .unwrap_or_default())
    }
}

// =============================================================================
// Prober
// =============================================================================

/// Prober that answers from a script instead of the network.
///
/// Every call to a URL is numbered from 1. Calls can fail by number, whole
/// hosts can be made unreachable, and successful calls report a fixed
/// content-transfer duration after an optional delay.
#[derive(Debug)]
pub struct ScriptedProber {
    content_transfer: Duration,
    delay: RwLock<Option<Duration>>,
    calls: Mutex<HashMap<String, usize>>,
    failing_calls: RwLock<HashMap<String, HashSet<usize>>>,
    unreachable_hosts: RwLock<HashSet<String>>,
}

impl ScriptedProber {
    pub fn new(content_transfer: Duration) -> Self {
        Self {
            content_transfer,
            delay: RwLock::new(None),
            calls: Mutex::new(HashMap::new()),
            failing_calls: RwLock::new(HashMap::new()),
            unreachable_hosts: RwLock::new(HashSet::new()),
        }
    }

    /// Fail the given 1-based call numbers against `url`.
    pub fn fail_calls(&self, url: &str, call_numbers: &[usize]) {
        self.failing_calls
            .write()
            .entry(url.to_string())
            .or_default()
            .extend(call_numbers.iter().copied());
    }

    /// Refuse every connection to `host` (an IP or hostname, no port).
    pub fn make_unreachable(&self, host: &str) {
        self.unreachable_hosts.write().insert(host.to_string());
    }

    /// Hold every successful call for `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.write() = Some(delay);
    }

    /// Number of calls made against `url`.
    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    fn is_unreachable(&self, url: &str) -> bool {
        self.unreachable_hosts
            .read()
            .iter()
            .any(|host| url.contains(&format!("//{}:", host)))
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, url: &str) -> Result<ProbeResult> {
        let call = {
            let mut calls = self.calls.lock();
            let count = calls.entry(url.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if self.is_unreachable(url) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("connection refused: {}", url),
            )));
        }

        let scripted_failure = self
            .failing_calls
            .read()
            .get(url)
            .is_some_and(|calls| calls.contains(&call));
        if scripted_failure {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                format!("scripted failure of call {} to {}", call, url),
            )));
        }

        let delay = *self.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        Ok(ProbeResult {
            timings: PhaseTimings {
                content_transfer: self.content_transfer,
                ..Default::default()
            },
            finished_at: Utc::now(),
            status: 200,
            bytes_received: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_registry_lists_by_selector() {
        let registry = InMemoryRegistry::new();
        registry.set_peers("app=a", vec![PeerRecord::new("p", Some("10.0.0.1"), "n")]);

        assert_eq!(registry.list_peers("app=a").await.unwrap().len(), 1);
        assert!(registry.list_peers("app=b").await.unwrap().is_empty());
        assert_eq!(registry.listings(), 2);
    }

    #[tokio::test]
    async fn test_scripted_failures_are_per_call() {
        let prober = ScriptedProber::new(Duration::from_millis(5));
        prober.fail_calls("http://10.0.0.2:8080/ping", &[2]);

        assert_ok!(prober.probe("http://10.0.0.2:8080/ping").await);
        assert_err!(prober.probe("http://10.0.0.2:8080/ping").await);
        assert_ok!(prober.probe("http://10.0.0.2:8080/ping").await);
        assert_eq!(prober.calls("http://10.0.0.2:8080/ping"), 3);
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let prober = ScriptedProber::new(Duration::from_millis(5));
        prober.make_unreachable("10.0.0.9");

        assert_err!(prober.probe("http://10.0.0.9:8080/data").await);
        assert_ok!(prober.probe("http://10.0.0.90:8080/data").await);
    }
}
