//! Probe Metrics - the aggregator
//!
//! Holds the three instruments every probe outcome ends up in, all keyed by
//! the eight source/destination labels:
//!
//! - `download_durations_s` - summary of throughput content-transfer time
//! - `ping_durations_s` - summary of per-round latency content-transfer time
//! - `download_probe_size` - gauge of the configured payload size
//!
//! Instruments live in a dedicated [`Registry`] owned by this struct so that
//! several instances (tests, embedded use) never collide.

use std::collections::HashSet;
use std::time::Duration;

use dashmap::DashSet;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use tracing::{debug, warn};

use super::summary::{SummaryOpts, SummaryVec};
use crate::domain::{ProbePairing, LABEL_NAMES};
use crate::error::Result;

pub const DOWNLOAD_DURATIONS: &str = "download_durations_s";
pub const PING_DURATIONS: &str = "ping_durations_s";
pub const DOWNLOAD_PROBE_SIZE: &str = "download_probe_size";

/// Index of the destination pod name within a label set.
const IDENTITY_LABELS: usize = 4;

/// Aggregates probe outcomes into labeled Prometheus instruments.
pub struct ProbeMetrics {
    registry: Registry,
    download_durations: SummaryVec,
    ping_durations: SummaryVec,
    download_probe_size: GaugeVec,
    /// Every label set any instrument has seen
    series: DashSet<Vec<String>>,
    /// Label sets with a size gauge
    sized: DashSet<Vec<String>>,
}

impl ProbeMetrics {
    /// Create the instruments in a fresh registry.
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Create the instruments and register them with `registry`.
    pub fn with_registry(registry: Registry) -> Result<Self> {
        let download_durations = SummaryVec::new(
            SummaryOpts::new(DOWNLOAD_DURATIONS, "Download durations in seconds"),
            &LABEL_NAMES,
        )?;
        let ping_durations = SummaryVec::new(
            SummaryOpts::new(PING_DURATIONS, "Ping durations in seconds"),
            &LABEL_NAMES,
        )?;
        let download_probe_size = GaugeVec::new(
            Opts::new(DOWNLOAD_PROBE_SIZE, "Download probe sizes in bytes"),
            &LABEL_NAMES,
        )?;

        registry.register(Box::new(download_durations.clone()))?;
        registry.register(Box::new(ping_durations.clone()))?;
        registry.register(Box::new(download_probe_size.clone()))?;

        Ok(Self {
            registry,
            download_durations,
            ping_durations,
            download_probe_size,
            series: DashSet::new(),
            sized: DashSet::new(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    // =========================================================================
    // Recording
    // =========================================================================

    pub fn observe_download(&self, pairing: &ProbePairing, duration: Duration) {
        let values = pairing.label_values();
        if let Err(e) = self
            .download_durations
            .observe(&label_refs(&values), duration.as_secs_f64())
        {
            warn!("Failed to record download duration: {}", e);
            return;
        }
        self.series.insert(values);
    }

    pub fn observe_ping(&self, pairing: &ProbePairing, duration: Duration) {
        let values = pairing.label_values();
        if let Err(e) = self
            .ping_durations
            .observe(&label_refs(&values), duration.as_secs_f64())
        {
            warn!("Failed to record ping duration: {}", e);
            return;
        }
        self.series.insert(values);
    }

    /// Record the configured payload size for a pair.
    pub fn set_download_probe_size(&self, pairing: &ProbePairing, bytes: u64) {
        let values = pairing.label_values();
        match self
            .download_probe_size
            .get_metric_with_label_values(&label_refs(&values))
        {
            Ok(gauge) => gauge.set(bytes as f64),
            Err(e) => {
                warn!("Failed to record download probe size: {}", e);
                return;
            }
        }
        self.sized.insert(values.clone());
        self.series.insert(values);
    }

    // =========================================================================
    // Reading
    // =========================================================================

    /// Number of ping observations recorded for a pair.
    pub fn ping_count(&self, pairing: &ProbePairing) -> u64 {
        let values = pairing.label_values();
        self.ping_durations
            .sample_count(&label_refs(&values))
            .unwrap_or(0)
    }

    /// Number of download observations recorded for a pair.
    pub fn download_count(&self, pairing: &ProbePairing) -> u64 {
        let values = pairing.label_values();
        self.download_durations
            .sample_count(&label_refs(&values))
            .unwrap_or(0)
    }

    /// Current size gauge for a pair, `None` if it was never set.
    pub fn download_probe_size(&self, pairing: &ProbePairing) -> Option<f64> {
        let values = pairing.label_values();
        if !self.sized.contains(&values) {
            return None;
        }
        self.download_probe_size
            .get_metric_with_label_values(&label_refs(&values))
            .ok()
            .map(|gauge| gauge.get())
    }

    /// Number of distinct label sets across all instruments.
    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    /// Render all instruments in the Prometheus text format.
    pub fn encode_text(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    /// Content type of [`Self::encode_text`] output.
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    // =========================================================================
    // Expiry
    // =========================================================================

    /// Remove every series whose source or destination identity is not in
    /// `present`. An identity is the full (name, ip, zone, node) tuple, so a
    /// pod that comes back under the same name with a new address still
    /// expires its old series. Returns the number of label sets removed.
    pub fn retain_peers(&self, present: &HashSet<Vec<String>>) -> usize {
        let stale: Vec<Vec<String>> = self
            .series
            .iter()
            .map(|values| values.key().clone())
            .filter(|values| {
                let (source, dest) = values.split_at(IDENTITY_LABELS);
                !present.contains(source) || !present.contains(dest)
            })
            .collect();

        for values in &stale {
            let refs = label_refs(values);
            self.download_durations.remove(&refs);
            self.ping_durations.remove(&refs);
            if self.sized.remove(values).is_some() {
                if let Err(e) = self.download_probe_size.remove_label_values(&refs) {
                    debug!("Size gauge already absent: {}", e);
                }
            }
            self.series.remove(values);
        }

        if !stale.is_empty() {
            debug!(removed = stale.len(), "Expired series of absent peers");
        }
        stale.len()
    }
}

impl std::fmt::Debug for ProbeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeMetrics")
            .field("series", &self.series.len())
            .finish()
    }
}

fn label_refs(values: &[String]) -> Vec<&str> {
    values.iter().map(String::as_str).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PeerIdentity;

    fn peer(name: &str, ip: &str) -> PeerIdentity {
        PeerIdentity::new(name, ip.parse().unwrap(), "node-1", "zone-a")
    }

    fn identities(peers: &[PeerIdentity]) -> HashSet<Vec<String>> {
        peers.iter().map(|p| p.label_values().to_vec()).collect()
    }

    fn pairing(dest: &str, ip: &str) -> ProbePairing {
        ProbePairing::new(peer("pod-a", "10.0.0.1"), peer(dest, ip))
    }

    #[test]
    fn test_records_per_pair() {
        let metrics = ProbeMetrics::new().unwrap();
        let ab = pairing("pod-b", "10.0.0.2");
        let ac = pairing("pod-c", "10.0.0.3");

        metrics.observe_ping(&ab, Duration::from_millis(1));
        metrics.observe_ping(&ab, Duration::from_millis(2));
        metrics.observe_download(&ac, Duration::from_millis(300));

        assert_eq!(metrics.ping_count(&ab), 2);
        assert_eq!(metrics.ping_count(&ac), 0);
        assert_eq!(metrics.download_count(&ac), 1);
        assert_eq!(metrics.series_count(), 2);
    }

    #[test]
    fn test_size_gauge() {
        let metrics = ProbeMetrics::new().unwrap();
        let ab = pairing("pod-b", "10.0.0.2");

        assert_eq!(metrics.download_probe_size(&ab), None);

        metrics.set_download_probe_size(&ab, 16 * 1024 * 1024);
        assert_eq!(metrics.download_probe_size(&ab), Some(16_777_216.0));
    }

    #[test]
    fn test_text_exposition() {
        let metrics = ProbeMetrics::new().unwrap();
        let ab = pairing("pod-b", "10.0.0.2");
        metrics.observe_ping(&ab, Duration::from_millis(4));
        metrics.observe_download(&ab, Duration::from_millis(250));
        metrics.set_download_probe_size(&ab, 1024);

        let text = String::from_utf8(metrics.encode_text().unwrap()).unwrap();

        assert!(text.contains("# TYPE ping_durations_s summary"));
        assert!(text.contains("# TYPE download_durations_s summary"));
        assert!(text.contains("# TYPE download_probe_size gauge"));
        assert!(text.contains("quantile=\"0.99\""));
        assert!(text.contains("dest_pod_name=\"pod-b\""));
        assert!(text.contains("source_pod_ip=\"10.0.0.1\""));
        assert!(text.contains("ping_durations_s_count{"));
        assert!(metrics.content_type().starts_with("text/plain"));
    }

    #[test]
    fn test_independent_registries() {
        let first = ProbeMetrics::new().unwrap();
        let second = ProbeMetrics::new().unwrap();
        let ab = pairing("pod-b", "10.0.0.2");

        first.observe_ping(&ab, Duration::from_millis(1));

        assert_eq!(first.ping_count(&ab), 1);
        assert_eq!(second.ping_count(&ab), 0);
    }

    #[test]
    fn test_shared_registry_gathers_instruments() {
        let metrics = ProbeMetrics::with_registry(Registry::new()).unwrap();
        let ab = pairing("pod-b", "10.0.0.2");
        metrics.observe_ping(&ab, Duration::from_millis(1));
        metrics.set_download_probe_size(&ab, 1024);

        let names: Vec<String> = metrics
            .registry()
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();

        assert_eq!(names, vec![DOWNLOAD_PROBE_SIZE, PING_DURATIONS]);
        assert!(ProbeMetrics::with_registry(metrics.registry().clone()).is_err());
    }

    #[test]
    fn test_retain_peers_removes_absent_destinations() {
        let metrics = ProbeMetrics::new().unwrap();
        let ab = pairing("pod-b", "10.0.0.2");
        let ac = pairing("pod-c", "10.0.0.3");
        metrics.observe_ping(&ab, Duration::from_millis(1));
        metrics.set_download_probe_size(&ab, 1024);
        metrics.observe_ping(&ac, Duration::from_millis(1));
        metrics.set_download_probe_size(&ac, 1024);

        let present = identities(&[peer("pod-a", "10.0.0.1"), peer("pod-b", "10.0.0.2")]);
        let removed = metrics.retain_peers(&present);

        assert_eq!(removed, 1);
        assert_eq!(metrics.ping_count(&ab), 1);
        assert_eq!(metrics.ping_count(&ac), 0);
        assert_eq!(metrics.download_probe_size(&ac), None);
        assert_eq!(metrics.series_count(), 1);

        let text = String::from_utf8(metrics.encode_text().unwrap()).unwrap();
        assert!(!text.contains("pod-c"));
    }

    #[test]
    fn test_retain_peers_noop_when_all_present() {
        let metrics = ProbeMetrics::new().unwrap();
        metrics.observe_ping(&pairing("pod-b", "10.0.0.2"), Duration::from_millis(1));

        let present = identities(&[peer("pod-a", "10.0.0.1"), peer("pod-b", "10.0.0.2")]);

        assert_eq!(metrics.retain_peers(&present), 0);
        assert_eq!(metrics.series_count(), 1);
    }

    #[test]
    fn test_retain_peers_expires_old_address_of_same_pod() {
        let metrics = ProbeMetrics::new().unwrap();
        let old = pairing("pod-c", "10.0.0.3");
        let moved = pairing("pod-c", "10.0.0.99");
        metrics.observe_ping(&old, Duration::from_millis(1));
        metrics.set_download_probe_size(&old, 1024);
        metrics.observe_ping(&moved, Duration::from_millis(1));

        let present = identities(&[peer("pod-a", "10.0.0.1"), peer("pod-c", "10.0.0.99")]);

        assert_eq!(metrics.retain_peers(&present), 1);
        assert_eq!(metrics.ping_count(&old), 0);
        assert_eq!(metrics.download_probe_size(&old), None);
        assert_eq!(metrics.ping_count(&moved), 1);
        assert_eq!(metrics.series_count(), 1);
    }

    #[test]
    fn test_retain_peers_expires_moved_source() {
        let metrics = ProbeMetrics::new().unwrap();
        metrics.observe_ping(&pairing("pod-b", "10.0.0.2"), Duration::from_millis(1));

        let present = identities(&[
            PeerIdentity::new("pod-a", "10.0.0.1".parse().unwrap(), "node-2", "zone-b"),
            peer("pod-b", "10.0.0.2"),
        ]);

        assert_eq!(metrics.retain_peers(&present), 1);
        assert_eq!(metrics.series_count(), 0);
    }
}
