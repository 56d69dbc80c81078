//! Measurement Campaign
//!
//! Every iteration resolves the peer set, pairs the local pod with every
//! other pod and launches two independent probe tasks per pairing:
//!
//! - **latency**: `ping_rounds` sequential requests to `/ping`, one ping
//!   observation per successful round
//! - **throughput**: one request to `/data`, one download observation on
//!   success, and the configured payload size written to the size gauge
//!   whatever the outcome
//!
//! Probe tasks are detached: the loop sleeps for the test interval right
//! after spawning them and never waits for, or cancels, earlier tasks. A
//! per-destination semaphore caps how many tasks may be in flight against a
//! single peer so an unresponsive pod cannot pile up work forever.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::{PeerResolver, ResolvedPeers};
use crate::domain::{PeerRegistry, ProbePairing, Prober};
use crate::metrics::ProbeMetrics;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the measurement campaign
#[derive(Debug, Clone)]
pub struct CampaignConfig {
    /// Label selector of the probed service's pods
    pub service_selector: String,

    /// Name of the local pod (the probe source)
    pub pod_name: String,

    /// Pause between iterations
    pub test_interval: Duration,

    /// Port the peers serve `/ping` and `/data` on
    pub peer_port: u16,

    /// Configured `/data` payload size in bytes
    pub data_size: u64,

    /// Sequential requests per latency probe
    pub ping_rounds: u32,

    /// Maximum in-flight probe tasks per destination pod
    pub max_inflight_per_peer: usize,

    /// Drop series of pods that left the peer set
    pub expire_absent_peers: bool,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            service_selector: "app=kube-latency".to_string(),
            pod_name: String::new(),
            test_interval: Duration::from_secs(10),
            peer_port: 8080,
            data_size: 16 * 1024 * 1024,
            ping_rounds: 10,
            max_inflight_per_peer: 4,
            expire_absent_peers: false,
        }
    }
}

// =============================================================================
// Iteration Outcome
// =============================================================================

/// Why an iteration launched no probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Listing the peer set failed
    ResolveFailed,
    /// The local pod is not part of the current listing
    SourceMissing,
    /// The local pod has nobody to probe
    NoDestinations,
}

/// Probe tasks launched by one iteration.
#[derive(Debug)]
pub struct Dispatch {
    pub pairings: Vec<ProbePairing>,
    /// Detached probe tasks; dropping them does not cancel anything
    pub tasks: Vec<JoinHandle<()>>,
    /// Probe tasks not started because their peer was at its in-flight cap
    pub throttled: usize,
}

impl Dispatch {
    /// Wait for every launched probe task to finish.
    pub async fn join(self) {
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                warn!("Probe task failed: {}", e);
            }
        }
    }
}

/// Outcome of one campaign iteration.
#[derive(Debug)]
pub enum Iteration {
    Skipped(SkipReason),
    Dispatched(Dispatch),
}

// =============================================================================
// Campaign
// =============================================================================

/// Periodically probes every peer of the local pod.
pub struct Campaign {
    config: CampaignConfig,
    resolver: PeerResolver,
    prober: Arc<dyn Prober>,
    metrics: Arc<ProbeMetrics>,
    inflight: DashMap<String, Arc<Semaphore>>,
}

impl Campaign {
    pub fn new(
        config: CampaignConfig,
        registry: Arc<dyn PeerRegistry>,
        prober: Arc<dyn Prober>,
        metrics: Arc<ProbeMetrics>,
    ) -> Self {
        Self {
            config,
            resolver: PeerResolver::new(registry),
            prober,
            metrics,
            inflight: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CampaignConfig {
        &self.config
    }

    pub fn resolver(&self) -> &PeerResolver {
        &self.resolver
    }

    /// Run iterations until `shutdown` fires. In-flight probes are left to
    /// finish on their own.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Starting measurement campaign for pod {} (selector '{}', every {:?})",
            self.config.pod_name, self.config.service_selector, self.config.test_interval
        );

        loop {
            if let Iteration::Dispatched(dispatch) = self.run_iteration().await {
                debug!(
                    pairings = dispatch.pairings.len(),
                    tasks = dispatch.tasks.len(),
                    throttled = dispatch.throttled,
                    "Dispatched probes"
                );
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Measurement campaign shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.test_interval) => {}
            }
        }
    }

    /// Resolve, pair and fan out once.
    pub async fn run_iteration(&self) -> Iteration {
        let peers = match self
            .resolver
            .resolve_peers(&self.config.service_selector, &self.config.pod_name)
            .await
        {
            Ok(peers) => peers,
            Err(e) => {
                warn!(
                    "Failed to list pods with selector '{}': {}",
                    self.config.service_selector, e
                );
                return Iteration::Skipped(SkipReason::ResolveFailed);
            }
        };

        if peers.source.is_some() {
            self.forget_absent_peers(&peers);
        }

        let reason = match (&peers.source, peers.destinations.is_empty()) {
            (None, _) => Some(SkipReason::SourceMissing),
            (Some(_), true) => Some(SkipReason::NoDestinations),
            (Some(_), false) => None,
        };
        if let Some(reason) = reason {
            info!("Skip tests, no suitable pods found ({:?})", reason);
            return Iteration::Skipped(reason);
        }

        Iteration::Dispatched(self.dispatch(peers.pairings()))
    }

    fn dispatch(&self, pairings: Vec<ProbePairing>) -> Dispatch {
        let mut tasks = Vec::with_capacity(pairings.len() * 2);
        let mut throttled = 0;

        for pairing in &pairings {
            match self.permit(&pairing.destination.name) {
                Some(permit) => tasks.push(self.spawn_ping(pairing.clone(), permit)),
                None => throttled += 1,
            }
            match self.permit(&pairing.destination.name) {
                Some(permit) => tasks.push(self.spawn_download(pairing.clone(), permit)),
                None => throttled += 1,
            }
        }

        if throttled > 0 {
            warn!(
                throttled,
                "Skipped probes for peers at their in-flight limit of {}",
                self.config.max_inflight_per_peer
            );
        }

        Dispatch {
            pairings,
            tasks,
            throttled,
        }
    }

    fn spawn_ping(&self, pairing: ProbePairing, permit: OwnedSemaphorePermit) -> JoinHandle<()> {
        let prober = self.prober.clone();
        let metrics = self.metrics.clone();
        let url = pairing.destination.endpoint(self.config.peer_port, "/ping");
        let rounds = self.config.ping_rounds;

        tokio::spawn(async move {
            ping_peer(prober.as_ref(), &metrics, &pairing, &url, rounds).await;
            drop(permit);
        })
    }

    fn spawn_download(
        &self,
        pairing: ProbePairing,
        permit: OwnedSemaphorePermit,
    ) -> JoinHandle<()> {
        let prober = self.prober.clone();
        let metrics = self.metrics.clone();
        let url = pairing.destination.endpoint(self.config.peer_port, "/data");
        let data_size = self.config.data_size;

        tokio::spawn(async move {
            download_from_peer(prober.as_ref(), &metrics, &pairing, &url, data_size).await;
            drop(permit);
        })
    }

    fn permit(&self, destination: &str) -> Option<OwnedSemaphorePermit> {
        let semaphore = self
            .inflight
            .entry(destination.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_inflight_per_peer)))
            .clone();
        semaphore.try_acquire_owned().ok()
    }

    /// Drop per-peer bookkeeping, and series when enabled, for pods that
    /// are no longer listed.
    fn forget_absent_peers(&self, peers: &ResolvedPeers) {
        let names = peers.pod_names();
        self.inflight.retain(|name, _| names.contains(name));

        if self.config.expire_absent_peers {
            let removed = self.metrics.retain_peers(&peers.identities());
            if removed > 0 {
                info!("Expired {} series of peers that left the service", removed);
            }
        }
    }
}

impl std::fmt::Debug for Campaign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Campaign")
            .field("config", &self.config)
            .field("resolver", &self.resolver)
            .finish()
    }
}

// =============================================================================
// Probe Tasks
// =============================================================================

/// Run `rounds` sequential pings; returns the number of observations made.
pub async fn ping_peer(
    prober: &dyn Prober,
    metrics: &ProbeMetrics,
    pairing: &ProbePairing,
    url: &str,
    rounds: u32,
) -> u32 {
    let mut recorded = 0;

    for round in 1..=rounds {
        match prober.probe(url).await {
            Ok(result) => {
                metrics.observe_ping(pairing, result.content_transfer());
                recorded += 1;
            }
            Err(e) => warn!("Test ping from '{}' failed (round {}): {}", url, round, e),
        }
    }

    recorded
}

/// Download the payload once; returns whether a duration was observed.
///
/// The size gauge receives the configured size even when the download
/// fails.
pub async fn download_from_peer(
    prober: &dyn Prober,
    metrics: &ProbeMetrics,
    pairing: &ProbePairing,
    url: &str,
    data_size: u64,
) -> bool {
    let observed = match prober.probe(url).await {
        Ok(result) => {
            metrics.observe_download(pairing, result.content_transfer());
            true
        }
        Err(e) => {
            warn!("Test download from '{}' failed: {}", url, e);
            false
        }
    };

    metrics.set_download_probe_size(pairing, data_size);
    observed
}
