//! kube-latency
//!
//! Pod-to-pod latency and throughput prober for the pods of one Kubernetes
//! service.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          kube-latency                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  Discovery   │───▶│   Campaign   │───▶│    Probes    │       │
//! │  │ (pods/zones) │    │    (loop)    │    │ (ping/data)  │       │
//! │  └──────────────┘    └──────────────┘    └──────┬───────┘       │
//! │                                                 ▼               │
//! │                      ┌──────────────┐    ┌──────────────┐       │
//! │                      │ HTTP server  │◀───│   Metrics    │       │
//! │                      └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::builder::RangedU64ValueParser;
use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kube_latency::adapters::{HttpProber, KubernetesRegistry, ProbeConfig};
use kube_latency::server::parse_listen_address;
use kube_latency::{Campaign, CampaignConfig, ProbeMetrics, ProbeServer, ServerConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// kube-latency - measure network latency and throughput between service pods
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The address to listen on for HTTP requests
    #[arg(long, env = "LISTEN_ADDRESS", default_value = "0.0.0.0:8080")]
    listen_address: String,

    /// The name of the clusterIP-less Kubernetes service whose pods are probed
    #[arg(long, env = "SERVICE_NAME", default_value = "kube-latency")]
    service_name: String,

    /// The size in bytes of the data call
    #[arg(long, env = "DATA_SIZE", default_value_t = 16 * 1024 * 1024)]
    data_size: usize,

    /// How often tests are performed, in seconds
    #[arg(
        long,
        env = "TEST_FREQUENCY",
        default_value = "10",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    test_frequency: u64,

    /// Port peers serve /ping and /data on
    #[arg(long, env = "PEER_PORT", default_value = "8080")]
    peer_port: u16,

    /// Deadline for a single probe request, in seconds
    #[arg(long, env = "PROBE_TIMEOUT_SECONDS", default_value = "30")]
    probe_timeout_seconds: u64,

    /// Maximum in-flight probe tasks against one peer
    #[arg(
        long,
        env = "MAX_INFLIGHT_PER_PEER",
        default_value = "4",
        value_parser = RangedU64ValueParser::<usize>::new().range(1..)
    )]
    max_inflight_per_peer: usize,

    /// Remove series of pods that left the service
    #[arg(long, env = "EXPIRE_ABSENT_PEERS")]
    expire_absent_peers: bool,

    /// Namespace of this pod and the probed service
    #[arg(long, env = "KUBE_NAMESPACE")]
    kube_namespace: String,

    /// Name of this pod
    #[arg(long, env = "KUBE_POD_NAME")]
    kube_pod_name: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting kube-latency v{}", kube_latency::version());
    info!("  Namespace: {}", args.kube_namespace);
    info!("  Pod: {}", args.kube_pod_name);
    info!("  Service: {}", args.service_name);
    info!("  Data size: {} bytes", args.data_size);
    info!("  Test frequency: {}s", args.test_frequency);
    info!("  Probe timeout: {}s", args.probe_timeout_seconds);

    let listen_address = parse_listen_address(&args.listen_address)?;

    // Create Kubernetes client
    let client = Client::try_default()
        .await
        .context("Kubernetes client creation failed")?;

    info!("Connected to Kubernetes cluster");

    let registry = Arc::new(KubernetesRegistry::new(client, &args.kube_namespace));

    // Resolve the pods to probe from our own service
    let service_selector = registry
        .service_selector(&args.service_name)
        .await
        .with_context(|| {
            format!(
                "failed to get my service {}/{}",
                registry.namespace(),
                args.service_name
            )
        })?;

    info!("Probing pods matching '{}'", service_selector);

    let metrics = Arc::new(ProbeMetrics::new()?);

    let prober = Arc::new(HttpProber::new(ProbeConfig {
        timeout: Duration::from_secs(args.probe_timeout_seconds),
    }));

    let campaign_config = CampaignConfig {
        service_selector,
        pod_name: args.kube_pod_name.clone(),
        test_interval: Duration::from_secs(args.test_frequency),
        peer_port: args.peer_port,
        data_size: args.data_size as u64,
        max_inflight_per_peer: args.max_inflight_per_peer,
        expire_absent_peers: args.expire_absent_peers,
        ..Default::default()
    };
    let campaign = Arc::new(Campaign::new(
        campaign_config,
        registry,
        prober,
        metrics.clone(),
    ));

    let server = Arc::new(ProbeServer::new(
        ServerConfig {
            listen_address,
            data_size: args.data_size,
        },
        metrics,
    ));
    let listener = server.bind().await?;

    let shutdown = CancellationToken::new();

    // Start periodic tests
    tokio::spawn(campaign.run(shutdown.clone()));

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Received shutdown signal");
        signal_token.cancel();
    });

    server.serve(listener, shutdown).await?;

    info!("kube-latency shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Shutdown
// =============================================================================

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
