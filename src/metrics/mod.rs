//! Metrics module
//!
//! Aggregates probe outcomes into Prometheus instruments.

mod probe_metrics;
mod summary;

pub use probe_metrics::{ProbeMetrics, DOWNLOAD_DURATIONS, DOWNLOAD_PROBE_SIZE, PING_DURATIONS};
pub use summary::{SummaryOpts, SummaryVec};
