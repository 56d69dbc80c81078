//! Labeled Prometheus summary.
//!
//! The `prometheus` crate ships counters, gauges and histograms but no
//! summary, so this module provides a `SummaryVec` collector: quantiles are
//! computed from a sliding window of recent observations while `_sum` and
//! `_count` are cumulative, mirroring the reference Prometheus clients.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use prometheus::core::{Collector, Desc};
use prometheus::proto::{LabelPair, Metric, MetricFamily, MetricType, Quantile, Summary};

use crate::error::Result;

// =============================================================================
// Options
// =============================================================================

/// Options for a [`SummaryVec`]
#[derive(Debug, Clone)]
pub struct SummaryOpts {
    pub name: String,
    pub help: String,
    /// Quantiles to report, e.g. 0.5, 0.9, 0.99
    pub objectives: Vec<f64>,
    /// Observations older than this no longer affect quantiles
    pub max_age: Duration,
    /// Number of buckets the window is rotated through
    pub age_buckets: u32,
    /// Per-bucket sample cap; the oldest samples are dropped beyond it
    pub max_samples_per_bucket: usize,
}

impl SummaryOpts {
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            objectives: vec![0.5, 0.9, 0.99],
            max_age: Duration::from_secs(600),
            age_buckets: 5,
            max_samples_per_bucket: 2048,
        }
    }

    pub fn objectives(mut self, objectives: Vec<f64>) -> Self {
        self.objectives = objectives;
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    fn bucket_width(&self) -> Duration {
        self.max_age / self.age_buckets.max(1)
    }
}

// =============================================================================
// Series State
// =============================================================================

#[derive(Debug)]
struct AgeBucket {
    started: Instant,
    samples: VecDeque<f64>,
}

#[derive(Debug, Default)]
struct SeriesState {
    buckets: VecDeque<AgeBucket>,
    sum: f64,
    count: u64,
}

impl SeriesState {
    fn observe(&mut self, value: f64, now: Instant, opts: &SummaryOpts) {
        self.expire(now, opts.max_age);

        let rotate = self
            .buckets
            .back()
            .map_or(true, |b| now.duration_since(b.started) >= opts.bucket_width());
        if rotate {
            self.buckets.push_back(AgeBucket {
                started: now,
                samples: VecDeque::new(),
            });
        }

        if let Some(bucket) = self.buckets.back_mut() {
            if bucket.samples.len() >= opts.max_samples_per_bucket {
                bucket.samples.pop_front();
            }
            bucket.samples.push_back(value);
        }

        self.sum += value;
        self.count += 1;
    }

    fn expire(&mut self, now: Instant, max_age: Duration) {
        while self
            .buckets
            .front()
            .is_some_and(|b| now.duration_since(b.started) >= max_age)
        {
            self.buckets.pop_front();
        }
    }

    /// Nearest-rank quantiles over the window; NaN when it is empty.
    fn quantiles(&self, objectives: &[f64]) -> Vec<(f64, f64)> {
        let mut samples: Vec<f64> = self
            .buckets
            .iter()
            .flat_map(|b| b.samples.iter().copied())
            .collect();
        samples.sort_by(f64::total_cmp);

        objectives
            .iter()
            .map(|&q| {
                if samples.is_empty() {
                    return (q, f64::NAN);
                }
                let rank = (q * samples.len() as f64).ceil() as usize;
                let index = rank.clamp(1, samples.len()) - 1;
                (q, samples[index])
            })
            .collect()
    }
}

// =============================================================================
// SummaryVec
// =============================================================================

struct SummaryVecCore {
    desc: Desc,
    opts: SummaryOpts,
    series: DashMap<Vec<String>, Arc<Mutex<SeriesState>>>,
}

/// A summary partitioned by label values; cheap to clone.
#[derive(Clone)]
pub struct SummaryVec {
    core: Arc<SummaryVecCore>,
}

impl SummaryVec {
    pub fn new(opts: SummaryOpts, label_names: &[&str]) -> Result<Self> {
        let desc = Desc::new(
            opts.name.clone(),
            opts.help.clone(),
            label_names.iter().map(|s| s.to_string()).collect(),
            Default::default(),
        )?;

        Ok(Self {
            core: Arc::new(SummaryVecCore {
                desc,
                opts,
                series: DashMap::new(),
            }),
        })
    }

    /// Record one observation for the given label values.
    pub fn observe(&self, label_values: &[&str], value: f64) -> Result<()> {
        self.check_cardinality(label_values)?;

        let key: Vec<String> = label_values.iter().map(|s| s.to_string()).collect();
        let series = self
            .core
            .series
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(SeriesState::default())))
            .clone();

        series.lock().observe(value, Instant::now(), &self.core.opts);
        Ok(())
    }

    /// Drop the series for these label values; true if it existed.
    pub fn remove(&self, label_values: &[&str]) -> bool {
        let key: Vec<String> = label_values.iter().map(|s| s.to_string()).collect();
        self.core.series.remove(&key).is_some()
    }

    /// Cumulative observation count, `None` if the series does not exist.
    pub fn sample_count(&self, label_values: &[&str]) -> Option<u64> {
        self.with_series(label_values, |s| s.count)
    }

    /// Cumulative observation sum, `None` if the series does not exist.
    pub fn sample_sum(&self, label_values: &[&str]) -> Option<f64> {
        self.with_series(label_values, |s| s.sum)
    }

    /// Current quantile estimates for one series.
    pub fn quantiles(&self, label_values: &[&str]) -> Option<Vec<(f64, f64)>> {
        let objectives = &self.core.opts.objectives;
        self.with_series(label_values, |s| s.quantiles(objectives))
    }

    /// Number of live series.
    pub fn len(&self) -> usize {
        self.core.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.series.is_empty()
    }

    fn with_series<T>(&self, label_values: &[&str], f: impl FnOnce(&SeriesState) -> T) -> Option<T> {
        let key: Vec<String> = label_values.iter().map(|s| s.to_string()).collect();
        let series = self.core.series.get(&key).map(|s| s.value().clone())?;
        let state = series.lock();
        Some(f(&state))
    }

    fn check_cardinality(&self, label_values: &[&str]) -> Result<()> {
        let expect = self.core.desc.variable_labels.len();
        if label_values.len() != expect {
            return Err(prometheus::Error::InconsistentCardinality {
                expect,
                got: label_values.len(),
            }
            .into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for SummaryVec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryVec")
            .field("name", &self.core.opts.name)
            .field("series", &self.core.series.len())
            .finish()
    }
}

impl Collector for SummaryVec {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.core.desc]
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let desc = &self.core.desc;
        let opts = &self.core.opts;
        let now = Instant::now();

        let mut entries: Vec<(Vec<String>, Arc<Mutex<SeriesState>>)> = self
            .core
            .series
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        if entries.is_empty() {
            return Vec::new();
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut mf = MetricFamily::default();
        mf.set_name(desc.fq_name.clone());
        mf.set_help(desc.help.clone());
        mf.set_field_type(MetricType::SUMMARY);

        for (values, series) in entries {
            let mut state = series.lock();
            state.expire(now, opts.max_age);

            let mut summary = Summary::default();
            summary.set_sample_count(state.count);
            summary.set_sample_sum(state.sum);
            for (q, v) in state.quantiles(&opts.objectives) {
                let mut quantile = Quantile::default();
                quantile.set_quantile(q);
                quantile.set_value(v);
                summary.mut_quantile().push(quantile);
            }
            drop(state);

            let mut pairs: Vec<LabelPair> = desc
                .variable_labels
                .iter()
                .zip(values)
                .map(|(name, value)| {
                    let mut pair = LabelPair::default();
                    pair.set_name(name.clone());
                    pair.set_value(value);
                    pair
                })
                .collect();
            pairs.sort_by(|a, b| a.get_name().cmp(b.get_name()));

            let mut metric = Metric::default();
            for pair in pairs {
                metric.mut_label().push(pair);
            }
            metric.set_summary(summary);
            mf.mut_metric().push(metric);
        }

        vec![mf]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn opts() -> SummaryOpts {
        SummaryOpts::new("test_durations_s", "Test durations in seconds")
    }

    #[test]
    fn test_summary_opts_default() {
        let opts = opts();

        assert_eq!(opts.objectives, vec![0.5, 0.9, 0.99]);
        assert_eq!(opts.max_age, Duration::from_secs(600));
        assert_eq!(opts.age_buckets, 5);
        assert_eq!(opts.bucket_width(), Duration::from_secs(120));
    }

    #[test]
    fn test_observe_and_count() {
        let summary = SummaryVec::new(opts(), &["peer"]).unwrap();

        summary.observe(&["a"], 0.25).unwrap();
        summary.observe(&["a"], 0.75).unwrap();
        summary.observe(&["b"], 1.0).unwrap();

        assert_eq!(summary.sample_count(&["a"]), Some(2));
        assert_eq!(summary.sample_sum(&["a"]), Some(1.0));
        assert_eq!(summary.sample_count(&["b"]), Some(1));
        assert_eq!(summary.sample_count(&["c"]), None);
        assert_eq!(summary.len(), 2);
    }

    #[test]
    fn test_quantiles_nearest_rank() {
        let summary = SummaryVec::new(opts(), &["peer"]).unwrap();
        for i in 1..=100 {
            summary.observe(&["a"], i as f64).unwrap();
        }

        let quantiles = summary.quantiles(&["a"]).unwrap();
        assert_eq!(quantiles, vec![(0.5, 50.0), (0.9, 90.0), (0.99, 99.0)]);
    }

    #[test]
    fn test_custom_objectives() {
        let summary =
            SummaryVec::new(opts().objectives(vec![0.25, 0.75]), &["peer"]).unwrap();
        for i in 1..=4 {
            summary.observe(&["a"], i as f64).unwrap();
        }

        assert_eq!(
            summary.quantiles(&["a"]).unwrap(),
            vec![(0.25, 1.0), (0.75, 3.0)]
        );
    }

    #[test]
    fn test_single_observation_quantiles() {
        let summary = SummaryVec::new(opts(), &["peer"]).unwrap();
        summary.observe(&["a"], 0.042).unwrap();

        for (_, v) in summary.quantiles(&["a"]).unwrap() {
            assert_eq!(v, 0.042);
        }
    }

    #[test]
    fn test_window_expiry_keeps_cumulative_totals() {
        let summary =
            SummaryVec::new(opts().max_age(Duration::from_millis(50)), &["peer"]).unwrap();
        summary.observe(&["a"], 1.0).unwrap();

        std::thread::sleep(Duration::from_millis(80));
        let families = summary.collect();

        let s = families[0].get_metric()[0].get_summary();
        assert_eq!(s.get_sample_count(), 1);
        assert_eq!(s.get_sample_sum(), 1.0);
        assert!(s.get_quantile()[0].get_value().is_nan());
    }

    #[test]
    fn test_wrong_cardinality_is_rejected() {
        let summary = SummaryVec::new(opts(), &["source", "dest"]).unwrap();

        let result = summary.observe(&["only-one"], 1.0);

        assert!(matches!(result, Err(Error::Metrics(_))));
        assert!(summary.is_empty());
    }

    #[test]
    fn test_remove_series() {
        let summary = SummaryVec::new(opts(), &["peer"]).unwrap();
        summary.observe(&["a"], 1.0).unwrap();

        assert!(summary.remove(&["a"]));
        assert!(!summary.remove(&["a"]));
        assert!(summary.is_empty());
    }

    #[test]
    fn test_per_bucket_sample_cap() {
        let mut opts = opts();
        opts.max_samples_per_bucket = 4;
        let summary = SummaryVec::new(opts, &["peer"]).unwrap();

        for v in [100.0, 1.0, 2.0, 3.0, 4.0] {
            summary.observe(&["a"], v).unwrap();
        }

        // The oldest sample (100.0) fell out of the window
        let quantiles = summary.quantiles(&["a"]).unwrap();
        assert_eq!(quantiles[2], (0.99, 4.0));
        assert_eq!(summary.sample_count(&["a"]), Some(5));
    }

    #[test]
    fn test_collect_family_shape() {
        let summary = SummaryVec::new(opts(), &["peer"]).unwrap();
        summary.observe(&["b"], 2.0).unwrap();
        summary.observe(&["a"], 1.0).unwrap();

        let families = summary.collect();
        assert_eq!(families.len(), 1);

        let mf = &families[0];
        assert_eq!(mf.get_name(), "test_durations_s");
        assert_eq!(mf.get_field_type(), MetricType::SUMMARY);
        assert_eq!(mf.get_metric().len(), 2);

        let first = &mf.get_metric()[0];
        assert_eq!(first.get_label()[0].get_name(), "peer");
        assert_eq!(first.get_label()[0].get_value(), "a");
        assert_eq!(first.get_summary().get_quantile().len(), 3);
    }

    #[test]
    fn test_concurrent_observations() {
        let summary = SummaryVec::new(opts(), &["peer"]).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let summary = summary.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        summary.observe(&["a"], 0.001).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(summary.sample_count(&["a"]), Some(800));
    }
}
