//! Rolling metric aggregation, grounded in `Metrics.h`/`SyscallMetrics.cpp`/
//! `SystemMetrics.cpp`. We keep the counters (cheap atomics the Accumulator
//! and Output loop update) but do not build the JSON/syslog reporting
//! surface that consumes them — that surface is one of the "specific output
//! formats" spec.md §1 excludes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A snapshot of one metric's aggregate over the last completed period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricAggregateSnapshot {
    pub start: Instant,
    pub sample_period: Duration,
    pub num_samples: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

/// A single named counter, bucketed into fixed-width samples within a
/// rolling aggregation window (e.g. per-second samples rolled up once per
/// minute).
struct MetricData {
    start: Instant,
    sample_period: Duration,
    agg_period: Duration,
    counts: Vec<f64>,
}

impl MetricData {
    fn new(start: Instant, sample_period: Duration, agg_period: Duration) -> Self {
        let num_samples = (agg_period.as_millis() / sample_period.as_millis().max(1)).max(1) as usize;
        MetricData {
            start,
            sample_period,
            agg_period,
            counts: vec![0.0; num_samples],
        }
    }

    fn idx_for(&self, now: Instant) -> usize {
        let elapsed = now.saturating_duration_since(self.start).as_millis();
        let period = self.sample_period.as_millis().max(1);
        ((elapsed / period) as usize).min(self.counts.len() - 1)
    }
}

pub struct Metric {
    sample_period: Duration,
    agg_period: Duration,
    inner: Mutex<MetricData>,
}

impl Metric {
    pub fn new(sample_period: Duration, agg_period: Duration) -> Self {
        let now = Instant::now();
        Metric {
            sample_period,
            agg_period,
            inner: Mutex::new(MetricData::new(now, sample_period, agg_period)),
        }
    }

    pub fn add(&self, count: f64) {
        let mut data = self.inner.lock().unwrap();
        let idx = data.idx_for(Instant::now());
        data.counts[idx] += count;
    }

    pub fn set(&self, count: f64) {
        let mut data = self.inner.lock().unwrap();
        let idx = data.idx_for(Instant::now());
        data.counts[idx] = count;
    }

    /// Rolls the current window if it has elapsed and returns its snapshot.
    pub fn snapshot_if_elapsed(&self) -> Option<MetricAggregateSnapshot> {
        let mut data = self.inner.lock().unwrap();
        let now = Instant::now();
        if now.saturating_duration_since(data.start) < data.agg_period {
            return None;
        }

        let snapshot = summarize(&data);

        let sample_period = data.sample_period;
        let agg_period = data.agg_period;
        *data = MetricData::new(now, sample_period, agg_period);
        Some(snapshot)
    }
}

fn summarize(data: &MetricData) -> MetricAggregateSnapshot {
    let n = data.counts.len().max(1) as f64;
    let (mut min, mut max, mut total) = (f64::MAX, f64::MIN, 0.0);
    for &c in &data.counts {
        min = min.min(c);
        max = max.max(c);
        total += c / n;
    }
    MetricAggregateSnapshot {
        start: data.start,
        sample_period: data.sample_period,
        num_samples: data.counts.len(),
        min,
        max,
        avg: total,
    }
}

/// Process-wide registry of named counters, keyed the way the original keys
/// metrics by `(namespace, name)`.
#[derive(Default)]
pub struct Metrics {
    counters: Mutex<HashMap<(String, String), std::sync::Arc<Metric>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn counter(
        &self,
        namespace: &str,
        name: &str,
        sample_period: Duration,
        agg_period: Duration,
    ) -> std::sync::Arc<Metric> {
        let mut counters = self.counters.lock().unwrap();
        counters
            .entry((namespace.to_string(), name.to_string()))
            .or_insert_with(|| std::sync::Arc::new(Metric::new(sample_period, agg_period)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_accumulates_within_a_sample_bucket() {
        let metric = Metric::new(Duration::from_secs(1), Duration::from_secs(10));
        metric.add(1.0);
        metric.add(2.0);
        // still within the same aggregation window
        assert!(metric.snapshot_if_elapsed().is_none());
    }

    #[test]
    fn registry_returns_the_same_counter_for_the_same_key() {
        let metrics = Metrics::new();
        let a = metrics.counter("auoms", "events_total", Duration::from_secs(1), Duration::from_secs(60));
        let b = metrics.counter("auoms", "events_total", Duration::from_secs(1), Duration::from_secs(60));
        assert!(std::sync::Arc::ptr_eq(&a, &b));
    }
}
