//! Process-wide metric sinks.
//!
//! A single [`Registry`] is created per run and handed to every virtual user through a
//! [`Recorder`]. Sinks are created lazily on the first sample for a `(name, tags)` series
//! and are append-only until [`Registry::freeze`] is called at the start of the reporting
//! phase. Writes after that point are dropped.
//!
//! Counter and rate series are plain atomics. Trend series keep an HDR histogram behind
//! their own mutex, so contention is per series rather than per registry.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use hdrhistogram::Histogram;

use crate::metric::{MetricKind, Sample, Tags};

/// Trend values are recorded in microseconds to keep sub-millisecond resolution.
const TREND_SCALE: f64 = 1000.0;
const TREND_SIGFIGS: u8 = 3;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SeriesKey {
    name: String,
    tags: Tags,
}

#[derive(Debug)]
enum Cell {
    Counter(AtomicU64),
    Rate { hits: AtomicU64, total: AtomicU64 },
    Trend(Mutex<TrendData>),
}

impl Cell {
    fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Cell::Counter(AtomicU64::new(0)),
            MetricKind::Rate => Cell::Rate {
                hits: AtomicU64::new(0),
                total: AtomicU64::new(0),
            },
            MetricKind::Trend => Cell::Trend(Mutex::new(TrendData::new())),
        }
    }

    fn kind(&self) -> MetricKind {
        match self {
            Cell::Counter(_) => MetricKind::Counter,
            Cell::Rate { .. } => MetricKind::Rate,
            Cell::Trend(_) => MetricKind::Trend,
        }
    }

    fn add(&self, value: f64, times: u64) {
        match self {
            Cell::Counter(sum) => {
                sum.fetch_add(value.max(0.0) as u64 * times, Ordering::Relaxed);
            }
            Cell::Rate { hits, total } => {
                if value != 0.0 {
                    hits.fetch_add(times, Ordering::Relaxed);
                }
                total.fetch_add(times, Ordering::Relaxed);
            }
            Cell::Trend(data) => {
                let mut data = data.lock().unwrap_or_else(|e| e.into_inner());
                for _ in 0..times {
                    data.record(value);
                }
            }
        }
    }

    fn snapshot(&self) -> SinkData {
        match self {
            Cell::Counter(sum) => SinkData::Counter {
                sum: sum.load(Ordering::Relaxed),
            },
            Cell::Rate { hits, total } => SinkData::Rate {
                hits: hits.load(Ordering::Relaxed),
                total: total.load(Ordering::Relaxed),
            },
            Cell::Trend(data) => {
                SinkData::Trend(data.lock().unwrap_or_else(|e| e.into_inner()).clone())
            }
        }
    }
}

/// Mergeable raw data behind a trend sink.
#[derive(Clone, Debug)]
pub struct TrendData {
    histogram: Histogram<u64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl TrendData {
    fn new() -> Self {
        Self {
            // auto-resizing, so recording never fails on large values
            histogram: Histogram::new(TREND_SIGFIGS)
                .expect("3 significant figures is a valid histogram precision"),
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn record(&mut self, value: f64) {
        let value = value.max(0.0);
        self.histogram
            .saturating_record((value * TREND_SCALE).round() as u64);
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn merge(&mut self, other: &TrendData) {
        if let Err(e) = self.histogram.add(&other.histogram) {
            tracing::warn!("Dropped {} trend samples while merging: {e}", other.count);
        }
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    /// `percentile` is in `[0, 100]`.
    pub fn percentile(&self, percentile: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let q = (percentile / 100.0).clamp(0.0, 1.0);
        Some(self.histogram.value_at_quantile(q) as f64 / TREND_SCALE)
    }
}

/// Point-in-time contents of a sink, or of several series merged together.
#[derive(Clone, Debug)]
pub enum SinkData {
    Counter { sum: u64 },
    Rate { hits: u64, total: u64 },
    Trend(TrendData),
}

impl SinkData {
    pub fn kind(&self) -> MetricKind {
        match self {
            SinkData::Counter { .. } => MetricKind::Counter,
            SinkData::Rate { .. } => MetricKind::Rate,
            SinkData::Trend(_) => MetricKind::Trend,
        }
    }

    /// Folds `other` into `self`. Series of different kinds are left untouched.
    pub fn merge(&mut self, other: &SinkData) {
        match (self, other) {
            (SinkData::Counter { sum }, SinkData::Counter { sum: o }) => *sum += o,
            (SinkData::Rate { hits, total }, SinkData::Rate { hits: h, total: t }) => {
                *hits += h;
                *total += t;
            }
            (SinkData::Trend(a), SinkData::Trend(b)) => a.merge(b),
            (this, other) => {
                tracing::warn!(
                    "Refusing to merge a {} series into a {} series",
                    other.kind(),
                    this.kind()
                );
            }
        }
    }

    /// Fraction of `true` observations, if any were made.
    pub fn rate(&self) -> Option<f64> {
        match self {
            SinkData::Rate { hits, total } if *total > 0 => Some(*hits as f64 / *total as f64),
            _ => None,
        }
    }

    /// Counter sum, rate observations or trend sample count.
    pub fn count(&self) -> u64 {
        match self {
            SinkData::Counter { sum } => *sum,
            SinkData::Rate { total, .. } => *total,
            SinkData::Trend(t) => t.count(),
        }
    }

    pub fn trend(&self) -> Option<&TrendData> {
        match self {
            SinkData::Trend(t) => Some(t),
            _ => None,
        }
    }
}

/// One `(name, tags)` series as captured by [`Registry::snapshot`].
#[derive(Clone, Debug)]
pub struct SeriesSnapshot {
    pub name: String,
    pub tags: Tags,
    pub data: SinkData,
}

#[derive(Clone, Debug, Default)]
pub struct MetricsSnapshot {
    pub series: Vec<SeriesSnapshot>,
}

impl MetricsSnapshot {
    /// Sink names in lexical order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.series.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// All series of `name` merged together, regardless of tags.
    pub fn sink(&self, name: &str) -> Option<SinkData> {
        self.sink_where(name, |_| true)
    }

    /// Series of `name` whose tags satisfy `filter`, merged together.
    pub fn sink_where(&self, name: &str, filter: impl Fn(&Tags) -> bool) -> Option<SinkData> {
        let mut merged: Option<SinkData> = None;
        for series in self
            .series
            .iter()
            .filter(|s| s.name == name && filter(&s.tags))
        {
            match merged.as_mut() {
                Some(m) => m.merge(&series.data),
                None => merged = Some(series.data.clone()),
            }
        }
        merged
    }

    pub fn series_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a SeriesSnapshot> {
        self.series.iter().filter(move |s| s.name == name)
    }
}

/// The run's shared metric store.
#[derive(Debug, Default)]
pub struct Registry {
    series: DashMap<SeriesKey, Arc<Cell>>,
    frozen: AtomicBool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, sample: &Sample) {
        self.record_times(sample, 1);
    }

    /// Records the same sample `times` times.
    pub fn record_times(&self, sample: &Sample, times: u64) {
        if times == 0 {
            return;
        }
        if self.frozen.load(Ordering::Acquire) {
            tracing::debug!("Dropping sample for {} after freeze", sample.name);
            return;
        }

        let key = SeriesKey {
            name: sample.name.clone(),
            tags: sample.tags.clone(),
        };
        let cell = match self.series.get(&key) {
            Some(cell) => Arc::clone(cell.value()),
            None => Arc::clone(
                self.series
                    .entry(key)
                    .or_insert_with(|| Arc::new(Cell::new(sample.kind)))
                    .value(),
            ),
        };

        if cell.kind() != sample.kind {
            tracing::warn!(
                "Sink {} is a {}, dropping {} sample",
                sample.name,
                cell.kind(),
                sample.kind
            );
            return;
        }
        cell.add(sample.value, times);
    }

    /// Stops accepting samples. Called once the reporting phase begins.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut series: Vec<SeriesSnapshot> = self
            .series
            .iter()
            .map(|entry| SeriesSnapshot {
                name: entry.key().name.clone(),
                tags: entry.key().tags.clone(),
                data: entry.value().snapshot(),
            })
            .collect();
        series.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.tags.cmp(&b.tags)));
        MetricsSnapshot { series }
    }
}

/// Handle given to protocols: a shared [`Registry`] plus the tags of the emitting scenario.
#[derive(Clone, Debug)]
pub struct Recorder {
    registry: Arc<Registry>,
    tags: Arc<Tags>,
}

impl Recorder {
    pub fn new(registry: Arc<Registry>, tags: Tags) -> Self {
        Self {
            registry,
            tags: Arc::new(tags),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    fn tags_with(&self, extra: &[(&str, &str)]) -> Tags {
        let mut tags = (*self.tags).clone();
        for (k, v) in extra {
            tags.insert((*k).to_string(), (*v).to_string());
        }
        tags
    }

    pub fn count(&self, name: &str, value: u64) {
        self.count_tagged(name, value, &[]);
    }

    pub fn count_tagged(&self, name: &str, value: u64, extra: &[(&str, &str)]) {
        self.registry
            .record(&Sample::counter(name, value, self.tags_with(extra)));
    }

    pub fn rate(&self, name: &str, observed: bool) {
        self.rate_n(name, observed, 1);
    }

    pub fn rate_n(&self, name: &str, observed: bool, times: u64) {
        self.registry
            .record_times(&Sample::rate(name, observed, self.tags_with(&[])), times);
    }

    pub fn rate_tagged(&self, name: &str, observed: bool, extra: &[(&str, &str)]) {
        self.registry
            .record(&Sample::rate(name, observed, self.tags_with(extra)));
    }

    pub fn trend(&self, name: &str, elapsed: Duration) {
        self.trend_ms(name, elapsed.as_secs_f64() * 1000.0);
    }

    pub fn trend_ms(&self, name: &str, millis: f64) {
        self.registry
            .record(&Sample::trend(name, millis, self.tags_with(&[])));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn sinks_are_created_lazily() {
        let registry = Registry::new();
        assert!(registry.snapshot().series.is_empty());

        registry.record(&Sample::counter("hits", 2, Tags::new()));
        registry.record(&Sample::counter("hits", 3, Tags::new()));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.series.len(), 1);
        assert_eq!(snapshot.sink("hits").unwrap().count(), 5);
    }

    #[test]
    fn series_are_split_by_tags_and_merged_by_name() {
        let registry = Registry::new();
        registry.record(&Sample::rate("ok", true, tags(&[("scenario", "a")])));
        registry.record(&Sample::rate("ok", false, tags(&[("scenario", "b")])));
        registry.record(&Sample::rate("ok", true, tags(&[("scenario", "b")])));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.series_of("ok").count(), 2);
        let merged = snapshot.sink("ok").unwrap();
        assert_eq!(merged.count(), 3);
        assert!((merged.rate().unwrap() - 2.0 / 3.0).abs() < 1e-9);

        let only_b = snapshot
            .sink_where("ok", |t| t.get("scenario").map(String::as_str) == Some("b"))
            .unwrap();
        assert_eq!(only_b.rate(), Some(0.5));
    }

    #[test]
    fn kind_mismatch_is_dropped() {
        let registry = Registry::new();
        registry.record(&Sample::counter("x", 1, Tags::new()));
        registry.record(&Sample::rate("x", true, Tags::new()));

        let data = registry.snapshot().sink("x").unwrap();
        assert_eq!(data.kind(), MetricKind::Counter);
        assert_eq!(data.count(), 1);
    }

    #[test]
    fn trend_statistics() {
        let registry = Registry::new();
        for ms in 1..=100 {
            registry.record(&Sample::trend("latency", ms as f64, Tags::new()));
        }
        let data = registry.snapshot().sink("latency").unwrap();
        let trend = data.trend().unwrap();

        assert_eq!(trend.count(), 100);
        assert_eq!(trend.min(), Some(1.0));
        assert_eq!(trend.max(), Some(100.0));
        assert!((trend.mean().unwrap() - 50.5).abs() < 1e-9);
        let p95 = trend.percentile(95.0).unwrap();
        assert!((94.0..=96.0).contains(&p95), "p95 was {p95}");
    }

    #[test]
    fn merged_trends_keep_every_sample() {
        let registry = Registry::new();
        for ms in [1.0, 2.0, 3.0] {
            registry.record(&Sample::trend("wait", ms, tags(&[("scenario", "a")])));
        }
        // far outside the other series' range, so the merge has to grow the histogram
        registry.record(&Sample::trend("wait", 3_600_000.0, tags(&[("scenario", "b")])));

        let data = registry.snapshot().sink("wait").unwrap();
        let trend = data.trend().unwrap();
        assert_eq!(trend.count(), 4);
        assert_eq!(trend.max(), Some(3_600_000.0));
        let p100 = trend.percentile(100.0).unwrap();
        assert!((p100 - 3_600_000.0).abs() / 3_600_000.0 < 0.01, "p100 was {p100}");
        assert!(trend.percentile(50.0).unwrap() <= 3.0);
    }

    #[test]
    fn empty_trend_has_no_statistics() {
        let trend = TrendData::new();
        assert_eq!(trend.mean(), None);
        assert_eq!(trend.percentile(50.0), None);
    }

    #[test]
    fn frozen_registry_drops_writes() {
        let registry = Registry::new();
        registry.record(&Sample::counter("c", 1, Tags::new()));
        registry.freeze();
        registry.record(&Sample::counter("c", 1, Tags::new()));

        assert!(registry.is_frozen());
        assert_eq!(registry.snapshot().sink("c").unwrap().count(), 1);
    }

    #[test]
    fn recorder_attaches_scenario_tags() {
        let registry = Arc::new(Registry::new());
        let recorder = Recorder::new(Arc::clone(&registry), tags(&[("scenario", "s1")]));
        recorder.count_tagged("issued", 1, &[("code", "C")]);

        let snapshot = registry.snapshot();
        let series = snapshot.series_of("issued").next().unwrap();
        assert_eq!(series.tags, tags(&[("scenario", "s1"), ("code", "C")]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_writes_are_not_lost() {
        let registry = Arc::new(Registry::new());
        let recorder = Recorder::new(Arc::clone(&registry), Tags::new());

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let recorder = recorder.clone();
                tokio::spawn(async move {
                    for j in 0..500 {
                        recorder.count("c", 1);
                        recorder.rate("r", j % 2 == 0);
                        recorder.trend_ms("t", (i * j) as f64);
                    }
                })
            })
            .collect();
        for handle in futures::future::join_all(handles).await {
            handle.unwrap();
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.sink("c").unwrap().count(), 64 * 500);
        assert_eq!(snapshot.sink("r").unwrap().rate(), Some(0.5));
        assert_eq!(snapshot.sink("t").unwrap().count(), 64 * 500);
    }
}
