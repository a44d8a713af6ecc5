use std::{collections::BTreeMap, fmt, time::Duration};

use async_trait::async_trait;
use couponstorm_macros::report;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    metric::{MetricKind, Tags},
    metrics::{MetricsSnapshot, SinkData, TrendData},
    outcome::ProtocolOutcome,
    scheduler::ScenarioOutcome,
    threshold::{Threshold, ThresholdResult},
};

/// A [`Report`] is the processed, side-effect free form of a run's raw data.
///
/// Reports are pure data: they derive everything they show from the metric snapshot and
/// the scenario tallies, and can be serialized and handed to any [`Reporter`].
///
/// The `#[report]` attribute adds the required derives and this marker impl.
pub trait Report: Serialize + DeserializeOwned + fmt::Debug + Send + Sync {}

/// A [`Reporter`] consumes a [`Report`] and performs side effects: displaying it,
/// writing it to a file, or sending it to a service.
#[async_trait]
pub trait Reporter<R: Report> {
    async fn report(&self, report: &R) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

#[report]
pub struct TrendSummary {
    pub avg: f64,
    pub min: f64,
    pub med: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

impl TrendSummary {
    fn from_trend(trend: &TrendData) -> Option<Self> {
        Some(Self {
            avg: trend.mean()?,
            min: trend.min()?,
            med: trend.percentile(50.0)?,
            p90: trend.percentile(90.0)?,
            p95: trend.percentile(95.0)?,
            p99: trend.percentile(99.0)?,
            max: trend.max()?,
        })
    }
}

/// Statistics of one sink, or of one tagged series of it.
#[report]
pub struct SeriesSummary {
    pub count: u64,
    pub rate: Option<f64>,
    pub trend: Option<TrendSummary>,
}

impl From<&SinkData> for SeriesSummary {
    fn from(data: &SinkData) -> Self {
        Self {
            count: data.count(),
            rate: data.rate(),
            trend: data.trend().and_then(TrendSummary::from_trend),
        }
    }
}

#[report]
pub struct TaggedSeries {
    pub tags: Tags,
    #[serde(flatten)]
    pub stats: SeriesSummary,
}

#[report]
pub struct MetricSummary {
    pub name: String,
    pub kind: MetricKind,
    #[serde(flatten)]
    pub total: SeriesSummary,
    pub by_tags: Vec<TaggedSeries>,
}

#[report]
pub struct ScenarioSummary {
    pub name: String,
    pub executor: String,
    pub strategy: String,
    pub vus: u64,
    pub iterations: u64,
    pub cancelled: u64,
    pub failed: u64,
    pub failure_rate: Option<f64>,
    pub attempts: u64,
    pub polls: u64,
    pub outcomes: BTreeMap<ProtocolOutcome, u64>,
    #[serde(with = "humantime_serde")]
    pub started_after: Duration,
    #[serde(with = "humantime_serde")]
    pub ran_for: Duration,
}

impl From<&ScenarioOutcome> for ScenarioSummary {
    fn from(outcome: &ScenarioOutcome) -> Self {
        let tally = &outcome.tally;
        Self {
            name: outcome.name.clone(),
            executor: outcome.executor.clone(),
            strategy: outcome.strategy.clone(),
            vus: tally.vus,
            iterations: tally.completed(),
            cancelled: tally.get(ProtocolOutcome::Cancelled),
            failed: tally.failed(),
            failure_rate: tally.failure_rate(),
            attempts: tally.attempts,
            polls: tally.polls,
            outcomes: tally.outcomes.clone(),
            started_after: outcome.started_after,
            ran_for: outcome.ran_for,
        }
    }
}

/// Whether the issuance a coupon code saw stayed within its policy's supply.
#[report]
pub struct SupplyCheck {
    pub code: String,
    pub max_count: u64,
    /// Issuances observed by the clients during the run.
    pub observed: u64,
    /// `issuedCount` as reported by the service at teardown, when it answered.
    pub reported: Option<u64>,
    pub conserved: bool,
}

impl SupplyCheck {
    pub fn new(code: impl Into<String>, max_count: u64, observed: u64, reported: Option<u64>) -> Self {
        let conserved = observed <= max_count && reported.is_none_or(|r| r <= max_count);
        Self {
            code: code.into(),
            max_count,
            observed,
            reported,
            conserved,
        }
    }
}

/// Everything a finished run has to say.
#[report]
pub struct Summary {
    pub passed: bool,
    pub scenarios: Vec<ScenarioSummary>,
    pub metrics: Vec<MetricSummary>,
    pub thresholds: Vec<ThresholdResult>,
    pub supply: Vec<SupplyCheck>,
}

impl Summary {
    pub fn build(
        outcomes: &[ScenarioOutcome],
        snapshot: &MetricsSnapshot,
        thresholds: &[Threshold],
        supply: Vec<SupplyCheck>,
    ) -> Self {
        let metrics = snapshot
            .names()
            .into_iter()
            .filter_map(|name| {
                let total = snapshot.sink(name)?;
                let by_tags = snapshot
                    .series_of(name)
                    .map(|series| TaggedSeries {
                        tags: series.tags.clone(),
                        stats: SeriesSummary::from(&series.data),
                    })
                    .collect();
                Some(MetricSummary {
                    name: name.to_string(),
                    kind: total.kind(),
                    total: SeriesSummary::from(&total),
                    by_tags,
                })
            })
            .collect();

        let thresholds: Vec<ThresholdResult> =
            thresholds.iter().map(|t| t.evaluate(snapshot)).collect();
        let passed = thresholds.iter().all(|t| t.passed) && supply.iter().all(|s| s.conserved);

        Self {
            passed,
            scenarios: outcomes.iter().map(ScenarioSummary::from).collect(),
            metrics,
            thresholds,
            supply,
        }
    }

    pub fn failed_thresholds(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.thresholds.iter().filter(|t| !t.passed)
    }

    pub fn metric(&self, name: &str) -> Option<&MetricSummary> {
        self.metrics.iter().find(|m| m.name == name)
    }
}

fn fmt_tags(tags: &Tags) -> String {
    let pairs: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{{{}}}", pairs.join(", "))
}

impl fmt::Display for SeriesSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(t) = &self.trend {
            write!(
                f,
                "avg={:.2}ms min={:.2}ms med={:.2}ms p(90)={:.2}ms p(95)={:.2}ms p(99)={:.2}ms max={:.2}ms count={}",
                t.avg, t.min, t.med, t.p90, t.p95, t.p99, t.max, self.count
            )
        } else if let Some(rate) = self.rate {
            write!(f, "{:.2}% of {}", rate * 100.0, self.count)
        } else {
            write!(f, "{}", self.count)
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "scenarios:")?;
        for s in &self.scenarios {
            writeln!(
                f,
                "  {} ({} / {}): {} iterations, {} cancelled, {} failed, {} VUs, ran {:?} after {:?}",
                s.name,
                s.executor,
                s.strategy,
                s.iterations,
                s.cancelled,
                s.failed,
                s.vus,
                s.ran_for,
                s.started_after
            )?;
            for (outcome, n) in &s.outcomes {
                writeln!(f, "      {:<14} {n}", outcome.as_str())?;
            }
        }

        writeln!(f, "\nmetrics:")?;
        for m in &self.metrics {
            writeln!(f, "  {:.<40}: {}", m.name, m.total)?;
            if m.by_tags.len() > 1 {
                for series in &m.by_tags {
                    writeln!(f, "      {}: {}", fmt_tags(&series.tags), series.stats)?;
                }
            }
        }

        if !self.thresholds.is_empty() {
            writeln!(f, "\nthresholds:")?;
            for t in &self.thresholds {
                let mark = if t.passed { "ok  " } else { "FAIL" };
                match t.observed {
                    Some(v) => writeln!(f, "  {mark} {} {} (observed {v:.3})", t.metric, t.expr)?,
                    None => writeln!(f, "  {mark} {} {} (no samples)", t.metric, t.expr)?,
                }
            }
        }

        if !self.supply.is_empty() {
            writeln!(f, "\nsupply:")?;
            for s in &self.supply {
                let mark = if s.conserved { "ok  " } else { "FAIL" };
                let reported = s
                    .reported
                    .map_or_else(|| "unknown".to_string(), |r| r.to_string());
                writeln!(
                    f,
                    "  {mark} {}: observed {}, reported {reported}, max {}",
                    s.code, s.observed, s.max_count
                )?;
            }
        }

        write!(f, "\n{}", if self.passed { "PASSED" } else { "FAILED" })
    }
}

/// Prints the human-readable summary.
pub struct StdoutReporter;

#[async_trait]
impl Reporter<Summary> for StdoutReporter {
    async fn report(&self, report: &Summary) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        println!("{report}");
        Ok(())
    }
}

/// Prints any report as pretty JSON.
pub struct JsonReporter;

#[async_trait]
impl<R: Report> Reporter<R> for JsonReporter {
    async fn report(&self, report: &R) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        println!("{}", serde_json::to_string_pretty(report)?);
        Ok(())
    }
}
