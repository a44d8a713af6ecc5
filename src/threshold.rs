//! Pass/fail criteria over the final metric snapshot.
//!
//! An expression compares one statistic of a sink against a bound, in the same notation
//! k6 uses:
//!
//! ```text
//! p(95)<10000     95th percentile of a trend, in ms
//! avg<=250        mean of a trend
//! count>90        sum of a counter, or number of observations of a rate/trend
//! rate>0.999      fraction of true observations of a rate
//! ```

use std::{fmt, str::FromStr};

use couponstorm_macros::report;

use crate::{
    error::ThresholdError,
    metrics::{MetricsSnapshot, SinkData},
    report::Report,
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Stat {
    Count,
    Rate,
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stat::Count => f.write_str("count"),
            Stat::Rate => f.write_str("rate"),
            Stat::Avg => f.write_str("avg"),
            Stat::Min => f.write_str("min"),
            Stat::Max => f.write_str("max"),
            Stat::Med => f.write_str("med"),
            Stat::Percentile(p) => write!(f, "p({p})"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Op {
    // two-character operators first so `<=` is not read as `<`
    const TOKENS: [(&'static str, Op); 6] = [
        ("<=", Op::Le),
        (">=", Op::Ge),
        ("==", Op::Eq),
        ("!=", Op::Ne),
        ("<", Op::Lt),
        (">", Op::Gt),
    ];

    fn holds(self, observed: f64, bound: f64) -> bool {
        match self {
            Op::Lt => observed < bound,
            Op::Le => observed <= bound,
            Op::Gt => observed > bound,
            Op::Ge => observed >= bound,
            Op::Eq => (observed - bound).abs() < f64::EPSILON,
            Op::Ne => (observed - bound).abs() >= f64::EPSILON,
        }
    }

    fn token(self) -> &'static str {
        match self {
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Eq => "==",
            Op::Ne => "!=",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Parses the statistic on the left-hand side of an expression.
fn parse_stat(stat: &str, expr: &str) -> Result<Stat, ThresholdError> {
    let unknown = || ThresholdError::UnknownStat {
        expr: expr.to_string(),
        stat: stat.to_string(),
    };
    match stat {
        "count" => Ok(Stat::Count),
        "rate" => Ok(Stat::Rate),
        "avg" => Ok(Stat::Avg),
        "min" => Ok(Stat::Min),
        "max" => Ok(Stat::Max),
        "med" => Ok(Stat::Med),
        s => {
            let inner = s
                .strip_prefix("p(")
                .and_then(|rest| rest.strip_suffix(')'))
                .ok_or_else(unknown)?;
            let invalid = || ThresholdError::InvalidPercentile {
                expr: expr.to_string(),
                value: inner.to_string(),
            };
            let p = inner.trim().parse::<f64>().map_err(|_| invalid())?;
            if !(0.0..=100.0).contains(&p) {
                return Err(invalid());
            }
            Ok(Stat::Percentile(p))
        }
    }
}

/// One compiled threshold expression on one sink.
#[derive(Clone, Debug, PartialEq)]
pub struct Threshold {
    pub metric: String,
    pub stat: Stat,
    pub op: Op,
    pub bound: f64,
    expr: String,
}

#[report]
pub struct ThresholdResult {
    pub metric: String,
    pub expr: String,
    /// `None` when the sink had nothing to measure.
    pub observed: Option<f64>,
    pub passed: bool,
}

impl Threshold {
    pub fn parse(metric: impl Into<String>, expr: &str) -> Result<Self, ThresholdError> {
        let compact: String = expr.chars().filter(|c| !c.is_whitespace()).collect();
        let (at, op, token) = Op::TOKENS
            .iter()
            .filter_map(|(token, op)| compact.find(token).map(|at| (at, *op, *token)))
            .min_by_key(|(at, _, token)| (*at, usize::MAX - token.len()))
            .ok_or_else(|| ThresholdError::MissingOperator {
                expr: expr.to_string(),
            })?;

        let stat = parse_stat(&compact[..at], expr)?;
        let bound_str = &compact[at + token.len()..];
        let bound = bound_str
            .parse::<f64>()
            .map_err(|_| ThresholdError::InvalidBound {
                expr: expr.to_string(),
                value: bound_str.to_string(),
            })?;

        Ok(Self {
            metric: metric.into(),
            stat,
            op,
            bound,
            expr: compact,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// The statistic as observed on `sink`, if the sink can produce it.
    pub fn observe(&self, sink: Option<&SinkData>) -> Option<f64> {
        let Some(sink) = sink else {
            // an untouched counter is a zero count
            return (self.stat == Stat::Count).then_some(0.0);
        };
        match self.stat {
            Stat::Count => Some(sink.count() as f64),
            Stat::Rate => sink.rate(),
            Stat::Avg => sink.trend()?.mean(),
            Stat::Min => sink.trend()?.min(),
            Stat::Max => sink.trend()?.max(),
            Stat::Med => sink.trend()?.percentile(50.0),
            Stat::Percentile(p) => sink.trend()?.percentile(p),
        }
    }

    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> ThresholdResult {
        let sink = snapshot.sink(&self.metric);
        let observed = self.observe(sink.as_ref());
        let passed = observed.is_some_and(|v| self.op.holds(v, self.bound));
        if !passed {
            match observed {
                Some(v) => tracing::warn!(
                    "Threshold {}: {} failed, observed {v:.3}",
                    self.metric,
                    self.expr
                ),
                None => tracing::warn!(
                    "Threshold {}: {} failed, no samples",
                    self.metric,
                    self.expr
                ),
            }
        }
        ThresholdResult {
            metric: self.metric.clone(),
            expr: self.expr.clone(),
            observed,
            passed,
        }
    }
}

impl FromStr for Stat {
    type Err = ThresholdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_stat(s, s)
    }
}
