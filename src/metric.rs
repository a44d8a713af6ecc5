//! Metric samples and the well-known sink names.
//!
//! A [`Sample`] is the smallest unit a protocol produces: one numeric observation routed
//! to a named sink. The sink's [`MetricKind`] decides how samples are folded together:
//!
//! - `Counter`: monotonic sum.
//! - `Rate`: fraction of `true` observations (`value != 0`).
//! - `Trend`: distribution of values, reported as percentiles, mean, min and max.
//!
//! Samples carry tags. Scenario tags are attached automatically by the
//! [`crate::metrics::Recorder`]; protocols may add their own (for example `code`).

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Ordered so the same tag set always produces the same series key.
pub type Tags = BTreeMap<String, String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Counter => f.write_str("counter"),
            MetricKind::Rate => f.write_str("rate"),
            MetricKind::Trend => f.write_str("trend"),
        }
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(MetricKind::Counter),
            "rate" => Ok(MetricKind::Rate),
            "trend" => Ok(MetricKind::Trend),
            other => Err(format!("unknown metric kind `{other}`")),
        }
    }
}

/// One tagged observation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
    pub tags: Tags,
}

impl Sample {
    pub fn counter(name: impl Into<String>, value: u64, tags: Tags) -> Self {
        Self {
            name: name.into(),
            kind: MetricKind::Counter,
            value: value as f64,
            tags,
        }
    }

    pub fn rate(name: impl Into<String>, observed: bool, tags: Tags) -> Self {
        Self {
            name: name.into(),
            kind: MetricKind::Rate,
            value: if observed { 1.0 } else { 0.0 },
            tags,
        }
    }

    /// Trend values are milliseconds for every built-in trend.
    pub fn trend(name: impl Into<String>, value: f64, tags: Tags) -> Self {
        Self {
            name: name.into(),
            kind: MetricKind::Trend,
            value,
            tags,
        }
    }
}

/// Names of the sinks written by the built-in protocols and the scheduler.
pub mod names {
    // built-in
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    pub const ITERATIONS: &str = "iterations";
    pub const ITERATIONS_CANCELLED: &str = "iterations_cancelled";
    pub const ITERATION_FAILED: &str = "iteration_failed";
    pub const PROTOCOL_OUTCOME: &str = "protocol_outcome";
    pub const ISSUED_OBSERVED: &str = "coupon_issued_observed";

    // database lock strategies
    pub const DB_LOCK_SUCCESS: &str = "successful_coupon_issue_db_lock";
    pub const DB_LOCK_FAILED: &str = "failed_coupon_issue_db_lock";
    pub const DB_LOCK_WAIT_TIME: &str = "database_lock_wait_time";
    pub const DB_CONSISTENCY: &str = "coupon_data_consistency";

    // event publishing strategies
    pub const EVENT_PUBLISHED: &str = "kafka_event_published";
    pub const EVENT_PROCESSING_TIME: &str = "kafka_event_processing_time";
    pub const EVENT_ORDER_CONSISTENCY: &str = "kafka_event_order_consistency";
    pub const EVENT_PARTITION_BALANCE: &str = "kafka_partition_balance";
    pub const EVENT_EVENTUAL_CONSISTENCY: &str = "kafka_eventual_consistency";
    pub const EVENT_RESULT_RECEIVED: &str = "kafka_result_event_received";

    // queue strategies
    pub const QUEUE_ENTRY_SUCCESS: &str = "redis_queue_entry_success";
    pub const QUEUE_PROCESSING_TIME: &str = "redis_async_processing_time";
    pub const QUEUE_POSITION_ACCURACY: &str = "queue_position_accuracy";
    pub const QUEUE_CONSISTENCY: &str = "redis_data_consistency";
    pub const QUEUE_FINAL_SUCCESS: &str = "async_issuance_final_success";
}
