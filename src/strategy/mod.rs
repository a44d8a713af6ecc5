//! Client-side protocols, one per concurrency-control strategy of the service under test.
//!
//! Every variant turns one `run_once` into a [`ProtocolResult`]. Protocol errors never
//! escape: they are classified, recorded into the metric sinks and returned as an outcome.
//!
//! Strategies are selected from the run profile by their `kind`:
//!
//! ```toml
//! [scenarios.strategy]
//! kind = "optimistic-retry"
//! code = "OPTIMISTIC_TEST_50"
//! retry = { base = "100ms", max_attempts = 3 }
//! ```
//!
//! Each strategy also fixes what a timeout means for it. A sync 429 is a consistency
//! violation but not a failure; an optimistic retry budget running out is both; event and
//! queue polls that never reach a terminal answer are consistency violations.

mod burst;
mod event;
mod optimistic;
mod probes;
mod queue;
mod sync_lock;

pub use burst::{BurstTarget, DuplicateBurst};
pub use event::EventPoll;
pub use optimistic::OptimisticRetry;
pub use probes::{PartitionSpread, ResultProbe, StatusProbe};
pub use queue::{Failover, QueuePoll};
pub use sync_lock::{MultiCodeSync, SyncLock};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    http::Request,
    outcome::{AttemptOutcome, ProtocolResult},
    vu::{ThinkTime, VuContext},
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Strategy {
    SyncLock(SyncLock),
    OptimisticRetry(OptimisticRetry),
    EventPoll(EventPoll),
    QueuePoll(QueuePoll),
    DuplicateBurst(DuplicateBurst),
    MultiCodeSync(MultiCodeSync),
    ResultProbe(ResultProbe),
    StatusProbe(StatusProbe),
    PartitionSpread(PartitionSpread),
}

impl Strategy {
    /// Runs one protocol execution for the virtual user owning `ctx`.
    pub async fn run_once(&self, ctx: &mut VuContext) -> ProtocolResult {
        let start = ctx.now();
        let result = match self {
            Strategy::SyncLock(s) => s.run_once(ctx).await,
            Strategy::OptimisticRetry(s) => s.run_once(ctx).await,
            Strategy::EventPoll(s) => s.run_once(ctx).await,
            Strategy::QueuePoll(s) => s.run_once(ctx).await,
            Strategy::DuplicateBurst(s) => s.run_once(ctx).await,
            Strategy::MultiCodeSync(s) => s.run_once(ctx).await,
            Strategy::ResultProbe(s) => s.run_once(ctx).await,
            Strategy::StatusProbe(s) => s.run_once(ctx).await,
            Strategy::PartitionSpread(s) => s.run_once(ctx).await,
        };
        result.elapsed(ctx.now().duration_since(start))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Strategy::SyncLock(_) => "sync-lock",
            Strategy::OptimisticRetry(_) => "optimistic-retry",
            Strategy::EventPoll(_) => "event-poll",
            Strategy::QueuePoll(_) => "queue-poll",
            Strategy::DuplicateBurst(_) => "duplicate-burst",
            Strategy::MultiCodeSync(_) => "multi-code-sync",
            Strategy::ResultProbe(_) => "result-probe",
            Strategy::StatusProbe(_) => "status-probe",
            Strategy::PartitionSpread(_) => "partition-spread",
        }
    }

    /// Pause between iterations when the scenario does not set one.
    pub fn default_think_time(&self) -> ThinkTime {
        match self {
            Strategy::SyncLock(_) | Strategy::EventPoll(_) | Strategy::PartitionSpread(_) => {
                ThinkTime::secs_f64(1.0, 3.0)
            }
            Strategy::OptimisticRetry(_) | Strategy::ResultProbe(_) => {
                ThinkTime::secs_f64(0.5, 1.5)
            }
            Strategy::QueuePoll(q) if q.failover.is_some() => ThinkTime::secs_f64(2.0, 6.0),
            Strategy::QueuePoll(_) => ThinkTime::secs_f64(1.0, 4.0),
            Strategy::DuplicateBurst(_) | Strategy::MultiCodeSync(_) => {
                ThinkTime::secs_f64(2.0, 5.0)
            }
            Strategy::StatusProbe(_) => ThinkTime::secs_f64(0.5, 2.5),
        }
    }

    /// Coupon codes this strategy issues against.
    pub fn codes(&self) -> Vec<&str> {
        match self {
            Strategy::SyncLock(s) => vec![s.code.as_str()],
            Strategy::OptimisticRetry(s) => vec![s.code.as_str()],
            Strategy::EventPoll(s) => vec![s.code.as_str()],
            Strategy::QueuePoll(s) => vec![s.code.as_str()],
            Strategy::DuplicateBurst(s) => vec![s.code.as_str()],
            Strategy::MultiCodeSync(s) => s.codes.iter().map(String::as_str).collect(),
            Strategy::ResultProbe(s) => vec![s.code.as_str()],
            Strategy::StatusProbe(s) => vec![s.code.as_str()],
            Strategy::PartitionSpread(s) => vec![s.code.as_str()],
        }
    }
}

/// One empty-bodied JSON POST, as every issuance endpoint expects.
async fn post(ctx: &VuContext, url: String, timeout: Duration) -> AttemptOutcome {
    AttemptOutcome::from_result(&ctx.http().send(Request::post(url, timeout)).await)
}

/// Human-readable reason for a non-terminal or unexpected attempt, used in debug logs.
fn describe(attempt: &AttemptOutcome) -> String {
    match (&attempt.status, &attempt.transport_error) {
        (Some(status), _) => format!("status {status}"),
        (None, Some(e)) => e.to_string(),
        (None, None) => "no response".to_string(),
    }
}
