//! Single-request load patterns against the read and publish endpoints.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::{describe, event::interpret_result, queue::parse_status};
use crate::{
    http::Request,
    metric::names,
    outcome::{AttemptOutcome, ProtocolOutcome, ProtocolResult},
    vu::VuContext,
};

/// Hammers `/coupons/result` with request ids nobody published.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultProbe {
    pub code: String,
    pub user_range: u64,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ResultProbe {
    fn default() -> Self {
        Self {
            code: "KAFKA_POLL_300".to_string(),
            user_range: 5_000,
            timeout: Duration::from_secs(3),
        }
    }
}

impl ResultProbe {
    pub async fn run_once(&self, ctx: &mut VuContext) -> ProtocolResult {
        let user = ctx.random_user(self.user_range);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let request_id = format!("REQ_{user}_{}_{millis}", self.code);
        let url = ctx.endpoints().event_result(user, &self.code, &request_id);

        let response = ctx.http().send(Request::get(url, self.timeout)).await;
        let metrics = ctx.metrics();
        let result = match &response {
            Ok(r) => match (r.status, interpret_result(r)) {
                (404, _) => Ok(()),
                (200, Ok(_)) => {
                    metrics.count(names::EVENT_RESULT_RECEIVED, 1);
                    Ok(())
                }
                (_, Err(failure)) => Err(failure.to_string()),
                (status, Ok(_)) => Err(format!("status {status}")),
            },
            Err(_) => Err(describe(&AttemptOutcome::from_result(&response))),
        };

        metrics.rate(names::EVENT_EVENTUAL_CONSISTENCY, result.is_ok());
        let probed = match result {
            Ok(()) => ProtocolResult::new(ProtocolOutcome::Probed),
            Err(detail) => ProtocolResult::new(ProtocolOutcome::Error).detail(detail),
        };
        probed.polls(1)
    }
}

/// Hammers `/coupons/issue-status` and checks the shape of each answer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusProbe {
    pub code: String,
    pub user_range: u64,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for StatusProbe {
    fn default() -> Self {
        Self {
            code: "REDIS_QUEUE_100".to_string(),
            user_range: 1_000,
            timeout: Duration::from_secs(3),
        }
    }
}

impl StatusProbe {
    pub async fn run_once(&self, ctx: &mut VuContext) -> ProtocolResult {
        let user = ctx.random_user(self.user_range);
        let url = ctx.endpoints().issue_status(user, &self.code);

        let response = ctx.http().send(Request::get(url, self.timeout)).await;
        let metrics = ctx.metrics();
        let payload = match &response {
            Ok(r) if r.status == 200 => parse_status(r).map_err(|e| e.to_string()),
            _ => Err(describe(&AttemptOutcome::from_result(&response))),
        };

        // errors are inconclusive for position accuracy and only count as inconsistent
        let payload = match payload {
            Ok(payload) => payload,
            Err(detail) => {
                metrics.rate(names::QUEUE_CONSISTENCY, false);
                return ProtocolResult::new(ProtocolOutcome::Error)
                    .polls(1)
                    .detail(detail);
            }
        };

        let accurate = match payload.status.as_str() {
            "WAITING" => payload.queue_position.is_some(),
            "COMPLETED" | "NOT_REQUESTED" => true,
            _ => false,
        };
        metrics.rate(names::QUEUE_POSITION_ACCURACY, accurate);
        metrics.rate(names::QUEUE_CONSISTENCY, true);
        ProtocolResult::new(ProtocolOutcome::Probed).polls(1)
    }
}

/// Publishes under user ids spread across partitions, with a partition-key hint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionSpread {
    pub code: String,
    pub user_range: u64,
    pub partitions: u64,
    pub partition_stride: u64,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for PartitionSpread {
    fn default() -> Self {
        Self {
            code: "KAFKA_PARTITION_100".to_string(),
            user_range: 1_000,
            partitions: 4,
            partition_stride: 10_000,
            timeout: Duration::from_secs(5),
        }
    }
}

impl PartitionSpread {
    pub async fn run_once(&self, ctx: &mut VuContext) -> ProtocolResult {
        let base = ctx.random_user(self.user_range);
        let offset = ctx.random_user(self.partitions.max(1)) - 1;
        let user = base + offset * self.partition_stride;

        let request = Request::post(ctx.endpoints().issue_event(user, &self.code), self.timeout)
            .with_header("X-Partition-Key", user.to_string());
        let attempt = AttemptOutcome::from_result(&ctx.http().send(request).await);

        let metrics = ctx.metrics();
        let outcome = match attempt.status {
            Some(202) => {
                metrics.count(names::EVENT_PUBLISHED, 1);
                ProtocolOutcome::Accepted
            }
            Some(409) => ProtocolOutcome::Duplicate,
            _ => {
                metrics.rate(names::EVENT_PARTITION_BALANCE, false);
                return ProtocolResult::new(ProtocolOutcome::Error)
                    .attempts(1)
                    .detail(format!("user {user}: {}", describe(&attempt)));
            }
        };
        metrics.rate(names::EVENT_PARTITION_BALANCE, true);
        ProtocolResult::new(outcome).attempts(1)
    }
}

