use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{describe, post};
use crate::{
    http::{Request, Response, request_id_in},
    metric::names,
    outcome::{ProtocolOutcome, ProtocolResult},
    poll::{PollConfig, PollFailure, PollState, PollStatus, Terminal, poll_until_terminal},
    vu::VuContext,
};

#[derive(Deserialize)]
struct ResultPayload {
    #[serde(default)]
    processed: bool,
    #[serde(default)]
    success: bool,
}

/// Interprets one `/coupons/result` answer. 404 means the consumer has not caught up yet.
pub(crate) fn interpret_result(response: &Response) -> Result<PollStatus, PollFailure> {
    match response.status {
        200 => {
            let payload: ResultPayload = response
                .payload_as()
                .ok_or_else(|| PollFailure::Malformed(truncate(&response.body)))?;
            Ok(match payload.processed {
                true => PollStatus::Processed {
                    success: payload.success,
                },
                false => PollStatus::Pending,
            })
        }
        404 => Ok(PollStatus::Pending),
        status => Err(PollFailure::UnexpectedStatus(status)),
    }
}

pub(crate) fn truncate(body: &str) -> String {
    body.chars().take(120).collect()
}

/// Publish an issuance event, then poll the result endpoint until the consumer reports
/// a terminal answer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventPoll {
    pub code: String,
    pub user_range: u64,
    #[serde(with = "humantime_serde")]
    pub publish_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub result_timeout: Duration,
    pub poll: PollConfig,
}

impl Default for EventPoll {
    fn default() -> Self {
        Self {
            code: "KAFKA_MASSIVE_1000".to_string(),
            user_range: 50_000,
            publish_timeout: Duration::from_secs(8),
            result_timeout: Duration::from_secs(60),
            poll: PollConfig::default(),
        }
    }
}

impl EventPoll {
    pub async fn run_once(&self, ctx: &mut VuContext) -> ProtocolResult {
        let user = ctx.random_user(self.user_range);
        let start = ctx.now();
        let url = ctx.endpoints().issue_event(user, &self.code);
        let publish = post(ctx, url, self.publish_timeout).await;
        let metrics = ctx.metrics().clone();

        let request_id = match publish.status {
            Some(202) => {
                metrics.count(names::EVENT_PUBLISHED, 1);
                match publish.payload.as_ref().and_then(request_id_in) {
                    Some(id) => id,
                    None => {
                        metrics.rate(names::EVENT_EVENTUAL_CONSISTENCY, false);
                        return ProtocolResult::new(ProtocolOutcome::Error)
                            .attempts(1)
                            .detail("publish accepted without a requestId");
                    }
                }
            }
            Some(400) => {
                return ProtocolResult::new(ProtocolOutcome::ClientError)
                    .attempts(1)
                    .detail(format!("publish rejected for user {user}"));
            }
            _ => {
                return ProtocolResult::new(ProtocolOutcome::Error)
                    .attempts(1)
                    .detail(describe(&publish));
            }
        };

        let http = ctx.http().clone();
        let url = ctx.endpoints().event_result(user, &self.code, &request_id);
        let timeout = self.result_timeout;
        let mut cancel = ctx.cancel_signal();
        let report = poll_until_terminal(
            |_| {
                let http = http.clone();
                let request = Request::get(url.clone(), timeout);
                async move {
                    match http.send(request).await {
                        Ok(response) => interpret_result(&response),
                        Err(e) => Err(e.into()),
                    }
                }
            },
            PollState::new(self.poll, request_id.clone()),
            ctx.clock().as_ref(),
            &mut cancel,
        )
        .await;

        let result = match report.terminal {
            Terminal::Processed { success } => {
                metrics.trend(names::EVENT_PROCESSING_TIME, ctx.now().duration_since(start));
                metrics.count(names::EVENT_RESULT_RECEIVED, 1);
                metrics.rate(names::EVENT_EVENTUAL_CONSISTENCY, true);
                if success {
                    ctx.observe_issued(&self.code);
                    ProtocolResult::new(ProtocolOutcome::Success)
                } else {
                    ProtocolResult::new(ProtocolOutcome::SoldOut)
                }
            }
            Terminal::Timeout => {
                metrics.rate(names::EVENT_EVENTUAL_CONSISTENCY, false);
                ProtocolResult::new(ProtocolOutcome::Timeout).detail(format!(
                    "request {request_id} unprocessed after {} polls",
                    report.polls
                ))
            }
            Terminal::Error(failure) => {
                metrics.rate(names::EVENT_EVENTUAL_CONSISTENCY, false);
                ProtocolResult::new(ProtocolOutcome::Error)
                    .detail(format!("result lookup for {request_id} failed: {failure}"))
            }
            Terminal::Cancelled => ProtocolResult::cancelled(),
        };
        result.attempts(1).polls(report.polls)
    }
}
