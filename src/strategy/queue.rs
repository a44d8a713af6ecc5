use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{describe, event::truncate, post, sync_lock::classify_sync};
use crate::{
    http::{Request, Response, TransportError, request_id_in},
    metric::names,
    outcome::{Classification, ProtocolOutcome, ProtocolResult},
    poll::{PollConfig, PollFailure, PollState, PollStatus, Terminal, poll_until_terminal},
    vu::VuContext,
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StatusPayload {
    pub status: String,
    #[serde(default)]
    pub queue_position: Option<i64>,
}

pub(crate) fn parse_status(response: &Response) -> Result<StatusPayload, PollFailure> {
    response
        .payload_as()
        .ok_or_else(|| PollFailure::Malformed(truncate(&response.body)))
}

/// Interprets one `/coupons/issue-status` answer.
///
/// Non-200 answers and client-side timeouts keep the loop going: the queue is still
/// expected to finish the request, so they only count against position accuracy.
pub(crate) fn interpret_status(
    result: Result<Response, TransportError>,
) -> Result<PollStatus, PollFailure> {
    let response = match result {
        Ok(response) => response,
        Err(TransportError::Timeout(_)) => return Ok(PollStatus::Unavailable { status: 0 }),
        Err(e) => return Err(e.into()),
    };
    if response.status != 200 {
        return Ok(PollStatus::Unavailable {
            status: response.status,
        });
    }

    let payload = parse_status(&response)?;
    Ok(match payload.status.as_str() {
        "COMPLETED" => PollStatus::Processed { success: true },
        "NOT_REQUESTED" => PollStatus::Processed { success: false },
        "WAITING" => PollStatus::Waiting {
            position: payload.queue_position,
        },
        _ => PollStatus::Pending,
    })
}

/// Health check before queue entry; when the queue looks down the user falls back to
/// sync issuance, which is itself recorded as a consistency violation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Failover {
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub fallback_timeout: Duration,
}

impl Default for Failover {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(2),
            fallback_timeout: Duration::from_secs(10),
        }
    }
}

/// Enter the issuance queue, then poll the status endpoint until the request completes.
///
/// With `follow = false` an accepted entry ends the protocol as
/// [`ProtocolOutcome::Accepted`] without polling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuePoll {
    pub code: String,
    pub user_range: u64,
    #[serde(with = "humantime_serde")]
    pub entry_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub status_timeout: Duration,
    pub poll: PollConfig,
    pub follow: bool,
    pub failover: Option<Failover>,
}

impl Default for QueuePoll {
    fn default() -> Self {
        Self {
            code: "REDIS_ASYNC_500".to_string(),
            user_range: 20_000,
            entry_timeout: Duration::from_secs(5),
            status_timeout: Duration::from_secs(60),
            poll: PollConfig {
                interval: Duration::from_secs(2),
                max_polls: 20,
            },
            follow: true,
            failover: None,
        }
    }
}

impl QueuePoll {
    pub async fn run_once(&self, ctx: &mut VuContext) -> ProtocolResult {
        let user = ctx.random_user(self.user_range);

        if let Some(failover) = &self.failover {
            let probe = Request::get(
                ctx.endpoints().issue_status(user, &self.code),
                failover.probe_timeout,
            );
            match ctx.http().send(probe).await {
                Ok(r) if r.status == 200 => {}
                Ok(r) if r.status == 500 || r.status == 503 => {
                    tracing::info!(
                        "Queue unavailable ({}), falling back to sync for user {user}",
                        r.status
                    );
                    ctx.metrics().rate(names::QUEUE_CONSISTENCY, false);
                    return self.fall_back(ctx, user, failover).await;
                }
                other => {
                    ctx.metrics().rate(names::QUEUE_CONSISTENCY, false);
                    let detail = match other {
                        Ok(r) => format!("queue probe answered {}", r.status),
                        Err(e) => format!("queue probe failed: {e}"),
                    };
                    return ProtocolResult::new(ProtocolOutcome::Error).detail(detail);
                }
            }
        }

        self.enter_and_follow(ctx, user).await
    }

    async fn fall_back(
        &self,
        ctx: &mut VuContext,
        user: u64,
        failover: &Failover,
    ) -> ProtocolResult {
        let url = ctx.endpoints().issue_sync(user, &self.code);
        let attempt = post(ctx, url, failover.fallback_timeout).await;
        let outcome = match attempt.classify(classify_sync) {
            Classification::Success => {
                ctx.observe_issued(&self.code);
                ProtocolOutcome::Success
            }
            Classification::SoldOut => ProtocolOutcome::SoldOut,
            Classification::RateLimited => ProtocolOutcome::LockTimeout,
            _ => {
                return ProtocolResult::new(ProtocolOutcome::Error)
                    .attempts(1)
                    .detail(format!("sync fallback failed: {}", describe(&attempt)));
            }
        };
        ProtocolResult::new(outcome).attempts(1).detail("served by sync fallback")
    }

    async fn enter_and_follow(&self, ctx: &mut VuContext, user: u64) -> ProtocolResult {
        let start = ctx.now();
        let url = ctx.endpoints().issue_async(user, &self.code);
        let entry = post(ctx, url, self.entry_timeout).await;
        let metrics = ctx.metrics().clone();

        let request_id = match entry.status {
            Some(202) => {
                metrics.count(names::QUEUE_ENTRY_SUCCESS, 1);
                if !self.follow {
                    metrics.rate(names::QUEUE_CONSISTENCY, true);
                    return ProtocolResult::new(ProtocolOutcome::Accepted).attempts(1);
                }
                match entry.payload.as_ref().and_then(request_id_in) {
                    Some(id) => id,
                    None => {
                        metrics.rate(names::QUEUE_CONSISTENCY, false);
                        return ProtocolResult::new(ProtocolOutcome::Error)
                            .attempts(1)
                            .detail("queue entry accepted without a requestId");
                    }
                }
            }
            Some(409) => {
                metrics.rate(names::QUEUE_CONSISTENCY, true);
                return ProtocolResult::new(ProtocolOutcome::Duplicate).attempts(1);
            }
            // behind a healthy probe, a refused entry means the recovered queue is drained
            _ if self.failover.is_some() => {
                tracing::info!("Queue refused user {user} after failover: {}", describe(&entry));
                metrics.rate(names::QUEUE_CONSISTENCY, true);
                return ProtocolResult::new(ProtocolOutcome::SoldOut)
                    .attempts(1)
                    .detail(describe(&entry));
            }
            _ => {
                metrics.rate(names::QUEUE_CONSISTENCY, false);
                return ProtocolResult::new(ProtocolOutcome::Error)
                    .attempts(1)
                    .detail(describe(&entry));
            }
        };

        let http = ctx.http().clone();
        let url = ctx.endpoints().issue_status(user, &self.code);
        let timeout = self.status_timeout;
        let mut cancel = ctx.cancel_signal();
        let report = poll_until_terminal(
            |_| {
                let http = http.clone();
                let request = Request::get(url.clone(), timeout);
                async move { interpret_status(http.send(request).await) }
            },
            PollState::new(self.poll, request_id.clone()),
            ctx.clock().as_ref(),
            &mut cancel,
        )
        .await;

        if report.terminal != Terminal::Cancelled {
            metrics.rate_n(names::QUEUE_POSITION_ACCURACY, true, report.positions_accurate);
            metrics.rate_n(names::QUEUE_POSITION_ACCURACY, false, report.position_violations);
        }

        let result = match report.terminal {
            Terminal::Processed { success: true } => {
                metrics.trend(names::QUEUE_PROCESSING_TIME, ctx.now().duration_since(start));
                metrics.rate(names::QUEUE_FINAL_SUCCESS, true);
                metrics.rate(names::QUEUE_CONSISTENCY, true);
                ctx.observe_issued(&self.code);
                ProtocolResult::new(ProtocolOutcome::Success)
            }
            Terminal::Processed { success: false } => {
                metrics.rate(names::QUEUE_FINAL_SUCCESS, false);
                metrics.rate(names::QUEUE_CONSISTENCY, true);
                ProtocolResult::new(ProtocolOutcome::SoldOut)
            }
            Terminal::Timeout => {
                metrics.rate(names::QUEUE_FINAL_SUCCESS, false);
                metrics.rate(names::QUEUE_CONSISTENCY, false);
                ProtocolResult::new(ProtocolOutcome::Timeout).detail(format!(
                    "request {request_id} still queued after {} polls",
                    report.polls
                ))
            }
            Terminal::Error(failure) => {
                metrics.rate(names::QUEUE_CONSISTENCY, false);
                ProtocolResult::new(ProtocolOutcome::Error)
                    .detail(format!("status lookup for {request_id} failed: {failure}"))
            }
            Terminal::Cancelled => ProtocolResult::cancelled(),
        };
        result.attempts(1).polls(report.polls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(status: u16, body: &str) -> Result<Response, TransportError> {
        Ok(Response {
            status,
            body: body.to_string(),
            latency: Duration::ZERO,
        })
    }

    #[test]
    fn status_answers() {
        assert_eq!(
            interpret_status(ok(200, r#"{"data":{"status":"COMPLETED"}}"#)),
            Ok(PollStatus::Processed { success: true })
        );
        assert_eq!(
            interpret_status(ok(200, r#"{"data":{"status":"NOT_REQUESTED"}}"#)),
            Ok(PollStatus::Processed { success: false })
        );
        assert_eq!(
            interpret_status(ok(200, r#"{"data":{"status":"WAITING","queuePosition":12}}"#)),
            Ok(PollStatus::Waiting { position: Some(12) })
        );
        assert_eq!(
            interpret_status(ok(200, r#"{"data":{"status":"WAITING","queuePosition":null}}"#)),
            Ok(PollStatus::Waiting { position: None })
        );
        assert_eq!(
            interpret_status(ok(503, "")),
            Ok(PollStatus::Unavailable { status: 503 })
        );
    }

    #[test]
    fn client_timeouts_keep_polling_but_connection_loss_stops() {
        assert_eq!(
            interpret_status(Err(TransportError::Timeout(Duration::from_secs(1)))),
            Ok(PollStatus::Unavailable { status: 0 })
        );
        assert!(matches!(
            interpret_status(Err(TransportError::Connect("refused".to_string()))),
            Err(PollFailure::Transport(_))
        ));
        assert!(matches!(
            interpret_status(ok(200, r#"{"data":{}}"#)),
            Err(PollFailure::Malformed(_))
        ));
    }
}
