use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{describe, post};
use crate::{
    metric::names,
    outcome::{Classification, ProtocolOutcome, ProtocolResult},
    retry::{Decision, RetryPolicy, RetryState},
    vu::VuContext,
};

fn classify_optimistic(status: u16) -> Classification {
    match status {
        200 => Classification::Success,
        409 => Classification::SoldOut,
        423 => Classification::Conflict,
        429 => Classification::RateLimited,
        _ => Classification::Error,
    }
}

/// Issuance against the version-checked endpoint, retrying `423 Locked` conflicts with
/// exponential backoff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimisticRetry {
    pub code: String,
    pub user_range: u64,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for OptimisticRetry {
    fn default() -> Self {
        Self {
            code: "OPTIMISTIC_TEST_50".to_string(),
            user_range: 5_000,
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl OptimisticRetry {
    pub async fn run_once(&self, ctx: &mut VuContext) -> ProtocolResult {
        let user = ctx.random_user(self.user_range);
        let url = ctx.endpoints().issue_optimistic(user, &self.code);
        let mut state = RetryState::new(self.retry.max_attempts);

        loop {
            let attempt = post(ctx, url.clone(), self.timeout).await;
            let attempts = state.record_attempt();
            let classification = attempt.classify(classify_optimistic);
            let metrics = ctx.metrics();

            match self.retry.decide(classification, attempts) {
                Decision::StopSuccess => {
                    metrics.count(names::DB_LOCK_SUCCESS, 1);
                    metrics.rate(names::DB_CONSISTENCY, true);
                    ctx.observe_issued(&self.code);
                    return ProtocolResult::new(ProtocolOutcome::Success).attempts(attempts);
                }
                Decision::StopTerminal if classification == Classification::SoldOut => {
                    metrics.rate(names::DB_CONSISTENCY, true);
                    return ProtocolResult::new(ProtocolOutcome::SoldOut).attempts(attempts);
                }
                Decision::StopTerminal => {
                    metrics.count(names::DB_LOCK_FAILED, 1);
                    metrics.rate(names::DB_CONSISTENCY, false);
                    return ProtocolResult::new(ProtocolOutcome::Error)
                        .attempts(attempts)
                        .detail(describe(&attempt));
                }
                Decision::StopExhausted => {
                    metrics.count(names::DB_LOCK_FAILED, 1);
                    metrics.rate(names::DB_CONSISTENCY, false);
                    return ProtocolResult::new(ProtocolOutcome::Exhausted)
                        .attempts(attempts)
                        .detail(format!("{attempts} conflicting attempts for user {user}"));
                }
                Decision::RetryAfter(delay) => {
                    tracing::trace!(
                        "Conflict for user {user}, attempt {attempts}/{}, backing off {delay:?}",
                        state.max_attempts
                    );
                    if ctx.sleep(delay).await.is_err() {
                        return ProtocolResult::cancelled().attempts(attempts);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_is_a_conflict() {
        assert_eq!(classify_optimistic(423), Classification::Conflict);
        assert_eq!(classify_optimistic(409), Classification::SoldOut);
        assert_eq!(classify_optimistic(503), Classification::Error);
    }
}
