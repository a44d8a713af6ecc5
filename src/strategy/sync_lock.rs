use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use super::{describe, post};
use crate::{
    http::Request,
    metric::names,
    outcome::{AttemptOutcome, Classification, ProtocolOutcome, ProtocolResult},
    vu::VuContext,
};

/// Status mapping of `/coupons/issue-sync`.
pub(crate) fn classify_sync(status: u16) -> Classification {
    match status {
        200 => Classification::Success,
        409 => Classification::SoldOut,
        429 => Classification::RateLimited,
        _ => Classification::Error,
    }
}

/// A single blocking issuance against the distributed-lock endpoint. Never retried.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncLock {
    pub code: String,
    pub user_range: u64,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for SyncLock {
    fn default() -> Self {
        Self {
            code: "DB_LOCK_TEST_100".to_string(),
            user_range: 10_000,
            timeout: Duration::from_secs(15),
        }
    }
}

impl SyncLock {
    pub async fn run_once(&self, ctx: &mut VuContext) -> ProtocolResult {
        let user = ctx.random_user(self.user_range);
        let url = ctx.endpoints().issue_sync(user, &self.code);

        let start = ctx.now();
        let attempt = post(ctx, url, self.timeout).await;
        let waited = ctx.now().duration_since(start);

        let metrics = ctx.metrics();
        metrics.trend(names::DB_LOCK_WAIT_TIME, waited);

        let result = match attempt.classify(classify_sync) {
            Classification::Success => {
                metrics.count(names::DB_LOCK_SUCCESS, 1);
                metrics.rate(names::DB_CONSISTENCY, true);
                ctx.observe_issued(&self.code);
                ProtocolResult::new(ProtocolOutcome::Success)
            }
            Classification::SoldOut => {
                metrics.rate(names::DB_CONSISTENCY, true);
                ProtocolResult::new(ProtocolOutcome::SoldOut)
            }
            Classification::RateLimited => {
                metrics.rate(names::DB_CONSISTENCY, false);
                ProtocolResult::new(ProtocolOutcome::LockTimeout)
                    .detail(format!("lock wait gave up after {waited:?}"))
            }
            _ => {
                metrics.count(names::DB_LOCK_FAILED, 1);
                metrics.rate(names::DB_CONSISTENCY, false);
                ProtocolResult::new(ProtocolOutcome::Error).detail(describe(&attempt))
            }
        };
        result.attempts(1)
    }
}

/// Concurrent sync issuance of several codes for one user, to provoke lock-ordering
/// deadlocks on the service side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiCodeSync {
    pub codes: Vec<String>,
    pub user_range: u64,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for MultiCodeSync {
    fn default() -> Self {
        Self {
            codes: vec!["DEADLOCK_TEST_30".to_string(), "DB_LOCK_TEST_100".to_string()],
            user_range: 100,
            timeout: Duration::from_secs(20),
        }
    }
}

impl MultiCodeSync {
    pub async fn run_once(&self, ctx: &mut VuContext) -> ProtocolResult {
        let user = ctx.random_user(self.user_range);
        let start = ctx.now();

        let http = ctx.http();
        let requests = self.codes.iter().map(|code| {
            let request = Request::post(ctx.endpoints().issue_sync(user, code), self.timeout);
            async move { AttemptOutcome::from_result(&http.send(request).await) }
        });
        let attempts = join_all(requests).await;

        let metrics = ctx.metrics();
        metrics.trend(names::DB_LOCK_WAIT_TIME, ctx.now().duration_since(start));

        let mut issued = 0;
        let mut sold_out = 0;
        let mut deadlocked = vec![];
        let mut unexpected = vec![];
        for (code, attempt) in self.codes.iter().zip(&attempts) {
            match attempt.status {
                Some(200) => {
                    issued += 1;
                    metrics.count(names::DB_LOCK_SUCCESS, 1);
                    ctx.observe_issued(code);
                }
                Some(409) => sold_out += 1,
                Some(408 | 500) => deadlocked.push(code.as_str()),
                None if attempt.classify(classify_sync) == Classification::Timeout => {
                    deadlocked.push(code.as_str())
                }
                _ => unexpected.push(format!("{code}: {}", describe(attempt))),
            }
        }
        metrics.rate(names::DB_CONSISTENCY, deadlocked.is_empty());

        let outcome = if !deadlocked.is_empty() {
            ProtocolOutcome::LockTimeout
        } else if issued > 0 {
            ProtocolOutcome::Success
        } else if sold_out == self.codes.len() {
            ProtocolOutcome::SoldOut
        } else {
            ProtocolOutcome::Error
        };

        let mut result = ProtocolResult::new(outcome).attempts(attempts.len() as u32);
        if !deadlocked.is_empty() {
            tracing::info!(
                "Possible deadlock for user {user} on {}",
                deadlocked.join(", ")
            );
            result = result.detail(format!("suspected deadlock on {}", deadlocked.join(", ")));
        } else if !unexpected.is_empty() {
            result = result.detail(format!("not issued: {}", unexpected.join(", ")));
        }
        result
    }
}
