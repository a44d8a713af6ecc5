use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::post;
use crate::{
    metric::names,
    outcome::{ProtocolOutcome, ProtocolResult},
    vu::VuContext,
};

/// Which issuance endpoint the burst hits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BurstTarget {
    /// `/coupons/issue`; acceptance is `202`.
    Event,
    /// `/coupons/issue-optimistic`; acceptance is `200`.
    Optimistic,
}

/// One fixed identity fires several rapid requests for the same coupon. At most one may
/// be accepted, and it must be the first; the rest must be rejected as duplicates or
/// sold out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplicateBurst {
    pub code: String,
    pub target: BurstTarget,
    pub requests: u32,
    #[serde(with = "humantime_serde")]
    pub gap: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Identities are `user_base + slot * user_stride + iteration`, so one slot may run
    /// up to `user_stride` iterations before it reaches the next slot's range.
    pub user_base: u64,
    pub user_stride: u64,
}

impl Default for DuplicateBurst {
    fn default() -> Self {
        Self {
            code: "KAFKA_ORDER_200".to_string(),
            target: BurstTarget::Event,
            requests: 3,
            gap: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
            user_base: 10_000,
            user_stride: 1_000_000,
        }
    }
}

impl DuplicateBurst {
    pub fn user_for(&self, slot: usize, iteration: u64) -> u64 {
        self.user_base + slot as u64 * self.user_stride + iteration
    }

    pub async fn run_once(&self, ctx: &mut VuContext) -> ProtocolResult {
        let user = self.user_for(ctx.identity.slot, ctx.identity.iteration);
        let (url, accepted_status) = match self.target {
            BurstTarget::Event => (ctx.endpoints().issue_event(user, &self.code), 202),
            BurstTarget::Optimistic => (ctx.endpoints().issue_optimistic(user, &self.code), 200),
        };

        let mut statuses = Vec::with_capacity(self.requests as usize);
        for i in 0..self.requests {
            if i > 0 && ctx.sleep(self.gap).await.is_err() {
                return ProtocolResult::cancelled().attempts(i);
            }
            statuses.push(post(ctx, url.clone(), self.timeout).await.status);
        }
        // settle once more before judging; every request is already answered, so a
        // cancel here still counts what the service did
        if ctx.sleep(self.gap).await.is_err() {
            tracing::debug!("Duplicate burst for user {user} cancelled while settling");
        }

        let accepted = statuses
            .iter()
            .filter(|s| **s == Some(accepted_status))
            .count();
        let first_accepted = statuses.first() == Some(&Some(accepted_status));
        let ordered = accepted == 0 || (accepted == 1 && first_accepted);

        let metrics = ctx.metrics();
        match self.target {
            BurstTarget::Event => {
                metrics.count(names::EVENT_PUBLISHED, accepted as u64);
                metrics.rate(names::EVENT_ORDER_CONSISTENCY, ordered);
            }
            BurstTarget::Optimistic => {
                metrics.count(names::DB_LOCK_SUCCESS, accepted as u64);
                metrics.rate(names::DB_CONSISTENCY, ordered);
                for _ in 0..accepted {
                    ctx.observe_issued(&self.code);
                }
            }
        }

        let result = match (accepted, self.target) {
            (0, BurstTarget::Event) if statuses.iter().all(|s| *s == Some(409)) => {
                ProtocolResult::new(ProtocolOutcome::Duplicate)
            }
            (0, BurstTarget::Optimistic) if statuses.iter().all(|s| *s == Some(409)) => {
                ProtocolResult::new(ProtocolOutcome::SoldOut)
            }
            (0, _) => ProtocolResult::new(ProtocolOutcome::Error)
                .detail(format!("no request accepted for user {user}: {statuses:?}")),
            (1, BurstTarget::Event) if ordered => ProtocolResult::new(ProtocolOutcome::Accepted),
            (1, BurstTarget::Optimistic) if ordered => {
                ProtocolResult::new(ProtocolOutcome::Success)
            }
            (n, _) => {
                tracing::warn!("Duplicate burst for user {user} broke ordering: {statuses:?}");
                ProtocolResult::new(ProtocolOutcome::Error).detail(format!(
                    "{n} of {} requests accepted, first accepted: {first_accepted}",
                    statuses.len()
                ))
            }
        };
        result.attempts(statuses.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities_do_not_spill_into_the_next_slot() {
        let burst = DuplicateBurst::default();
        assert_eq!(burst.user_for(0, 0), 10_000);
        assert_eq!(burst.user_for(1, 3), 1_010_003);
        assert_ne!(burst.user_for(0, 100), burst.user_for(1, 0));

        let mut seen = std::collections::HashSet::new();
        for slot in 0..4 {
            for iteration in 0..1_000 {
                assert!(seen.insert(burst.user_for(slot, iteration)), "{slot}/{iteration}");
            }
        }
    }

    #[test]
    fn stride_can_be_configured() {
        let burst: DuplicateBurst = toml::from_str("user_base = 1\nuser_stride = 10").unwrap();
        assert_eq!(burst.user_for(2, 9), 30);
        assert_eq!(burst.requests, 3);
    }
}
