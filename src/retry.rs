//! Retry/backoff decisions for conflict-prone issuance.
//!
//! [`decide`] is a pure function of the last classification and how many attempts have
//! been made so far:
//!
//! ```text
//! SUCCESS                      -> StopSuccess
//! SOLD_OUT                     -> StopTerminal   (business outcome, not a failure)
//! CONFLICT, attempts < max     -> RetryAfter(base * 2^attempts)
//! CONFLICT, attempts >= max    -> StopExhausted
//! anything else                -> StopTerminal   (failure, never retried)
//! ```
//!
//! With the default 100ms base the waits after the first and second conflict are 200ms
//! and 400ms; a third conflict exhausts a budget of three attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::outcome::Classification;

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Caps the exponent so a misconfigured budget cannot overflow the delay.
const MAX_BACKOFF_SHIFT: u32 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    StopSuccess,
    StopTerminal,
    RetryAfter(Duration),
    StopExhausted,
}

/// [`decide`] with the default 100ms backoff base.
pub fn decide(outcome: Classification, attempts_made: u32, max_attempts: u32) -> Decision {
    RetryPolicy {
        base: DEFAULT_BACKOFF_BASE,
        max_attempts,
    }
    .decide(outcome, attempts_made)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(with = "humantime_serde")]
    pub base: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// `attempts_made` includes the attempt that produced `outcome`.
    pub fn decide(&self, outcome: Classification, attempts_made: u32) -> Decision {
        match outcome {
            Classification::Success => Decision::StopSuccess,
            Classification::SoldOut => Decision::StopTerminal,
            Classification::Conflict if attempts_made >= self.max_attempts => {
                Decision::StopExhausted
            }
            Classification::Conflict => Decision::RetryAfter(self.backoff(attempts_made)),
            _ => Decision::StopTerminal,
        }
    }

    pub fn backoff(&self, attempts_made: u32) -> Duration {
        self.base
            .saturating_mul(1u32 << attempts_made.min(MAX_BACKOFF_SHIFT))
    }
}

/// Attempt bookkeeping for one protocol execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryState {
    pub attempts_made: u32,
    pub max_attempts: u32,
}

impl RetryState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts_made: 0,
            max_attempts,
        }
    }

    pub fn record_attempt(&mut self) -> u32 {
        self.attempts_made += 1;
        self.attempts_made
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_and_sold_out_stop_immediately() {
        for attempts in 1..5 {
            assert_eq!(decide(Classification::Success, attempts, 3), Decision::StopSuccess);
            assert_eq!(decide(Classification::SoldOut, attempts, 3), Decision::StopTerminal);
        }
    }

    #[test]
    fn conflicts_back_off_exponentially() {
        assert_eq!(
            decide(Classification::Conflict, 1, 3),
            Decision::RetryAfter(Duration::from_millis(200))
        );
        assert_eq!(
            decide(Classification::Conflict, 2, 3),
            Decision::RetryAfter(Duration::from_millis(400))
        );
    }

    #[test]
    fn conflict_past_budget_is_exhausted() {
        assert_eq!(decide(Classification::Conflict, 3, 3), Decision::StopExhausted);
        assert_eq!(decide(Classification::Conflict, 7, 3), Decision::StopExhausted);
    }

    #[test]
    fn other_outcomes_are_terminal_without_retry() {
        for c in [
            Classification::Error,
            Classification::RateLimited,
            Classification::Timeout,
        ] {
            assert_eq!(decide(c, 1, 3), Decision::StopTerminal);
        }
    }

    #[test]
    fn always_conflict_stops_after_exactly_max_attempts() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::new(policy.max_attempts);
        let mut waits = vec![];
        let decision = loop {
            let attempts = state.record_attempt();
            match policy.decide(Classification::Conflict, attempts) {
                Decision::RetryAfter(d) => waits.push(d),
                other => break other,
            }
        };

        assert_eq!(decision, Decision::StopExhausted);
        assert_eq!(state.attempts_made, 3);
        assert_eq!(
            waits,
            vec![Duration::from_millis(200), Duration::from_millis(400)]
        );
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = RetryPolicy {
            base: Duration::from_secs(1),
            max_attempts: u32::MAX,
        };
        assert!(policy.backoff(u32::MAX - 1) >= Duration::from_secs(1));
    }
}
