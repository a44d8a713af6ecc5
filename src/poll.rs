//! Polling verifier: wait for an asynchronously accepted request to reach a terminal result.
//!
//! The loop sleeps `interval`, then queries, up to `max_polls` times. It stops on
//!
//! 1. a [`PollStatus::Processed`] answer (issued or sold out, both consistent),
//! 2. `max_polls` queries without a terminal answer ([`Terminal::Timeout`]),
//! 3. a [`PollFailure`] from the query ([`Terminal::Error`]),
//! 4. the cancellation signal firing during a sleep ([`Terminal::Cancelled`]).
//!
//! `WAITING` answers are checked for a sane queue position. A missing or negative
//! position is counted as a violation but does not stop polling.

use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    clock::{Clock, Shutdown},
    http::TransportError,
};

/// One interpreted answer from a result/status endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollStatus {
    Processed { success: bool },
    Waiting { position: Option<i64> },
    /// Known to the service but not finished, without queue information.
    Pending,
    /// The endpoint answered with a non-terminal error status; keep polling.
    Unavailable { status: u16 },
}

/// Query failures that end polling.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum PollFailure {
    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub max_polls: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_polls: 15,
        }
    }
}

/// Bookkeeping for one polling loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollState {
    pub polls_made: u32,
    pub max_polls: u32,
    pub interval: Duration,
    pub request_id: String,
}

impl PollState {
    pub fn new(config: PollConfig, request_id: impl Into<String>) -> Self {
        Self {
            polls_made: 0,
            max_polls: config.max_polls,
            interval: config.interval,
            request_id: request_id.into(),
        }
    }

    fn exhausted(&self) -> bool {
        self.polls_made >= self.max_polls
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Terminal {
    Processed { success: bool },
    Timeout,
    Error(PollFailure),
    Cancelled,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PollReport {
    pub terminal: Terminal,
    pub polls: u32,
    pub elapsed: Duration,
    pub positions_accurate: u64,
    pub position_violations: u64,
}

/// Runs the loop described in the module docs. `query` receives the 1-based poll number.
pub async fn poll_until_terminal<F, Fut>(
    mut query: F,
    mut state: PollState,
    clock: &dyn Clock,
    cancel: &mut Shutdown,
) -> PollReport
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PollStatus, PollFailure>>,
{
    let start = clock.now();
    let mut positions_accurate = 0;
    let mut position_violations = 0;

    let terminal = loop {
        if state.exhausted() {
            break Terminal::Timeout;
        }
        if cancel.sleep(clock, state.interval).await.is_err() {
            break Terminal::Cancelled;
        }
        state.polls_made += 1;

        match query(state.polls_made).await {
            Ok(PollStatus::Processed { success }) => break Terminal::Processed { success },
            Ok(PollStatus::Waiting { position }) => match position {
                Some(p) if p >= 0 => positions_accurate += 1,
                _ => {
                    tracing::debug!(
                        "Request {} waiting without a valid queue position: {position:?}",
                        state.request_id
                    );
                    position_violations += 1;
                }
            },
            Ok(PollStatus::Unavailable { status }) => {
                tracing::debug!(
                    "Status lookup for {} answered {status}, still polling",
                    state.request_id
                );
                position_violations += 1;
            }
            Ok(PollStatus::Pending) => {}
            Err(failure) => break Terminal::Error(failure),
        }
    };

    PollReport {
        terminal,
        polls: state.polls_made,
        elapsed: clock.now().duration_since(start),
        positions_accurate,
        position_violations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;

    fn state(interval_secs: u64, max_polls: u32) -> PollState {
        PollState::new(
            PollConfig {
                interval: Duration::from_secs(interval_secs),
                max_polls,
            },
            "R",
        )
    }

    #[tokio::test(start_paused = true)]
    async fn never_processed_times_out_after_max_polls() {
        let (_trigger, mut cancel) = Shutdown::new();
        let mut calls = 0;
        let report = poll_until_terminal(
            |_| {
                calls += 1;
                async { Ok(PollStatus::Pending) }
            },
            state(2, 5),
            &TokioClock,
            &mut cancel,
        )
        .await;

        assert_eq!(report.terminal, Terminal::Timeout);
        assert_eq!(report.polls, 5);
        assert_eq!(calls, 5);
        assert_eq!(report.elapsed, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_first_processed_answer() {
        let (_trigger, mut cancel) = Shutdown::new();
        let report = poll_until_terminal(
            |n| async move {
                if n == 3 {
                    Ok(PollStatus::Processed { success: false })
                } else {
                    Ok(PollStatus::Pending)
                }
            },
            state(2, 15),
            &TokioClock,
            &mut cancel,
        )
        .await;

        assert_eq!(report.terminal, Terminal::Processed { success: false });
        assert_eq!(report.polls, 3);
        assert_eq!(report.elapsed, Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn queue_positions_are_checked_without_stopping() {
        let (_trigger, mut cancel) = Shutdown::new();
        let answers = [
            PollStatus::Waiting { position: Some(4) },
            PollStatus::Waiting { position: None },
            PollStatus::Waiting { position: Some(-1) },
            PollStatus::Unavailable { status: 503 },
            PollStatus::Waiting { position: Some(0) },
            PollStatus::Processed { success: true },
        ];
        let report = poll_until_terminal(
            |n| {
                let answer = answers[(n - 1) as usize];
                async move { Ok(answer) }
            },
            state(1, 20),
            &TokioClock,
            &mut cancel,
        )
        .await;

        assert_eq!(report.terminal, Terminal::Processed { success: true });
        assert_eq!(report.polls, 6);
        assert_eq!(report.positions_accurate, 2);
        assert_eq!(report.position_violations, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn query_failure_stops_with_error() {
        let (_trigger, mut cancel) = Shutdown::new();
        let report = poll_until_terminal(
            |_| async { Err(PollFailure::UnexpectedStatus(500)) },
            state(2, 15),
            &TokioClock,
            &mut cancel,
        )
        .await;

        assert_eq!(
            report.terminal,
            Terminal::Error(PollFailure::UnexpectedStatus(500))
        );
        assert_eq!(report.polls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_sleep() {
        let (trigger, mut cancel) = Shutdown::new();
        let poller = tokio::spawn(async move {
            poll_until_terminal(
                |_| async { Ok(PollStatus::Pending) },
                state(2, 15),
                &TokioClock,
                &mut cancel,
            )
            .await
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.trigger();
        let report = poller.await.unwrap();

        assert_eq!(report.terminal, Terminal::Cancelled);
        assert_eq!(report.polls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_budget_times_out_without_querying() {
        let (_trigger, mut cancel) = Shutdown::new();
        let report = poll_until_terminal(
            |_| async { Ok(PollStatus::Processed { success: true }) },
            state(2, 0),
            &TokioClock,
            &mut cancel,
        )
        .await;

        assert_eq!(report.terminal, Terminal::Timeout);
        assert_eq!(report.polls, 0);
    }
}
