//! Iteration-bounded executors.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::{Executor, IterationGate, ScenarioRuntime, merge, workers};
use crate::{aggregate::OutcomeTally, clock::Shutdown};

fn default_max_duration() -> Duration {
    Duration::from_secs(600)
}

/// A global budget of iterations that racing virtual users claim one at a time.
///
/// Claims use a compare-and-decrement loop on the remaining count, so the number of
/// granted claims never exceeds the initial budget no matter how many users race.
#[derive(Debug)]
pub struct IterationPool {
    remaining: AtomicU64,
    claimed: AtomicU64,
}

impl IterationPool {
    pub fn new(total: u64) -> Self {
        Self {
            remaining: AtomicU64::new(total),
            claimed: AtomicU64::new(0),
        }
    }

    pub fn try_claim(&self) -> bool {
        let mut current = self.remaining.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.remaining.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.claimed.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn claimed(&self) -> u64 {
        self.claimed.load(Ordering::Acquire)
    }
}

/// `vus` users share `iterations` iterations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct SharedIterations {
    pub vus: usize,
    pub iterations: u64,
    #[serde(default = "default_max_duration", with = "humantime_serde")]
    #[builder(default = default_max_duration())]
    pub max_duration: Duration,
}

/// Each of `vus` users runs `iterations` iterations of its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct PerVuIterations {
    pub vus: usize,
    pub iterations: u64,
    #[serde(default = "default_max_duration", with = "humantime_serde")]
    #[builder(default = default_max_duration())]
    pub max_duration: Duration,
}

/// Runs users until they exhaust their gates or `max_duration` passes, whichever first.
async fn run_bounded(
    runtime: &mut ScenarioRuntime,
    vus: usize,
    max_duration: Duration,
    gate: impl Fn() -> IterationGate,
) -> OutcomeTally {
    let (stop, _) = Shutdown::new();
    let handles = (0..vus)
        .map(|_| runtime.spawn_vu(gate(), stop.subscribe()))
        .collect();
    let mut workers = workers(handles);

    match runtime.wait_for(&mut workers, max_duration).await {
        Some(results) => merge(results),
        None => {
            tracing::info!(
                "Scenario {}: max duration of {max_duration:?} reached",
                runtime.name()
            );
            stop.trigger();
            runtime.drain(workers).await
        }
    }
}

impl Executor for SharedIterations {
    async fn exec(&self, mut runtime: ScenarioRuntime) -> OutcomeTally {
        let pool = Arc::new(IterationPool::new(self.iterations));
        tracing::info!(
            "Scenario {}: {} VUs sharing {} iterations",
            runtime.name(),
            self.vus,
            self.iterations
        );
        let tally = run_bounded(&mut runtime, self.vus, self.max_duration, || {
            IterationGate::Shared(pool.clone())
        })
        .await;
        tracing::info!(
            "Scenario {}: {} of {} iterations claimed",
            runtime.name(),
            pool.claimed(),
            self.iterations
        );
        tally
    }
}

impl Executor for PerVuIterations {
    async fn exec(&self, mut runtime: ScenarioRuntime) -> OutcomeTally {
        tracing::info!(
            "Scenario {}: {} VUs running {} iterations each",
            runtime.name(),
            self.vus,
            self.iterations
        );
        let per_vu = self.iterations;
        run_bounded(&mut runtime, self.vus, self.max_duration, || {
            IterationGate::PerVu { remaining: per_vu }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_grants_exactly_its_budget() {
        let pool = IterationPool::new(3);
        let granted = (0..10).filter(|_| pool.try_claim()).count();
        assert_eq!(granted, 3);
        assert_eq!(pool.remaining(), 0);
        assert_eq!(pool.claimed(), 3);
    }

    #[test]
    fn empty_pool_grants_nothing() {
        assert!(!IterationPool::new(0).try_claim());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_claims_never_exceed_budget() {
        let pool = Arc::new(IterationPool::new(1_000));
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    let mut mine = 0u64;
                    while pool.try_claim() {
                        mine += 1;
                        tokio::task::yield_now().await;
                    }
                    mine
                })
            })
            .collect();

        let mut total = 0;
        for h in handles {
            total += h.await.unwrap();
        }
        assert_eq!(total, 1_000);
        assert_eq!(pool.claimed(), 1_000);
    }
}
