//! Executors: how many virtual users a scenario runs, and for how long.
//!
//! Every population profile is an [`Executor`]. An executor receives a
//! [`ScenarioRuntime`], spawns virtual users through it, and decides when they must stop.
//! Workers accumulate a local [`OutcomeTally`] which is merged once they are done.
//!
//! # Stopping
//!
//! Two signals govern a virtual user:
//!
//! - **stop**: no new iterations. The iteration in flight finishes normally. Ramping
//!   executors raise it per user when the target shrinks, every other executor raises it
//!   for all users at once.
//! - **cancel**: raised by the runtime once the scenario's graceful-stop window expires.
//!   In-flight iterations are abandoned and recorded as cancelled.
//!
//! So a virtual user never outlives its stop condition plus the grace period.
//!
//! | profile              | stop condition                                   |
//! |----------------------|--------------------------------------------------|
//! | `ramping-vus`        | sum of stage durations                           |
//! | `constant-vus`       | `duration`                                       |
//! | `shared-iterations`  | pool exhausted, or `max_duration`                |
//! | `per-vu-iterations`  | every user ran `iterations`, or `max_duration`   |

pub mod constant;
pub mod iterations;
pub mod stage;

pub use constant::ConstantVus;
pub use iterations::{IterationPool, PerVuIterations, SharedIterations};
pub use stage::{RampingVus, Stage};

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use futures::future::{JoinAll, join_all};
use serde::{Deserialize, Serialize};
use tokio::task::{JoinError, JoinHandle};
use typed_builder::TypedBuilder;

use crate::{
    aggregate::{Aggregate, OutcomeTally},
    clock::{Clock, Shutdown, ShutdownTrigger},
    http::{Endpoints, Transport},
    metrics::Recorder,
    strategy::Strategy,
    vu::{ThinkTime, VuContext, VuIdentity, run_virtual_user},
};

/// Runs one scenario to completion and returns the merged tally of its virtual users.
pub trait Executor: Send + Sync {
    fn exec(&self, runtime: ScenarioRuntime) -> impl Future<Output = OutcomeTally> + Send;
}

/// Population-over-time profile, selected in the run profile by `executor`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "executor", rename_all = "kebab-case")]
pub enum PopulationProfile {
    RampingVus(RampingVus),
    ConstantVus(ConstantVus),
    SharedIterations(SharedIterations),
    PerVuIterations(PerVuIterations),
}

/// When a scenario stops starting new iterations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopCondition {
    Duration(Duration),
    TotalIterations { total: u64, max_duration: Duration },
    IterationsPerVu { per_vu: u64, max_duration: Duration },
}

impl StopCondition {
    /// Upper bound on how long the scenario keeps starting iterations.
    pub fn max_duration(&self) -> Duration {
        match self {
            StopCondition::Duration(d) => *d,
            StopCondition::TotalIterations { max_duration, .. }
            | StopCondition::IterationsPerVu { max_duration, .. } => *max_duration,
        }
    }
}

impl PopulationProfile {
    pub fn stop_condition(&self) -> StopCondition {
        match self {
            PopulationProfile::RampingVus(r) => StopCondition::Duration(r.total_duration()),
            PopulationProfile::ConstantVus(c) => StopCondition::Duration(c.duration),
            PopulationProfile::SharedIterations(s) => StopCondition::TotalIterations {
                total: s.iterations,
                max_duration: s.max_duration,
            },
            PopulationProfile::PerVuIterations(p) => StopCondition::IterationsPerVu {
                per_vu: p.iterations,
                max_duration: p.max_duration,
            },
        }
    }

    /// The most virtual users the profile ever runs at once.
    pub fn max_vus(&self) -> usize {
        match self {
            PopulationProfile::RampingVus(r) => r
                .stages
                .iter()
                .map(|s| s.target)
                .chain([r.start_vus])
                .max()
                .unwrap_or(0),
            PopulationProfile::ConstantVus(c) => c.vus,
            PopulationProfile::SharedIterations(s) => s.vus,
            PopulationProfile::PerVuIterations(p) => p.vus,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PopulationProfile::RampingVus(_) => "ramping-vus",
            PopulationProfile::ConstantVus(_) => "constant-vus",
            PopulationProfile::SharedIterations(_) => "shared-iterations",
            PopulationProfile::PerVuIterations(_) => "per-vu-iterations",
        }
    }
}

impl Executor for PopulationProfile {
    async fn exec(&self, runtime: ScenarioRuntime) -> OutcomeTally {
        match self {
            PopulationProfile::RampingVus(e) => e.exec(runtime).await,
            PopulationProfile::ConstantVus(e) => e.exec(runtime).await,
            PopulationProfile::SharedIterations(e) => e.exec(runtime).await,
            PopulationProfile::PerVuIterations(e) => e.exec(runtime).await,
        }
    }
}

/// Decides whether a virtual user may start another iteration.
#[derive(Clone, Debug)]
pub enum IterationGate {
    Unbounded,
    PerVu { remaining: u64 },
    Shared(Arc<IterationPool>),
}

impl IterationGate {
    pub fn claim(&mut self) -> bool {
        match self {
            IterationGate::Unbounded => true,
            IterationGate::PerVu { remaining } => match remaining.checked_sub(1) {
                Some(left) => {
                    *remaining = left;
                    true
                }
                None => false,
            },
            IterationGate::Shared(pool) => pool.try_claim(),
        }
    }
}

pub(crate) type Workers = Pin<Box<JoinAll<JoinHandle<OutcomeTally>>>>;

pub(crate) fn workers(handles: Vec<JoinHandle<OutcomeTally>>) -> Workers {
    Box::pin(join_all(handles))
}

/// Everything an executor needs to spawn the virtual users of one scenario.
#[derive(TypedBuilder)]
pub struct ScenarioRuntime {
    #[builder(setter(into))]
    name: Arc<str>,
    strategy: Arc<Strategy>,
    think_time: ThinkTime,
    #[builder(default = Duration::from_secs(30))]
    graceful_stop: Duration,
    transport: Arc<dyn Transport>,
    endpoints: Arc<Endpoints>,
    recorder: Recorder,
    clock: Arc<dyn Clock>,
    #[builder(default)]
    seed: Option<u64>,
    #[builder(default = Shutdown::new().0, setter(skip))]
    cancel: ShutdownTrigger,
    #[builder(default, setter(skip))]
    next_slot: usize,
}

impl ScenarioRuntime {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Virtual users spawned so far. Slots are never reused.
    pub fn spawned(&self) -> usize {
        self.next_slot
    }

    pub fn spawn_vu(&mut self, gate: IterationGate, stop: Shutdown) -> JoinHandle<OutcomeTally> {
        let identity = VuIdentity {
            scenario: self.name.clone(),
            slot: self.next_slot,
            iteration: 0,
        };
        self.next_slot += 1;

        let ctx = VuContext::new(
            identity,
            self.transport.clone(),
            self.endpoints.clone(),
            self.recorder.clone(),
            self.clock.clone(),
            self.cancel.subscribe(),
            self.seed,
        );
        tokio::spawn(run_virtual_user(
            ctx,
            self.strategy.clone(),
            self.think_time,
            gate,
            stop,
        ))
    }

    /// Waits for every worker, giving up after `limit`.
    pub(crate) async fn wait_for(
        &self,
        workers: &mut Workers,
        limit: Duration,
    ) -> Option<Vec<Result<OutcomeTally, JoinError>>> {
        tokio::select! {
            results = workers => Some(results),
            _ = self.clock.sleep(limit) => None,
        }
    }

    /// Call once stop has been raised: waits out the graceful-stop window, then cancels
    /// whatever is still running.
    pub(crate) async fn drain(&self, mut workers: Workers) -> OutcomeTally {
        let results = match self.wait_for(&mut workers, self.graceful_stop).await {
            Some(results) => results,
            None => {
                tracing::warn!(
                    "Scenario {}: graceful stop of {:?} expired, cancelling in-flight iterations",
                    self.name,
                    self.graceful_stop
                );
                self.cancel.trigger();
                workers.await
            }
        };
        merge(results)
    }
}

pub(crate) fn merge(results: Vec<Result<OutcomeTally, JoinError>>) -> OutcomeTally {
    let mut total = OutcomeTally::new();
    for tally in results.into_iter().map(|res| match res {
        Ok(tally) => tally,
        Err(e) => {
            tracing::error!("Virtual user panicked with error: {e}");
            // keep what the other users collected
            OutcomeTally::new()
        }
    }) {
        total.merge(tally);
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_vu_gate_runs_exactly_n() {
        let mut gate = IterationGate::PerVu { remaining: 3 };
        let claimed = (0..10).filter(|_| gate.claim()).count();
        assert_eq!(claimed, 3);
    }

    #[test]
    fn profiles_parse_by_executor_name() {
        let p: PopulationProfile = toml::from_str(
            r#"
            executor = "ramping-vus"
            stages = [
                { duration = "10s", target = 100 },
                { duration = "30s", target = 300 },
                { duration = "10s", target = 0 },
            ]
            "#,
        )
        .unwrap();
        assert_eq!(
            p.stop_condition(),
            StopCondition::Duration(Duration::from_secs(50))
        );
        assert_eq!(p.max_vus(), 300);

        let p: PopulationProfile = toml::from_str(
            r#"
            executor = "shared-iterations"
            vus = 200
            iterations = 1000
            max_duration = "2m"
            "#,
        )
        .unwrap();
        assert_eq!(
            p.stop_condition(),
            StopCondition::TotalIterations {
                total: 1000,
                max_duration: Duration::from_secs(120)
            }
        );
    }

    #[test]
    fn iteration_profiles_default_to_ten_minutes() {
        let p: PopulationProfile = toml::from_str(
            r#"
            executor = "per-vu-iterations"
            vus = 100
            iterations = 10
            "#,
        )
        .unwrap();
        assert_eq!(p.stop_condition().max_duration(), Duration::from_secs(600));
        assert_eq!(p.name(), "per-vu-iterations");
    }
}
