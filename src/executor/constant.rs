use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::{Executor, IterationGate, ScenarioRuntime, workers};
use crate::{aggregate::OutcomeTally, clock::Shutdown};

/// A fixed number of virtual users looping for a fixed duration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct ConstantVus {
    pub vus: usize,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl Executor for ConstantVus {
    async fn exec(&self, mut runtime: ScenarioRuntime) -> OutcomeTally {
        let (stop, _) = Shutdown::new();
        tracing::info!(
            "Scenario {}: holding {} VUs for {:?}",
            runtime.name(),
            self.vus,
            self.duration
        );
        let handles = (0..self.vus)
            .map(|_| runtime.spawn_vu(IterationGate::Unbounded, stop.subscribe()))
            .collect();

        let clock = runtime.clock().clone();
        clock.sleep(self.duration).await;
        stop.trigger();
        runtime.drain(workers(handles)).await
    }
}
