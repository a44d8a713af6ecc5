//! Runs a set of scenarios concurrently, each on its own start offset.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    aggregate::OutcomeTally,
    clock::{Clock, TokioClock},
    executor::{Executor, ScenarioRuntime},
    http::{Endpoints, Transport},
    metrics::{Recorder, Registry},
    outcome::ProtocolOutcome,
    scenario::ScenarioSpec,
};

/// What one scenario produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScenarioOutcome {
    pub name: String,
    pub executor: String,
    pub strategy: String,
    pub tally: OutcomeTally,
    #[serde(with = "humantime_serde")]
    pub started_after: Duration,
    #[serde(with = "humantime_serde")]
    pub ran_for: Duration,
}

#[derive(TypedBuilder)]
pub struct Scheduler {
    pub scenarios: Vec<ScenarioSpec>,
    pub transport: Arc<dyn Transport>,
    pub endpoints: Arc<Endpoints>,
    pub registry: Arc<Registry>,
    #[builder(default = Arc::new(TokioClock))]
    pub clock: Arc<dyn Clock>,
    /// Seeds every virtual user's RNG for reproducible user-id sequences.
    #[builder(default)]
    pub seed: Option<u64>,
}

impl Scheduler {
    /// Starts every scenario after its offset and waits for all of them.
    ///
    /// Scenarios share nothing but the transport and the metric registry.
    pub async fn run(&self) -> Vec<ScenarioOutcome> {
        let run_start = self.clock.now();
        let scenarios = self.scenarios.iter().map(|spec| async move {
            self.clock.sleep(spec.start_offset).await;
            let started_after = self.clock.now().duration_since(run_start);
            tracing::info!(
                "Starting scenario {} ({} / {}) after {started_after:?}",
                spec.name,
                spec.profile.name(),
                spec.strategy.kind()
            );

            let runtime = ScenarioRuntime::builder()
                .name(spec.name.as_str())
                .strategy(Arc::new(spec.strategy.clone()))
                .think_time(spec.think_time())
                .graceful_stop(spec.graceful_stop)
                .transport(self.transport.clone())
                .endpoints(self.endpoints.clone())
                .recorder(Recorder::new(self.registry.clone(), spec.metric_tags()))
                .clock(self.clock.clone())
                .seed(self.seed)
                .build();
            let tally = spec.profile.exec(runtime).await;

            let ran_for = self.clock.now().duration_since(run_start) - started_after;
            tracing::info!(
                "Scenario {} finished after {ran_for:?}: {} iterations, {} cancelled",
                spec.name,
                tally.completed(),
                tally.get(ProtocolOutcome::Cancelled)
            );
            ScenarioOutcome {
                name: spec.name.clone(),
                executor: spec.profile.name().to_string(),
                strategy: spec.strategy.kind().to_string(),
                tally,
                started_after,
                ran_for,
            }
        });
        join_all(scenarios).await
    }
}
