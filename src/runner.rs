use std::sync::Arc;

use typed_builder::TypedBuilder;

use crate::{
    clock::{Clock, TokioClock},
    config::RunProfile,
    error::RunError,
    http::{Endpoints, Transport},
    metrics::Registry,
    report::Summary,
    scheduler::Scheduler,
    setup::{setup, teardown},
};

/// Glues a run profile to a transport: setup, scenarios, teardown, summary.
///
/// ```rust,no_run
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// use std::sync::Arc;
/// use couponstorm::{Runner, config::RunProfile, http::ReqwestTransport};
///
/// let summary = Runner::builder()
///     .profile(RunProfile::load("profiles/db-lock.toml")?)
///     .transport(Arc::new(ReqwestTransport::default()))
///     .build()
///     .run()
///     .await?;
/// println!("{summary}");
/// # Ok(())
/// # }
/// ```
#[derive(TypedBuilder)]
pub struct Runner {
    profile: RunProfile,
    transport: Arc<dyn Transport>,
    #[builder(default = Arc::new(TokioClock))]
    clock: Arc<dyn Clock>,
}

impl Runner {
    pub fn profile(&self) -> &RunProfile {
        &self.profile
    }

    pub async fn run(&self) -> Result<Summary, RunError> {
        let specs = self.profile.scenario_specs()?;
        let thresholds = self.profile.thresholds()?;
        let settings = &self.profile.run;
        let endpoints = Arc::new(Endpoints::new(settings.base_url.as_str()));

        tracing::info!(
            "Setting up {} policies against {}",
            self.profile.policies.len(),
            endpoints.base_url()
        );
        setup(
            self.transport.as_ref(),
            &endpoints,
            settings,
            &self.profile.policies,
        )
        .await?;

        let registry = Arc::new(Registry::new());
        let scheduler = Scheduler::builder()
            .scenarios(specs)
            .transport(self.transport.clone())
            .endpoints(endpoints.clone())
            .registry(registry.clone())
            .clock(self.clock.clone())
            .seed(settings.seed)
            .build();
        tracing::info!(
            "Running {} scenarios, at most {:?}",
            self.profile.scenarios.len(),
            self.profile.max_runtime()
        );
        let outcomes = scheduler.run().await;

        registry.freeze();
        let snapshot = registry.snapshot();
        let supply = teardown(
            self.transport.as_ref(),
            &endpoints,
            settings,
            &self.profile.policies,
            &snapshot,
        )
        .await;

        let summary = Summary::build(&outcomes, &snapshot, &thresholds, supply);
        if summary.passed {
            tracing::info!("Run passed");
        } else {
            tracing::warn!(
                "Run failed: {} thresholds violated",
                summary.failed_thresholds().count()
            );
        }
        Ok(summary)
    }
}
