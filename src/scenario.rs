use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::{
    executor::{PopulationProfile, StopCondition},
    metric::Tags,
    strategy::Strategy,
    vu::ThinkTime,
};

/// An independently scheduled population profile bound to one strategy.
///
/// ```rust
/// use std::time::Duration;
/// use couponstorm::{
///     ScenarioSpec,
///     executor::{ConstantVus, PopulationProfile},
///     strategy::{Strategy, SyncLock},
/// };
///
/// let spec = ScenarioSpec::builder()
///     .name("deadlock_simulation")
///     .profile(PopulationProfile::ConstantVus(
///         ConstantVus::builder().vus(50).duration(Duration::from_secs(60)).build(),
///     ))
///     .strategy(Strategy::SyncLock(SyncLock::default()))
///     .start_offset(Duration::from_secs(180))
///     .build();
///
/// assert_eq!(spec.graceful_stop, Duration::from_secs(30));
/// ```
#[derive(Clone, Debug, PartialEq, TypedBuilder)]
pub struct ScenarioSpec {
    #[builder(setter(into))]
    pub name: String,
    pub profile: PopulationProfile,
    pub strategy: Strategy,
    #[builder(default)]
    pub start_offset: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub graceful_stop: Duration,
    #[builder(default)]
    pub tags: Tags,
    /// Falls back to the strategy's default when unset.
    #[builder(default, setter(strip_option))]
    pub think_time: Option<ThinkTime>,
}

impl ScenarioSpec {
    pub fn stop_condition(&self) -> StopCondition {
        self.profile.stop_condition()
    }

    pub fn think_time(&self) -> ThinkTime {
        self.think_time
            .unwrap_or_else(|| self.strategy.default_think_time())
    }

    /// Tags stamped on every sample the scenario emits.
    pub fn metric_tags(&self) -> Tags {
        let mut tags = self.tags.clone();
        tags.insert("scenario".to_string(), self.name.clone());
        tags
    }

    /// Latest point, relative to the run start, at which the scenario can still be active.
    pub fn deadline(&self) -> Duration {
        self.start_offset + self.stop_condition().max_duration() + self.graceful_stop
    }
}
