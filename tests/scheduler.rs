mod common;

use std::{sync::Arc, time::Duration};

use common::{BASE_URL, CouponService, Scripted, data, reply};
use couponstorm::{
    ScenarioSpec, Scheduler,
    executor::{
        ConstantVus, PerVuIterations, PopulationProfile, RampingVus, SharedIterations, Stage,
    },
    http::{Endpoints, Method, Transport},
    metric::names,
    metrics::Registry,
    outcome::ProtocolOutcome,
    poll::PollConfig,
    scheduler::ScenarioOutcome,
    strategy::{EventPoll, Strategy, SyncLock},
    vu::ThinkTime,
};
use serde_json::json;

async fn run(
    transport: Arc<dyn Transport>,
    scenarios: Vec<ScenarioSpec>,
) -> (Vec<ScenarioOutcome>, Arc<Registry>) {
    let registry = Arc::new(Registry::new());
    let outcomes = Scheduler::builder()
        .scenarios(scenarios)
        .transport(transport)
        .endpoints(Arc::new(Endpoints::new(BASE_URL)))
        .registry(registry.clone())
        .seed(Some(7))
        .build()
        .run()
        .await;
    (outcomes, registry)
}

fn sync_issue() -> Strategy {
    Strategy::SyncLock(SyncLock::default())
}

fn always_issued() -> Arc<Scripted> {
    Scripted::new(|_| reply(200, data(json!({}))))
}

#[tokio::test(start_paused = true)]
async fn in_flight_iterations_are_cancelled_after_graceful_stop() {
    let transport = Scripted::new(|request| match request.method {
        Method::Post => reply(202, data(json!({ "requestId": "R" }))),
        Method::Get => reply(404, ""),
    });
    let spec = ScenarioSpec::builder()
        .name("stuck_consumer")
        .profile(PopulationProfile::ConstantVus(
            ConstantVus::builder()
                .vus(2)
                .duration(Duration::from_secs(5))
                .build(),
        ))
        .strategy(Strategy::EventPoll(EventPoll {
            poll: PollConfig {
                interval: Duration::from_secs(2),
                max_polls: 15,
            },
            ..EventPoll::default()
        }))
        .graceful_stop(Duration::from_secs(1))
        .build();

    let (outcomes, registry) = run(transport, vec![spec]).await;

    let tally = &outcomes[0].tally;
    assert_eq!(tally.get(ProtocolOutcome::Cancelled), 2);
    assert_eq!(tally.completed(), 0);
    assert_eq!(tally.failure_rate(), None);
    // five seconds of load plus one of grace
    let ran_for = outcomes[0].ran_for;
    assert!(ran_for >= Duration::from_secs(6) && ran_for < Duration::from_millis(6_100));

    let snapshot = registry.snapshot();
    assert_eq!(snapshot.sink(names::ITERATIONS_CANCELLED).unwrap().count(), 2);
    assert!(snapshot.sink(names::ITERATION_FAILED).is_none());
}

#[tokio::test(start_paused = true)]
async fn ramping_never_reuses_slots() {
    let spec = ScenarioSpec::builder()
        .name("ramp")
        .profile(PopulationProfile::RampingVus(
            RampingVus::builder()
                .stages(vec![
                    Stage::new(Duration::from_secs(10), 4),
                    Stage::new(Duration::from_secs(10), 0),
                ])
                .build(),
        ))
        .strategy(sync_issue())
        .think_time(ThinkTime::secs_f64(0.5, 0.5))
        .build();

    let (outcomes, registry) = run(always_issued(), vec![spec]).await;

    let outcome = &outcomes[0];
    assert_eq!(outcome.executor, "ramping-vus");
    assert_eq!(outcome.tally.vus, 4);
    assert!(outcome.tally.completed() > 0);
    assert_eq!(outcome.tally.get(ProtocolOutcome::Cancelled), 0);
    assert_eq!(
        registry.snapshot().sink(names::ITERATIONS).unwrap().count(),
        outcome.tally.completed()
    );
}

#[tokio::test(start_paused = true)]
async fn iteration_profiles_run_exactly_their_budget() {
    let shared = ScenarioSpec::builder()
        .name("shared")
        .profile(PopulationProfile::SharedIterations(
            SharedIterations::builder().vus(5).iterations(20).build(),
        ))
        .strategy(sync_issue())
        .think_time(ThinkTime::NONE)
        .build();
    let per_vu = ScenarioSpec::builder()
        .name("per_vu")
        .profile(PopulationProfile::PerVuIterations(
            PerVuIterations::builder().vus(3).iterations(4).build(),
        ))
        .strategy(sync_issue())
        .think_time(ThinkTime::NONE)
        .build();

    let (outcomes, registry) = run(always_issued(), vec![shared, per_vu]).await;

    assert_eq!(outcomes[0].name, "shared");
    assert_eq!(outcomes[0].tally.completed(), 20);
    assert_eq!(outcomes[0].tally.vus, 5);
    assert_eq!(outcomes[1].tally.completed(), 12);
    assert_eq!(outcomes[1].tally.get(ProtocolOutcome::Success), 12);

    let snapshot = registry.snapshot();
    let per_scenario = |name: &str| {
        snapshot
            .sink_where(names::ITERATIONS, |tags| {
                tags.get("scenario").map(String::as_str) == Some(name)
            })
            .map(|s| s.count())
    };
    assert_eq!(per_scenario("shared"), Some(20));
    assert_eq!(per_scenario("per_vu"), Some(12));
}

#[tokio::test(start_paused = true)]
async fn scenarios_start_on_their_offsets() {
    let service = CouponService::new(1).with_policy("DB_LOCK_TEST_100", 100);
    let scenario = |name: &str, offset: u64| {
        ScenarioSpec::builder()
            .name(name)
            .profile(PopulationProfile::PerVuIterations(
                PerVuIterations::builder().vus(2).iterations(1).build(),
            ))
            .strategy(sync_issue())
            .start_offset(Duration::from_secs(offset))
            .think_time(ThinkTime::NONE)
            .build()
    };

    let (outcomes, _) = run(
        service.clone(),
        vec![scenario("first", 0), scenario("second", 5)],
    )
    .await;

    assert_eq!(outcomes[0].started_after, Duration::ZERO);
    assert!(outcomes[1].started_after >= Duration::from_secs(5));
    assert!(outcomes[1].started_after < Duration::from_millis(5_100));
    assert_eq!(service.count("issue-sync"), 4);
    assert!(service.issued("DB_LOCK_TEST_100") <= 4);
}
