use std::{path::Path, time::Duration};

use couponstorm::{RunProfile, Strategy, executor::PopulationProfile};

fn load(name: &str) -> RunProfile {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("profiles").join(name);
    let profile = RunProfile::load(&path).unwrap();
    profile.validate().unwrap();
    profile
}

#[test]
fn db_lock_profile() {
    let profile = load("db-lock.toml");
    assert_eq!(profile.policies.len(), 3);
    assert_eq!(profile.thresholds().unwrap().len(), 4);

    let specs = profile.scenario_specs().unwrap();
    assert_eq!(specs[0].profile.max_vus(), 500);
    assert_eq!(specs[1].start_offset, Duration::from_secs(60));
    assert!(matches!(specs[2].strategy, Strategy::MultiCodeSync(_)));
    // deadlock simulation: 3m offset, 1m load, 30s grace
    assert_eq!(profile.max_runtime(), Duration::from_secs(270));
}

#[test]
fn kafka_event_profile() {
    let profile = load("kafka-event.toml");
    assert_eq!(profile.run.health_probes, vec!["/admin/kafka/health"]);
    let specs = profile.scenario_specs().unwrap();
    assert_eq!(specs.len(), 4);
    assert!(matches!(
        specs[1].profile,
        PopulationProfile::PerVuIterations(p) if p.vus == 100 && p.iterations == 10
    ));
    assert_eq!(specs[3].strategy.kind(), "partition-spread");
}

#[test]
fn redis_async_profile() {
    let profile = load("redis-async.toml");
    let specs = profile.scenario_specs().unwrap();
    let Strategy::QueuePoll(failover) = &specs[2].strategy else {
        panic!("failover scenario is not a queue poll");
    };
    assert!(!failover.follow);
    assert!(failover.failover.is_some());
    assert_eq!(
        profile.run.teardown_probes,
        vec!["/admin/redis/queue-status?code={code}"]
    );
}
