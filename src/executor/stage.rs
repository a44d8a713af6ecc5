//! Ramping virtual-user executor.
//!
//! A governor ticks every `tick` (100ms by default) and moves the number of active
//! virtual users toward the current stage's target. Within a stage of length `duration`
//! ramping from `start` to `end` users, the target at `elapsed` is a linear
//! interpolation:
//!
//! ```text
//! t = elapsed / duration
//! target(t) = round(start + (end - start) * t)
//! ```
//!
//! A stage with a zero duration jumps to its target immediately, which makes spikes and
//! non-zero starting points expressible with the same list of stages.
//!
//! Scaling up spawns users in fresh slots. Scaling down raises the stop signal of the
//! most recently spawned users; they finish the iteration in flight and exit, so no user
//! is killed mid-protocol by a ramp-down.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use typed_builder::TypedBuilder;

use super::{Executor, IterationGate, ScenarioRuntime, workers};
use crate::{
    aggregate::OutcomeTally,
    clock::{Shutdown, ShutdownTrigger},
};

/// Ramp to `target` virtual users over `duration`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct RampingVus {
    #[serde(default)]
    #[builder(default)]
    pub start_vus: usize,
    pub stages: Vec<Stage>,
    #[serde(default = "default_tick", with = "humantime_serde")]
    #[builder(default = default_tick())]
    pub tick: Duration,
}

fn default_tick() -> Duration {
    Duration::from_millis(100)
}

impl RampingVus {
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }
}

/// Active user count for `elapsed` into a stage ramping from `start` to `end`.
pub fn calc_target_vus(
    elapsed: Duration,
    stage_duration: Duration,
    start: usize,
    end: usize,
) -> usize {
    if stage_duration.is_zero() {
        return end;
    }
    // interpolation factor [0..1]
    let t = (elapsed.as_secs_f64() / stage_duration.as_secs_f64()).min(1.0);
    let target = start as f64 + (end as f64 - start as f64) * t;
    target.round().max(0.0) as usize
}

struct ActiveVu {
    stop: ShutdownTrigger,
    handle: JoinHandle<OutcomeTally>,
}

/// The governor's view of the population.
struct Population {
    active: Vec<ActiveVu>,
    retired: Vec<JoinHandle<OutcomeTally>>,
}

impl Population {
    fn scale_to(&mut self, runtime: &mut ScenarioRuntime, target: usize) {
        while self.active.len() < target {
            let (stop, rx) = Shutdown::new();
            let handle = runtime.spawn_vu(IterationGate::Unbounded, rx);
            self.active.push(ActiveVu { stop, handle });
        }
        while self.active.len() > target {
            if let Some(vu) = self.active.pop() {
                vu.stop.trigger();
                self.retired.push(vu.handle);
            }
        }
    }

    fn stop_all(mut self) -> Vec<JoinHandle<OutcomeTally>> {
        for vu in self.active.drain(..) {
            vu.stop.trigger();
            self.retired.push(vu.handle);
        }
        self.retired
    }
}

impl Executor for RampingVus {
    async fn exec(&self, mut runtime: ScenarioRuntime) -> OutcomeTally {
        let clock = runtime.clock().clone();
        let mut population = Population {
            active: vec![],
            retired: vec![],
        };
        let mut current = self.start_vus;
        population.scale_to(&mut runtime, current);

        for (i, stage) in self.stages.iter().enumerate() {
            tracing::info!(
                "Scenario {}: stage {} ramping {current} -> {} VUs over {:?}",
                runtime.name(),
                i + 1,
                stage.target,
                stage.duration
            );
            // instantly jump to target
            if stage.duration.is_zero() {
                population.scale_to(&mut runtime, stage.target);
                current = stage.target;
                continue;
            }

            let stage_start = clock.now();
            loop {
                let elapsed = clock.now().duration_since(stage_start);
                if elapsed >= stage.duration {
                    break;
                }
                let target = calc_target_vus(elapsed, stage.duration, current, stage.target);
                population.scale_to(&mut runtime, target);
                clock.sleep(self.tick.min(stage.duration - elapsed)).await;
            }
            // land exactly on the target so the next stage starts from the right point
            population.scale_to(&mut runtime, stage.target);
            current = stage.target;
        }

        tracing::info!(
            "Scenario {}: stages finished after spawning {} VUs, draining",
            runtime.name(),
            runtime.spawned()
        );
        let handles = population.stop_all();
        runtime.drain(workers(handles)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod calc_target_vus {
        use super::*;

        #[test]
        fn ramp_up() {
            let stage_duration = Duration::from_secs(10);
            for i in 0..10 {
                let elapsed = Duration::from_secs(i);
                assert_eq!(calc_target_vus(elapsed, stage_duration, 0, 100), (i * 10) as usize);
            }
        }

        #[test]
        fn ramp_down() {
            let stage_duration = Duration::from_secs(10);
            for i in 0..=10 {
                let elapsed = Duration::from_secs(i);
                assert_eq!(
                    calc_target_vus(elapsed, stage_duration, 100, 0),
                    (100 - i * 10) as usize
                );
            }
        }

        #[test]
        fn hold_steady() {
            for i in 0..10 {
                assert_eq!(
                    calc_target_vus(Duration::from_secs(i), Duration::from_secs(10), 50, 50),
                    50
                );
            }
        }

        #[test]
        fn elapsed_over_duration_caps_at_end() {
            for i in 10..20 {
                assert_eq!(
                    calc_target_vus(Duration::from_secs(i), Duration::from_secs(10), 0, 300),
                    300
                );
            }
        }

        #[test]
        fn zero_duration_jumps_to_end() {
            assert_eq!(calc_target_vus(Duration::ZERO, Duration::ZERO, 5, 80), 80);
        }

        #[test]
        fn fractional_targets_round() {
            // 1/3 of the way from 0 to 10
            assert_eq!(
                calc_target_vus(Duration::from_secs(1), Duration::from_secs(3), 0, 10),
                3
            );
            assert_eq!(
                calc_target_vus(Duration::from_secs(2), Duration::from_secs(3), 0, 10),
                7
            );
        }
    }

    #[test]
    fn total_duration_sums_stages() {
        let ramp = RampingVus::builder()
            .stages(vec![
                Stage::new(Duration::from_secs(15), 200),
                Stage::new(Duration::ZERO, 400),
                Stage::new(Duration::from_secs(45), 0),
            ])
            .build();
        assert_eq!(ramp.total_duration(), Duration::from_secs(60));
        assert_eq!(ramp.tick, Duration::from_millis(100));
    }
}
