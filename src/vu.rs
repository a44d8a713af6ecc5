//! Virtual users: identity, per-user context and the iteration loop.

use std::{
    fmt,
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
    time::Duration,
};

use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    aggregate::{Aggregate, OutcomeTally},
    clock::{Cancelled, Clock, Shutdown},
    executor::IterationGate,
    http::{Endpoints, Request, Response, Transport, TransportError},
    metric::names,
    metrics::Recorder,
    outcome::{ProtocolOutcome, ProtocolResult},
    strategy::Strategy,
};

/// `(scenario, slot, iteration)`: unique for the lifetime of a run.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VuIdentity {
    pub scenario: Arc<str>,
    pub slot: usize,
    pub iteration: u64,
}

impl fmt::Display for VuIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}:{}", self.scenario, self.slot, self.iteration)
    }
}

/// Uniform pause between iterations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkTime {
    #[serde(with = "humantime_serde")]
    pub min: Duration,
    #[serde(with = "humantime_serde")]
    pub max: Duration,
}

impl ThinkTime {
    pub const NONE: ThinkTime = ThinkTime {
        min: Duration::ZERO,
        max: Duration::ZERO,
    };

    pub const fn secs_f64(min: f64, max: f64) -> Self {
        Self {
            min: Duration::from_millis((min * 1000.0) as u64),
            max: Duration::from_millis((max * 1000.0) as u64),
        }
    }

    pub fn sample(&self, rng: &mut impl Rng) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        rng.random_range(self.min..=self.max)
    }
}

/// HTTP access for protocols: the shared transport plus request metrics.
#[derive(Clone)]
pub struct Http {
    transport: Arc<dyn Transport>,
    recorder: Recorder,
}

impl Http {
    pub fn new(transport: Arc<dyn Transport>, recorder: Recorder) -> Self {
        Self {
            transport,
            recorder,
        }
    }

    /// Sends `request`, recording `http_reqs`, `http_req_duration` and `http_req_failed`.
    pub async fn send(&self, request: Request) -> Result<Response, TransportError> {
        let timeout = request.timeout;
        let result = self.transport.send(request).await;

        self.recorder.count(names::HTTP_REQS, 1);
        match &result {
            Ok(response) => {
                self.recorder
                    .trend(names::HTTP_REQ_DURATION, response.latency);
                self.recorder
                    .rate(names::HTTP_REQ_FAILED, response.status >= 400);
            }
            Err(e) => {
                if e.is_timeout() {
                    self.recorder.trend(names::HTTP_REQ_DURATION, timeout);
                }
                self.recorder.rate(names::HTTP_REQ_FAILED, true);
            }
        }
        result
    }
}

/// Everything one virtual user needs to run a protocol.
pub struct VuContext {
    pub identity: VuIdentity,
    http: Http,
    endpoints: Arc<Endpoints>,
    recorder: Recorder,
    clock: Arc<dyn Clock>,
    cancel: Shutdown,
    rng: SmallRng,
}

impl VuContext {
    pub fn new(
        identity: VuIdentity,
        transport: Arc<dyn Transport>,
        endpoints: Arc<Endpoints>,
        recorder: Recorder,
        clock: Arc<dyn Clock>,
        cancel: Shutdown,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(derive_seed(seed, &identity)),
            None => SmallRng::from_os_rng(),
        };
        Self {
            identity,
            http: Http::new(transport, recorder.clone()),
            endpoints,
            recorder,
            clock,
            cancel,
            rng,
        }
    }

    pub fn http(&self) -> &Http {
        &self.http
    }

    pub fn endpoints(&self) -> &Arc<Endpoints> {
        &self.endpoints
    }

    pub fn metrics(&self) -> &Recorder {
        &self.recorder
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// The scenario's hard-cancel signal.
    pub fn cancel_signal(&self) -> Shutdown {
        self.cancel.clone()
    }

    pub async fn sleep(&mut self, duration: Duration) -> Result<(), Cancelled> {
        self.cancel.sleep(self.clock.as_ref(), duration).await
    }

    /// A user id in `1..=range`.
    pub fn random_user(&mut self, range: u64) -> u64 {
        self.rng.random_range(1..=range.max(1))
    }

    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Counts a coupon this client saw being issued, for the supply check.
    pub fn observe_issued(&self, code: &str) {
        self.recorder
            .count_tagged(names::ISSUED_OBSERVED, 1, &[("code", code)]);
    }
}

fn derive_seed(seed: u64, identity: &VuIdentity) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    identity.scenario.hash(&mut hasher);
    identity.slot.hash(&mut hasher);
    hasher.finish()
}

/// Records the per-iteration built-in metrics for `result`.
pub(crate) fn record_outcome(recorder: &Recorder, result: &ProtocolResult) {
    recorder.count_tagged(
        names::PROTOCOL_OUTCOME,
        1,
        &[("outcome", result.outcome.as_str())],
    );
    match result.outcome.is_failure() {
        Some(failed) => {
            recorder.count(names::ITERATIONS, 1);
            recorder.rate(names::ITERATION_FAILED, failed);
        }
        None => recorder.count(names::ITERATIONS_CANCELLED, 1),
    }
}

/// Runs iterations of `strategy` until the gate closes, `stop` fires, or the context's
/// cancel signal fires.
///
/// `stop` is graceful: the current iteration always finishes. Cancellation abandons the
/// in-flight iteration and reports it as [`ProtocolOutcome::Cancelled`].
pub async fn run_virtual_user(
    mut ctx: VuContext,
    strategy: Arc<Strategy>,
    think_time: ThinkTime,
    mut gate: IterationGate,
    mut stop: Shutdown,
) -> OutcomeTally {
    let mut tally = OutcomeTally::new();
    let mut cancel = ctx.cancel_signal();
    tally.vus = 1;
    tracing::debug!("Virtual user {} started", ctx.identity);

    loop {
        if stop.is_triggered() || cancel.is_triggered() || !gate.claim() {
            break;
        }

        let result = tokio::select! {
            biased;
            _ = cancel.triggered() => ProtocolResult::cancelled(),
            result = strategy.run_once(&mut ctx) => result,
        };
        if let Some(detail) = &result.detail {
            tracing::debug!("{} -> {} ({detail})", ctx.identity, result.outcome);
        }
        record_outcome(ctx.metrics(), &result);
        tally.consume(&result);
        ctx.identity.iteration += 1;

        if result.outcome == ProtocolOutcome::Cancelled {
            break;
        }

        let pause = think_time.sample(ctx.rng());
        tokio::select! {
            slept = ctx.sleep(pause) => if slept.is_err() { break },
            _ = stop.triggered() => break,
        }
    }

    tracing::debug!(
        "Virtual user {}#{} finished after {} iterations",
        ctx.identity.scenario,
        ctx.identity.slot,
        ctx.identity.iteration
    );
    tally
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn think_time_samples_within_bounds() {
        let think = ThinkTime::secs_f64(1.0, 3.0);
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..1000 {
            let d = think.sample(&mut rng);
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(3));
        }
    }

    #[test]
    fn degenerate_think_time_returns_min() {
        let think = ThinkTime {
            min: Duration::from_secs(2),
            max: Duration::from_secs(1),
        };
        let mut rng = SmallRng::seed_from_u64(7);
        assert_eq!(think.sample(&mut rng), Duration::from_secs(2));
        assert_eq!(ThinkTime::NONE.sample(&mut rng), Duration::ZERO);
    }

    #[test]
    fn seeds_differ_per_slot() {
        let a = VuIdentity {
            scenario: Arc::from("s"),
            slot: 0,
            iteration: 0,
        };
        let b = VuIdentity { slot: 1, ..a.clone() };
        assert_ne!(derive_seed(1, &a), derive_seed(1, &b));
        assert_eq!(derive_seed(1, &a), derive_seed(1, &a));
    }

    #[test]
    fn identity_display() {
        let id = VuIdentity {
            scenario: Arc::from("burst"),
            slot: 3,
            iteration: 9,
        };
        assert_eq!(id.to_string(), "burst#3:9");
    }
}
