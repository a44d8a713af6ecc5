use std::{collections::BTreeMap, fmt::Debug, time::Duration};

use serde::{Serialize, de::DeserializeOwned};

use crate::outcome::{ProtocolOutcome, ProtocolResult};

/// Worker-local accumulator that is merged into a global view once every worker is done.
///
/// Each virtual user owns one instance and feeds it through [`consume`](Aggregate::consume)
/// without any synchronization. The scenario runtime merges them after the user finishes,
/// so `merge` must be associative and commutative.
///
/// Aggregates store raw, mergeable data only (counts and sums). Derived values such as
/// rates are computed when the summary is built.
pub trait Aggregate
where
    Self: Serialize + DeserializeOwned + PartialEq + Send + Sync + Debug + Clone,
{
    type Sample;

    fn new() -> Self;

    fn aggregate(&mut self, samples: &[Self::Sample]) {
        samples.iter().for_each(|s| self.consume(s));
    }

    fn consume(&mut self, sample: &Self::Sample);

    fn merge(&mut self, other: Self);
}

/// How many protocol executions ended in each [`ProtocolOutcome`].
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OutcomeTally {
    pub outcomes: BTreeMap<ProtocolOutcome, u64>,
    pub attempts: u64,
    pub polls: u64,
    /// Virtual users that contributed to this tally.
    pub vus: u64,
    #[serde(with = "humantime_serde")]
    pub busy: Duration,
}

impl OutcomeTally {
    pub fn get(&self, outcome: ProtocolOutcome) -> u64 {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }

    /// Executions that ran to an outcome, excluding cancelled ones.
    pub fn completed(&self) -> u64 {
        self.outcomes
            .iter()
            .filter(|(o, _)| **o != ProtocolOutcome::Cancelled)
            .map(|(_, n)| n)
            .sum()
    }

    pub fn failed(&self) -> u64 {
        self.outcomes
            .iter()
            .filter(|(o, _)| o.is_failure() == Some(true))
            .map(|(_, n)| n)
            .sum()
    }

    /// `failed / completed`, or `None` before anything completed.
    pub fn failure_rate(&self) -> Option<f64> {
        match self.completed() {
            0 => None,
            n => Some(self.failed() as f64 / n as f64),
        }
    }
}

impl Aggregate for OutcomeTally {
    type Sample = ProtocolResult;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, result: &ProtocolResult) {
        *self.outcomes.entry(result.outcome).or_insert(0) += 1;
        self.attempts += result.attempts as u64;
        self.polls += result.polls as u64;
        self.busy += result.elapsed;
    }

    fn merge(&mut self, other: Self) {
        for (outcome, n) in other.outcomes {
            *self.outcomes.entry(outcome).or_insert(0) += n;
        }
        self.attempts += other.attempts;
        self.polls += other.polls;
        self.vus += other.vus;
        self.busy += other.busy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results() -> Vec<ProtocolResult> {
        vec![
            ProtocolResult::new(ProtocolOutcome::Success).attempts(2),
            ProtocolResult::new(ProtocolOutcome::SoldOut).attempts(1),
            ProtocolResult::new(ProtocolOutcome::Timeout).polls(15),
            ProtocolResult::cancelled(),
        ]
    }

    #[test]
    fn consume_counts_outcomes_and_work() {
        let mut tally = OutcomeTally::new();
        tally.aggregate(&results());

        assert_eq!(tally.get(ProtocolOutcome::Success), 1);
        assert_eq!(tally.get(ProtocolOutcome::Cancelled), 1);
        assert_eq!(tally.attempts, 3);
        assert_eq!(tally.polls, 15);
        assert_eq!(tally.completed(), 3);
        assert_eq!(tally.failed(), 1);
        assert_eq!(tally.failure_rate(), Some(1.0 / 3.0));
    }

    #[test]
    fn merge_is_order_independent() {
        let rs = results();
        let mut a = OutcomeTally::new();
        a.aggregate(&rs[..2]);
        a.vus = 1;
        let mut b = OutcomeTally::new();
        b.aggregate(&rs[2..]);
        b.vus = 1;

        let mut ab = a.clone();
        ab.merge(b.clone());
        let mut ba = b;
        ba.merge(a);

        assert_eq!(ab, ba);
        assert_eq!(ab.vus, 2);
    }

    #[test]
    fn empty_tally_has_no_failure_rate() {
        assert_eq!(OutcomeTally::new().failure_rate(), None);
    }
}
