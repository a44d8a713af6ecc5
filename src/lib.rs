//! Couponstorm drives concurrent load against a coupon issuance service and checks that
//! it stays consistent while doing so.
//!
//! The service under test offers several concurrency-control strategies (a distributed
//! lock, optimistic locking, an event pipeline and a queue). Each has its own client
//! contract, and couponstorm speaks every one of them: it classifies answers into
//! success, sold-out, conflict and the like, retries with backoff or polls until a
//! terminal result, and records what it saw.
//!
//! # Architecture
//!
//! From the leaves up:
//!
//! - [`http`]: one request in, status/body/latency out, behind the [`http::Transport`]
//!   trait.
//! - [`metrics`]: the process-wide [`metrics::Registry`] of counter, rate and trend sinks.
//! - [`retry`] and [`poll`]: the pure backoff decision and the bounded polling loop.
//! - [`strategy`]: one client state machine per concurrency-control strategy.
//! - [`executor`]: population profiles that spawn and stop virtual users.
//! - [`Scheduler`]: runs several [`ScenarioSpec`]s concurrently on staggered offsets.
//! - [`Runner`]: setup, scheduling, teardown and the final [`Summary`].
//!
//! Runs are normally described by a TOML profile (see [`config`]) and started from the
//! `couponstorm` binary:
//!
//! ```text
//! couponstorm run -P profiles/db-lock.toml
//! couponstorm check -P profiles/kafka-event.toml
//! ```
//!
//! # Waiting and cancellation
//!
//! Every sleep (poll interval, backoff delay, think time) goes through an injected
//! [`clock::Clock`] and checks a [`clock::Shutdown`] signal, so a run stops promptly and
//! tests can drive multi-minute scenarios on tokio's paused clock.

/// Per-scenario outcome tallies
pub mod aggregate;
/// Time source and shutdown signals
pub mod clock;
/// TOML run profiles
pub mod config;
pub mod error;
/// Population profiles that drive virtual users
pub mod executor;
/// HTTP interaction layer
pub mod http;
/// Single metric samples and sink names
pub mod metric;
/// The shared sink registry
pub mod metrics;
/// Attempt classifications and protocol outcomes
pub mod outcome;
pub mod poll;
/// Reports and Reporters
pub mod report;
pub mod retry;
pub mod runner;
pub mod scenario;
pub mod scheduler;
pub mod setup;
/// Client protocols, one per concurrency-control strategy
pub mod strategy;
pub mod threshold;
/// Virtual users
pub mod vu;

pub use aggregate::Aggregate;
pub use config::RunProfile;
pub use executor::{Executor, PopulationProfile};
pub use report::{Report, Reporter, Summary};
pub use runner::Runner;
pub use scenario::ScenarioSpec;
pub use scheduler::Scheduler;
pub use strategy::Strategy;

/// Procedural macros to reduce boilerplate
pub mod macros {
    pub use couponstorm_macros::*;
}
