//! TOML run profiles.
//!
//! A profile names the service under test, the coupon policies to create before the run,
//! the scenarios to schedule and the thresholds that decide pass or fail:
//!
//! ```toml
//! [run]
//! base_url = "http://localhost:8080"
//! health_probes = ["/admin/kafka/health"]
//!
//! [[policies]]
//! code = "DB_LOCK_TEST_100"
//! max_count = 100
//! discount_rate = 10
//!
//! [[scenarios]]
//! name = "sync_lock_stress"
//! executor = "ramping-vus"
//! stages = [
//!   { duration = "10s", target = 100 },
//!   { duration = "10s", target = 0 },
//! ]
//! strategy = { kind = "sync-lock", code = "DB_LOCK_TEST_100" }
//!
//! [thresholds]
//! http_req_duration = ["p(95)<10000"]
//! coupon_data_consistency = ["rate>0.999"]
//! ```

use std::{
    collections::{BTreeMap, HashSet},
    path::Path,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    executor::PopulationProfile,
    metric::Tags,
    scenario::ScenarioSpec,
    strategy::Strategy,
    threshold::Threshold,
    vu::ThinkTime,
};

fn default_setup_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_graceful_stop() -> Duration {
    Duration::from_secs(30)
}

fn default_discount_rate() -> f64 {
    10.0
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    pub base_url: String,
    /// Seeds every virtual user's RNG. Unset means a fresh seed per run.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_setup_timeout", with = "humantime_serde")]
    pub setup_timeout: Duration,
    /// Queried before the run. Failures are only logged.
    #[serde(default)]
    pub health_probes: Vec<String>,
    /// Queried after the run. `{code}` expands to each policy code.
    #[serde(default)]
    pub teardown_probes: Vec<String>,
}

/// A coupon policy created during setup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub code: String,
    pub max_count: u64,
    #[serde(default = "default_discount_rate")]
    pub discount_rate: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub name: String,
    #[serde(default, with = "humantime_serde")]
    pub start_time: Duration,
    #[serde(default = "default_graceful_stop", with = "humantime_serde")]
    pub graceful_stop: Duration,
    #[serde(default)]
    pub think_time: Option<ThinkTime>,
    #[serde(default)]
    pub tags: Tags,
    #[serde(flatten)]
    pub profile: PopulationProfile,
    pub strategy: Strategy,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunProfile {
    pub run: RunSettings,
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
    pub scenarios: Vec<ScenarioConfig>,
    /// Sink name to the expressions that must hold on it.
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<String>>,
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

impl ScenarioConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let fail = |what: String| invalid(format!("scenario {}: {what}", self.name));
        match &self.profile {
            PopulationProfile::RampingVus(r) => {
                if r.stages.is_empty() {
                    return Err(fail("ramping-vus needs at least one stage".into()));
                }
                if r.tick.is_zero() {
                    return Err(fail("tick must be > 0".into()));
                }
            }
            PopulationProfile::ConstantVus(c) => {
                if c.vus == 0 || c.duration.is_zero() {
                    return Err(fail("vus and duration must be > 0".into()));
                }
            }
            PopulationProfile::SharedIterations(s) => {
                if s.vus == 0 || s.iterations == 0 {
                    return Err(fail("vus and iterations must be > 0".into()));
                }
            }
            PopulationProfile::PerVuIterations(p) => {
                if p.vus == 0 || p.iterations == 0 {
                    return Err(fail("vus and iterations must be > 0".into()));
                }
            }
        }

        if let Some(think) = self.think_time
            && think.min > think.max
        {
            return Err(fail(format!(
                "think_time min {:?} exceeds max {:?}",
                think.min, think.max
            )));
        }

        let codes = self.strategy.codes();
        if codes.is_empty() || codes.iter().any(|c| c.is_empty()) {
            return Err(fail("strategy needs a coupon code".into()));
        }
        if let Strategy::DuplicateBurst(b) = &self.strategy {
            if b.requests == 0 {
                return Err(fail("burst requests must be > 0".into()));
            }
            if b.user_stride == 0 {
                return Err(fail("burst user_stride must be > 0".into()));
            }
            let per_slot = match &self.profile {
                PopulationProfile::SharedIterations(s) => Some(s.iterations),
                PopulationProfile::PerVuIterations(p) => Some(p.iterations),
                _ => None,
            };
            if let Some(iterations) = per_slot
                && iterations > b.user_stride
            {
                return Err(fail(format!(
                    "{iterations} iterations would overrun burst user_stride {}",
                    b.user_stride
                )));
            }
        }
        Ok(())
    }

    pub fn to_spec(&self) -> ScenarioSpec {
        ScenarioSpec {
            name: self.name.clone(),
            profile: self.profile.clone(),
            strategy: self.strategy.clone(),
            start_offset: self.start_time,
            graceful_stop: self.graceful_stop,
            tags: self.tags.clone(),
            think_time: self.think_time,
        }
    }
}

impl RunProfile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let profile = Self::from_toml_str(&content)?;
        tracing::debug!(
            "Loaded profile {} with {} scenarios",
            path.display(),
            profile.scenarios.len()
        );
        Ok(profile)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Checks everything that can be checked without talking to the service.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.base_url.trim().is_empty() {
            return Err(invalid("run.base_url cannot be empty"));
        }
        if self.scenarios.is_empty() {
            return Err(invalid("at least one scenario must be defined"));
        }

        let mut names = HashSet::new();
        for scenario in &self.scenarios {
            if scenario.name.is_empty() {
                return Err(invalid("scenario names cannot be empty"));
            }
            if !names.insert(scenario.name.as_str()) {
                return Err(invalid(format!("duplicate scenario name {}", scenario.name)));
            }
            scenario.validate()?;
        }

        let mut codes = HashSet::new();
        for policy in &self.policies {
            if policy.code.is_empty() {
                return Err(invalid("policy codes cannot be empty"));
            }
            if !codes.insert(policy.code.as_str()) {
                return Err(invalid(format!("duplicate policy code {}", policy.code)));
            }
        }

        self.thresholds()?;
        Ok(())
    }

    pub fn scenario_specs(&self) -> Result<Vec<ScenarioSpec>, ConfigError> {
        self.validate()?;
        Ok(self.scenarios.iter().map(ScenarioConfig::to_spec).collect())
    }

    pub fn thresholds(&self) -> Result<Vec<Threshold>, ConfigError> {
        let mut compiled = vec![];
        for (metric, exprs) in &self.thresholds {
            for expr in exprs {
                let threshold =
                    Threshold::parse(metric.as_str(), expr).map_err(|source| {
                        ConfigError::Threshold {
                            metric: metric.clone(),
                            source,
                        }
                    })?;
                compiled.push(threshold);
            }
        }
        Ok(compiled)
    }

    /// The latest point, relative to the run start, at which any scenario can still run.
    pub fn max_runtime(&self) -> Duration {
        self.scenarios
            .iter()
            .map(|s| s.to_spec().deadline())
            .max()
            .unwrap_or_default()
    }
}
