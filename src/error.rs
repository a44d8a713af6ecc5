use std::path::PathBuf;

use thiserror::Error;

use crate::http::TransportError;

/// A threshold expression that could not be parsed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ThresholdError {
    #[error("threshold `{expr}` has no comparison operator")]
    MissingOperator { expr: String },
    #[error("unknown statistic `{stat}` in threshold `{expr}`")]
    UnknownStat { expr: String, stat: String },
    #[error("invalid percentile `{value}` in threshold `{expr}`")]
    InvalidPercentile { expr: String, value: String },
    #[error("invalid bound `{value}` in threshold `{expr}`")]
    InvalidBound { expr: String, value: String },
}

/// A run profile that could not be loaded or does not describe a runnable run.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read profile {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse profile: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid profile: {0}")]
    Invalid(String),
    #[error("invalid threshold on `{metric}`: {source}")]
    Threshold {
        metric: String,
        #[source]
        source: ThresholdError,
    },
}

/// Setup could not establish the baseline the scenarios depend on.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SetupError {
    #[error("creating policy {code} was rejected with status {status}: {body}")]
    PolicyRejected {
        code: String,
        status: u16,
        body: String,
    },
    #[error("creating policy {code} failed: {source}")]
    PolicyTransport {
        code: String,
        #[source]
        source: TransportError,
    },
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Setup(#[from] SetupError),
}
