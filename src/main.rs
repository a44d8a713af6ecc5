use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use couponstorm::{
    Reporter, Runner,
    config::RunProfile,
    http::ReqwestTransport,
    report::{JsonReporter, StdoutReporter},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Couponstorm: concurrency and consistency load tests for coupon issuance
///
/// Runs are described by TOML profiles:
///   couponstorm run -P profiles/db-lock.toml
///   couponstorm run -P profiles/kafka-event.toml --base-url http://10.0.0.5:8080 --json
///   couponstorm check -P profiles/redis-async.toml
///
/// Exits with 0 when every threshold holds, 1 when one is violated and 2 when the
/// profile is invalid or setup fails.
#[derive(Parser)]
#[command(name = "couponstorm")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every scenario of a profile and report the result
    Run {
        /// Path to TOML profile
        #[arg(short = 'P', long, required = true)]
        profile: PathBuf,

        /// Overrides `run.base_url` from the profile
        #[arg(long)]
        base_url: Option<String>,

        /// Print the summary as JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Validate a profile without running it
    Check {
        /// Path to TOML profile
        #[arg(short = 'P', long, required = true)]
        profile: PathBuf,
    },
}

fn load(path: &Path) -> anyhow::Result<RunProfile> {
    let profile = RunProfile::load(path)
        .with_context(|| format!("Failed to load profile: {}", path.display()))?;
    profile
        .validate()
        .with_context(|| format!("Invalid profile: {}", path.display()))?;
    Ok(profile)
}

/// Returns whether the run passed. Errors mean it never got to run.
async fn execute(command: Commands) -> anyhow::Result<bool> {
    match command {
        Commands::Run {
            profile,
            base_url,
            json,
        } => {
            let mut profile = load(&profile)?;
            if let Some(base_url) = base_url {
                profile.run.base_url = base_url;
            }

            let client = reqwest::Client::builder()
                .pool_idle_timeout(Duration::from_secs(90))
                .build()
                .context("Failed to build HTTP client")?;
            let summary = Runner::builder()
                .profile(profile)
                .transport(Arc::new(ReqwestTransport::new(client)))
                .build()
                .run()
                .await
                .context("Run aborted")?;

            let reported = if json {
                JsonReporter.report(&summary).await
            } else {
                StdoutReporter.report(&summary).await
            };
            reported.map_err(|e| anyhow::anyhow!(e))?;
            Ok(summary.passed)
        }
        Commands::Check { profile: path } => {
            let profile = load(&path)?;
            println!(
                "{}: {} scenarios, {} policies, {} thresholds, runs at most {:?}",
                path.display(),
                profile.scenarios.len(),
                profile.policies.len(),
                profile.thresholds()?.len(),
                profile.max_runtime()
            );
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match execute(cli.command).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(2)
        }
    }
}
