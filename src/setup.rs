//! Run setup and teardown against the service's admin endpoints.
//!
//! Setup creates every configured coupon policy and must succeed before any scenario
//! starts. Health probes are informational. Teardown reads back each policy's issued
//! count and checks it, along with what the clients observed, against the policy's
//! supply.

use std::time::Duration;

use serde_json::json;

use crate::{
    config::{PolicyConfig, RunSettings},
    error::SetupError,
    http::{Endpoints, Request, Response, Transport},
    metric::names,
    metrics::MetricsSnapshot,
    report::SupplyCheck,
};

const PROBE_BODY_LIMIT: usize = 200;

fn excerpt(body: &str) -> &str {
    match body.char_indices().nth(PROBE_BODY_LIMIT) {
        Some((at, _)) => &body[..at],
        None => body,
    }
}

async fn create_policy(
    transport: &dyn Transport,
    endpoints: &Endpoints,
    policy: &PolicyConfig,
    timeout: Duration,
) -> Result<(), SetupError> {
    let body = json!({
        "code": policy.code,
        "maxCount": policy.max_count,
        "discountRate": policy.discount_rate,
    });
    let request = Request::post(endpoints.coupon_policies(), timeout).with_body(body.to_string());

    let response = transport
        .send(request)
        .await
        .map_err(|source| SetupError::PolicyTransport {
            code: policy.code.clone(),
            source,
        })?;
    if !(200..300).contains(&response.status) {
        return Err(SetupError::PolicyRejected {
            code: policy.code.clone(),
            status: response.status,
            body: excerpt(&response.body).to_string(),
        });
    }
    tracing::info!(
        "Created policy {} (max {}, discount {}%)",
        policy.code,
        policy.max_count,
        policy.discount_rate
    );
    Ok(())
}

async fn probe(transport: &dyn Transport, url: String, timeout: Duration) -> Option<Response> {
    match transport.send(Request::get(url.as_str(), timeout)).await {
        Ok(response) if response.status == 200 => {
            tracing::info!("Probe {url}: {}", excerpt(&response.body));
            Some(response)
        }
        Ok(response) => {
            tracing::warn!("Probe {url} answered {}", response.status);
            None
        }
        Err(e) => {
            tracing::warn!("Probe {url} failed: {e}");
            None
        }
    }
}

/// Creates every policy, then runs the health probes.
///
/// The first policy that cannot be created aborts the run.
pub async fn setup(
    transport: &dyn Transport,
    endpoints: &Endpoints,
    settings: &RunSettings,
    policies: &[PolicyConfig],
) -> Result<(), SetupError> {
    for policy in policies {
        create_policy(transport, endpoints, policy, settings.setup_timeout).await?;
    }
    for path in &settings.health_probes {
        probe(transport, endpoints.path(path), settings.setup_timeout).await;
    }
    Ok(())
}

/// Issuances the clients saw for `code` during the run.
pub fn observed_issued(snapshot: &MetricsSnapshot, code: &str) -> u64 {
    snapshot
        .sink_where(names::ISSUED_OBSERVED, |tags| {
            tags.get("code").is_some_and(|c| c == code)
        })
        .map_or(0, |sink| sink.count())
}

async fn issued_count(
    transport: &dyn Transport,
    endpoints: &Endpoints,
    code: &str,
    timeout: Duration,
) -> Option<u64> {
    let response = probe(transport, endpoints.coupon_status(code), timeout).await?;
    let issued = response.payload()?.get("issuedCount")?.as_u64();
    if issued.is_none() {
        tracing::warn!("Status of {code} has no issuedCount");
    }
    issued
}

/// Reads back the service's tallies and checks supply conservation per policy.
pub async fn teardown(
    transport: &dyn Transport,
    endpoints: &Endpoints,
    settings: &RunSettings,
    policies: &[PolicyConfig],
    snapshot: &MetricsSnapshot,
) -> Vec<SupplyCheck> {
    for path in &settings.teardown_probes {
        if path.contains("{code}") {
            for policy in policies {
                let url = endpoints.path(&path.replace("{code}", &policy.code));
                probe(transport, url, settings.setup_timeout).await;
            }
        } else {
            probe(transport, endpoints.path(path), settings.setup_timeout).await;
        }
    }

    let mut checks = Vec::with_capacity(policies.len());
    for policy in policies {
        let reported = issued_count(transport, endpoints, &policy.code, settings.setup_timeout).await;
        let check = SupplyCheck::new(
            policy.code.as_str(),
            policy.max_count,
            observed_issued(snapshot, &policy.code),
            reported,
        );
        if check.conserved {
            tracing::info!(
                "{}: issued {}/{} (observed {})",
                check.code,
                reported.map_or_else(|| "?".to_string(), |r| r.to_string()),
                check.max_count,
                check.observed
            );
        } else {
            tracing::warn!(
                "{}: supply exceeded, reported {:?} observed {} of max {}",
                check.code,
                check.reported,
                check.observed,
                check.max_count
            );
        }
        checks.push(check);
    }
    checks
}
