//! Health probe dispatch.
//!
//! A candidate-level check (registered with the candidate) runs first;
//! then the instance's probes are tried in documented order --
//! `health`, `check_health`, `ready`, `is_healthy` -- and the first one
//! the instance supports decides. An instance supporting no probe is
//! treated as healthy.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::candidate::Candidate;
use crate::instance::ProviderInstance;

/// Outcome of one probe run.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResult {
    pub provider: String,
    pub healthy: bool,
    /// Which probe decided: `candidate`, one of the instance probe names,
    /// or `none` when the instance supports no probe.
    pub probe: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// Runs the full probe chain under `timeout`.
///
/// A boolean-false result, a probe error, or a timeout all yield
/// `healthy = false`; the error field says which.
pub async fn probe(
    candidate: &Candidate,
    instance: &Arc<dyn ProviderInstance>,
    timeout: Duration,
) -> HealthResult {
    let started = std::time::Instant::now();
    let outcome = tokio::time::timeout(timeout, probe_chain(candidate, instance)).await;
    let (healthy, probe, error) = match outcome {
        Ok((healthy, probe, error)) => (healthy, probe, error),
        Err(_) => (
            false,
            "timeout",
            Some(format!("health probe exceeded {}ms", timeout.as_millis())),
        ),
    };
    HealthResult {
        provider: candidate.provider.clone(),
        healthy,
        probe,
        error,
        checked_at: Utc::now(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

async fn probe_chain(
    candidate: &Candidate,
    instance: &Arc<dyn ProviderInstance>,
) -> (bool, &'static str, Option<String>) {
    if let Some(check) = &candidate.health {
        match check.check().await {
            Ok(true) => {}
            Ok(false) => return (false, "candidate", None),
            Err(err) => return (false, "candidate", Some(err.to_string())),
        }
    }

    // Stop at the first probe the instance supports; later ones never run.
    if let Some(outcome) = instance.health().await {
        return settle("health", outcome);
    }
    if let Some(outcome) = instance.check_health().await {
        return settle("check_health", outcome);
    }
    if let Some(outcome) = instance.ready().await {
        return settle("ready", outcome);
    }
    if let Some(outcome) = instance.is_healthy().await {
        return settle("is_healthy", outcome);
    }
    (true, "none", None)
}

fn settle(
    name: &'static str,
    outcome: anyhow::Result<bool>,
) -> (bool, &'static str, Option<String>) {
    match outcome {
        Ok(ok) => (ok, name, None),
        Err(err) => (false, name, Some(err.to_string())),
    }
}
