//! The sync pipeline and its refresh loop.
//!
//! One run: load → verify → per-entry validate + fetch artifact + guard
//! check + register. Per-entry failures reject that entry and continue;
//! load/verify failures fail the run and feed the circuit breaker.
//! Pipeline failures never propagate to the orchestrator -- the refresh
//! loop logs, counts, and keeps its schedule.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use oneiric::config::RemoteConfig;
use oneiric::domain::Domain;
use oneiric::events::{counters, histograms, Event, ObservabilitySink};
use oneiric::factory::FactoryGuard;
use oneiric::orchestrator::RunnableTask;
use oneiric::registry::CandidateRegistry;
use oneiric::resilience::CircuitBreaker;

use crate::artifact::ArtifactManager;
use crate::error::RemoteError;
use crate::loader::{ManifestLoader, ManifestSource};
use crate::manifest::{self, ManifestEntry};
use crate::validate::validate_entry;
use crate::verify::ManifestVerifier;

/// Telemetry record of one sync run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub source: String,
    pub registered: BTreeMap<Domain, usize>,
    pub rejected: BTreeMap<Domain, usize>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl SyncReport {
    #[must_use]
    pub fn total_registered(&self) -> usize {
        self.registered.values().sum()
    }

    #[must_use]
    pub fn total_rejected(&self) -> usize {
        self.rejected.values().sum()
    }
}

/// The assembled remote pipeline.
pub struct RemotePipeline {
    source: ManifestSource,
    loader: ManifestLoader,
    verifier: ManifestVerifier,
    artifacts: ArtifactManager,
    registry: Arc<CandidateRegistry>,
    guard: Arc<FactoryGuard>,
    breaker: CircuitBreaker,
    latency_budget_ms: u64,
    sink: Arc<dyn ObservabilitySink>,
}

impl std::fmt::Debug for RemotePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePipeline").finish_non_exhaustive()
    }
}

impl RemotePipeline {
    /// Builds the pipeline from configuration.
    ///
    /// # Errors
    /// Missing manifest URL, bad trusted keys, or cache directory
    /// failures.
    pub fn from_config(
        config: &RemoteConfig,
        registry: Arc<CandidateRegistry>,
        guard: Arc<FactoryGuard>,
        sink: Arc<dyn ObservabilitySink>,
    ) -> Result<Self, RemoteError> {
        let location = config
            .manifest_url
            .as_deref()
            .ok_or_else(|| RemoteError::NotConfigured {
                reason: "remote.manifest_url is not set".to_owned(),
            })?;
        let source = ManifestSource::parse(location)?;
        let loader = ManifestLoader::from_config(config)?;
        let verifier = ManifestVerifier::from_config(config, sink.clone())?;
        let artifacts = ArtifactManager::new(config.cache_dir.clone(), sink.clone())?;
        let breaker = CircuitBreaker::new(
            "remote-loader",
            config.circuit_breaker_threshold,
            Duration::from_secs(config.circuit_breaker_reset_secs),
            sink.clone(),
        );
        Ok(Self {
            source,
            loader,
            verifier,
            artifacts,
            registry,
            guard,
            breaker,
            latency_budget_ms: config.latency_budget_ms,
            sink,
        })
    }

    /// One full pipeline run.
    ///
    /// # Errors
    /// [`RemoteError::CircuitOpen`] when the breaker refuses, or the
    /// load/parse/verify failure that aborted the run. Per-entry failures
    /// are reported inside the [`SyncReport`], not as errors.
    pub async fn sync_once(&self) -> Result<SyncReport, RemoteError> {
        self.breaker.try_acquire()?;

        let source = self.source.describe();
        self.sink.emit(&Event::RemoteSyncStart {
            source: source.clone(),
        });
        let started = std::time::Instant::now();

        match self.run(&source).await {
            Ok(mut report) => {
                report.duration_ms = started.elapsed().as_millis() as u64;
                if self.latency_budget_ms > 0 && report.duration_ms > self.latency_budget_ms {
                    tracing::warn!(
                        duration_ms = report.duration_ms,
                        budget_ms = self.latency_budget_ms,
                        "Remote sync exceeded its latency budget"
                    );
                }
                self.breaker.record_success();
                self.sink.incr(counters::REMOTE_SYNC_OK);
                self.sink
                    .observe_ms(histograms::REMOTE_SYNC_DURATION_MS, report.duration_ms);
                self.sink.emit(&Event::RemoteSyncSuccess {
                    source,
                    registered: report.total_registered(),
                    rejected: report.total_rejected(),
                    elapsed_ms: report.duration_ms,
                });
                Ok(report)
            }
            Err(err) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.breaker.record_failure();
                self.sink.incr(counters::REMOTE_SYNC_ERR);
                self.sink.emit(&Event::RemoteSyncFailure {
                    source,
                    error: err.to_string(),
                    elapsed_ms,
                });
                Err(err)
            }
        }
    }

    async fn run(&self, source: &str) -> Result<SyncReport, RemoteError> {
        let bytes = self.loader.load(&self.source).await?;
        let (manifest, raw) = manifest::parse(&bytes)?;
        self.verifier.verify(&manifest, &raw)?;

        let mut report = SyncReport {
            source: source.to_owned(),
            registered: BTreeMap::new(),
            rejected: BTreeMap::new(),
            errors: Vec::new(),
            duration_ms: 0,
        };

        for entry in &manifest.entries {
            match self.ingest_entry(entry).await {
                Ok(domain) => {
                    *report.registered.entry(domain).or_insert(0) += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        domain = %entry.domain,
                        key = %entry.key,
                        provider = %entry.provider,
                        error = %err,
                        "Manifest entry rejected"
                    );
                    if let Ok(domain) = entry.domain.parse::<Domain>() {
                        *report.rejected.entry(domain).or_insert(0) += 1;
                    }
                    report.errors.push(err.to_string());
                }
            }
        }

        tracing::info!(
            source,
            registered = report.total_registered(),
            rejected = report.total_rejected(),
            "Remote sync applied"
        );
        Ok(report)
    }

    async fn ingest_entry(&self, entry: &ManifestEntry) -> Result<Domain, RemoteError> {
        let mut spec = validate_entry(entry)?;

        if let (Some(uri), Some(sha256)) = (&entry.uri, &entry.sha256) {
            let stored = self.artifacts.store(&self.loader, uri, sha256).await?;
            spec.digest = Some(stored.sha256);
        }

        if let Some(descriptor) = spec.factory.symbolic() {
            self.guard
                .ensure_allowed(descriptor)
                .map_err(|e| RemoteError::InvalidEntry {
                    domain: entry.domain.clone(),
                    key: entry.key.clone(),
                    provider: entry.provider.clone(),
                    reason: e.to_string(),
                })?;
        }

        let domain = spec.domain;
        self.registry
            .register(spec)
            .map_err(|e| RemoteError::InvalidEntry {
                domain: entry.domain.clone(),
                key: entry.key.clone(),
                provider: entry.provider.clone(),
                reason: e.to_string(),
            })?;
        Ok(domain)
    }
}

/// Supervised refresh loop. A zero interval means one-shot (serverless
/// profile): run once and return.
pub struct RefreshLoop {
    pipeline: Arc<RemotePipeline>,
    interval: Duration,
}

impl RefreshLoop {
    pub fn new(pipeline: Arc<RemotePipeline>, interval: Duration) -> Self {
        Self { pipeline, interval }
    }
}

#[async_trait]
impl RunnableTask for RefreshLoop {
    fn name(&self) -> &str {
        "remote-refresh"
    }

    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        if self.interval.is_zero() {
            if let Err(err) = self.pipeline.sync_once().await {
                tracing::warn!(error = %err, "One-shot remote sync failed");
            }
            return Ok(());
        }

        loop {
            // Failures opened the breaker and were counted; the loop
            // keeps its cadence regardless.
            if let Err(err) = self.pipeline.sync_once().await {
                tracing::warn!(error = %err, "Remote sync failed");
            }
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Remote refresh loop stopped");
                    return Ok(());
                }
                () = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}
