//! Observability seam.
//!
//! The core emits structured records at well-defined program points into a
//! thin [`ObservabilitySink`] it receives at construction. It does not
//! prescribe an exporter: the default [`TracingSink`] forwards everything
//! to `tracing`, and embedders can install their own sink to feed a
//! metrics pipeline.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::activity::ActivityFlags;
use crate::candidate::CandidateSource;
use crate::domain::Domain;

/// Counter names emitted by the core.
pub mod counters {
    pub const RESOLVE_OK: &str = "oneiric.resolve.ok";
    pub const RESOLVE_ERR: &str = "oneiric.resolve.err";
    pub const ACTIVATE_OK: &str = "oneiric.activate.ok";
    pub const ACTIVATE_ERR: &str = "oneiric.activate.err";
    pub const SWAP_OK: &str = "oneiric.swap.ok";
    pub const SWAP_ERR: &str = "oneiric.swap.err";
    pub const ROLLBACK_OK: &str = "oneiric.rollback.ok";
    pub const CLEANUP_ERR: &str = "oneiric.cleanup.err";
    pub const HEALTH_OK: &str = "oneiric.health.ok";
    pub const HEALTH_ERR: &str = "oneiric.health.err";
    pub const PAUSE: &str = "oneiric.activity.pause";
    pub const RESUME: &str = "oneiric.activity.resume";
    pub const DRAIN: &str = "oneiric.activity.drain";
    pub const REMOTE_SYNC_OK: &str = "oneiric.remote.sync.ok";
    pub const REMOTE_SYNC_ERR: &str = "oneiric.remote.sync.err";
    pub const DIGEST_OK: &str = "oneiric.remote.digest.ok";
    pub const DIGEST_ERR: &str = "oneiric.remote.digest.err";
    pub const SIGNATURE_OK: &str = "oneiric.remote.signature.ok";
    pub const SIGNATURE_ERR: &str = "oneiric.remote.signature.err";
    pub const BREAKER_OPEN: &str = "oneiric.breaker.open";
}

/// Histogram names emitted by the core.
pub mod histograms {
    pub const SWAP_DURATION_MS: &str = "oneiric.swap.duration_ms";
    pub const ACTIVATE_DURATION_MS: &str = "oneiric.activate.duration_ms";
    pub const REMOTE_SYNC_DURATION_MS: &str = "oneiric.remote.sync.duration_ms";
}

/// What the config watcher did for one changed key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatcherAction {
    Swapped,
    /// Recorded as `skip-paused` on the wire.
    #[serde(rename = "skip-paused")]
    SkippedPaused,
    DeferredDraining,
    Failed,
}

/// Circuit breaker states, mirrored into events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStateTag {
    Closed,
    Open,
    HalfOpen,
}

/// Structured events emitted by the core.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    Register {
        domain: Domain,
        key: String,
        provider: String,
        source: CandidateSource,
        sequence: u64,
        replaced: bool,
    },
    ResolveDecision {
        domain: Domain,
        key: String,
        selected: Option<String>,
        outcome: &'static str,
        considered: usize,
    },
    ActivateStart {
        domain: Domain,
        key: String,
        provider: String,
    },
    ActivateSuccess {
        domain: Domain,
        key: String,
        provider: String,
        elapsed_ms: u64,
    },
    ActivateFailure {
        domain: Domain,
        key: String,
        provider: Option<String>,
        error: String,
    },
    SwapStart {
        domain: Domain,
        key: String,
        from: Option<String>,
        to: String,
    },
    SwapSuccess {
        domain: Domain,
        key: String,
        from: Option<String>,
        to: String,
        elapsed_ms: u64,
    },
    SwapFailure {
        domain: Domain,
        key: String,
        to: String,
        rolled_back: bool,
        error: String,
    },
    RollbackSuccess {
        domain: Domain,
        key: String,
        provider: String,
    },
    HealthProbe {
        domain: Domain,
        key: String,
        provider: String,
        healthy: bool,
        elapsed_ms: u64,
    },
    RemoteSyncStart {
        source: String,
    },
    RemoteSyncSuccess {
        source: String,
        registered: usize,
        rejected: usize,
        elapsed_ms: u64,
    },
    RemoteSyncFailure {
        source: String,
        error: String,
        elapsed_ms: u64,
    },
    ActivityEvent {
        domain: Domain,
        key: String,
        flags: ActivityFlags,
    },
    WatcherTrigger {
        domain: Domain,
        key: String,
        provider: String,
        action: WatcherAction,
    },
    BreakerTransition {
        name: String,
        from: BreakerStateTag,
        to: BreakerStateTag,
    },
}

impl Event {
    /// Stable event name, matching the serialized `event` tag.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Event::Register { .. } => "register",
            Event::ResolveDecision { .. } => "resolve-decision",
            Event::ActivateStart { .. } => "activate-start",
            Event::ActivateSuccess { .. } => "activate-success",
            Event::ActivateFailure { .. } => "activate-failure",
            Event::SwapStart { .. } => "swap-start",
            Event::SwapSuccess { .. } => "swap-success",
            Event::SwapFailure { .. } => "swap-failure",
            Event::RollbackSuccess { .. } => "rollback-success",
            Event::HealthProbe { .. } => "health-probe",
            Event::RemoteSyncStart { .. } => "remote-sync-start",
            Event::RemoteSyncSuccess { .. } => "remote-sync-success",
            Event::RemoteSyncFailure { .. } => "remote-sync-failure",
            Event::ActivityEvent { .. } => "activity-event",
            Event::WatcherTrigger { .. } => "watcher-trigger",
            Event::BreakerTransition { .. } => "breaker-transition",
        }
    }
}

/// Receiver for events, counters, and duration observations.
pub trait ObservabilitySink: Send + Sync + 'static {
    fn emit(&self, event: &Event);

    fn incr(&self, counter: &'static str) {
        self.incr_by(counter, 1);
    }

    fn incr_by(&self, counter: &'static str, delta: u64);

    fn observe_ms(&self, histogram: &'static str, millis: u64);
}

/// Default sink: forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ObservabilitySink for TracingSink {
    fn emit(&self, event: &Event) {
        match serde_json::to_string(event) {
            Ok(payload) => {
                tracing::info!(target: "oneiric::events", event = event.name(), %payload);
            }
            Err(err) => {
                tracing::warn!(target: "oneiric::events", event = event.name(), error = %err, "Failed to serialize event");
            }
        }
    }

    fn incr_by(&self, counter: &'static str, delta: u64) {
        tracing::debug!(target: "oneiric::counters", counter, delta);
    }

    fn observe_ms(&self, histogram: &'static str, millis: u64) {
        tracing::debug!(target: "oneiric::counters", histogram, millis);
    }
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ObservabilitySink for NullSink {
    fn emit(&self, _event: &Event) {}
    fn incr_by(&self, _counter: &'static str, _delta: u64) {}
    fn observe_ms(&self, _histogram: &'static str, _millis: u64) {}
}

/// In-memory capturing sink, for tests and embedders that want to inspect
/// emitted records.
#[derive(Debug, Default)]
pub struct CapturingSink {
    events: parking_lot::Mutex<Vec<Event>>,
    counters: parking_lot::Mutex<BTreeMap<&'static str, u64>>,
    observations: parking_lot::Mutex<Vec<(&'static str, u64)>>,
}

impl CapturingSink {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Names of all captured events, in emission order.
    #[must_use]
    pub fn event_names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(Event::name).collect()
    }

    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn observations(&self, histogram: &str) -> Vec<u64> {
        self.observations
            .lock()
            .iter()
            .filter(|(name, _)| *name == histogram)
            .map(|(_, v)| *v)
            .collect()
    }
}

impl ObservabilitySink for CapturingSink {
    fn emit(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }

    fn incr_by(&self, counter: &'static str, delta: u64) {
        *self.counters.lock().entry(counter).or_insert(0) += delta;
    }

    fn observe_ms(&self, histogram: &'static str, millis: u64) {
        self.observations.lock().push((histogram, millis));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_tag_matches_name() {
        let event = Event::ResolveDecision {
            domain: Domain::Adapter,
            key: "cache".into(),
            selected: Some("redis".into()),
            outcome: "ok",
            considered: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.name());
        assert_eq!(json["event"], "resolve-decision");
    }

    #[test]
    fn paused_watcher_trigger_serializes_as_skip_paused() {
        let event = Event::WatcherTrigger {
            domain: Domain::Service,
            key: "payment".into(),
            provider: "adyen".into(),
            action: WatcherAction::SkippedPaused,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["action"], "skip-paused");

        // The other actions keep their kebab-case names.
        assert_eq!(
            serde_json::to_value(WatcherAction::DeferredDraining).unwrap(),
            "deferred-draining"
        );
        assert_eq!(serde_json::to_value(WatcherAction::Swapped).unwrap(), "swapped");
    }

    #[test]
    fn capturing_sink_accumulates() {
        let sink = CapturingSink::new();
        sink.incr(counters::RESOLVE_OK);
        sink.incr(counters::RESOLVE_OK);
        sink.observe_ms(histograms::SWAP_DURATION_MS, 12);
        sink.emit(&Event::RemoteSyncStart {
            source: "cdn".into(),
        });

        assert_eq!(sink.counter(counters::RESOLVE_OK), 2);
        assert_eq!(sink.observations(histograms::SWAP_DURATION_MS), vec![12]);
        assert_eq!(sink.event_names(), vec!["remote-sync-start"]);
    }
}
