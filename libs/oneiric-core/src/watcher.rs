//! Config watcher: detects `(domain, key) → provider` selection changes
//! and triggers swaps through the domain bridges.
//!
//! Polling, not inotify -- the selection file changes rarely and the poll
//! interval is operator-configured (default 5 s). Paused keys are skipped
//! (`skip-paused`), draining keys are retried on the next poll until the
//! flag clears.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityStore;
use crate::bridge::DomainBridge;
use crate::config::OneiricConfig;
use crate::domain::{Domain, Slot};
use crate::events::{Event, ObservabilitySink, WatcherAction};
use crate::orchestrator::RunnableTask;
use crate::resolver::{Resolver, Selections};

/// Watches the operator configuration file for selection changes.
pub struct ConfigWatcher {
    config_path: PathBuf,
    poll_interval: Duration,
    resolver: Arc<Resolver>,
    bridges: BTreeMap<Domain, Arc<DomainBridge>>,
    activity: Arc<ActivityStore>,
    /// Selections already acted upon; draining keys stay un-applied so
    /// the next poll retries them.
    applied: parking_lot::Mutex<Selections>,
    sink: Arc<dyn ObservabilitySink>,
}

impl ConfigWatcher {
    pub fn new(
        config_path: PathBuf,
        poll_interval: Duration,
        resolver: Arc<Resolver>,
        bridges: BTreeMap<Domain, Arc<DomainBridge>>,
        activity: Arc<ActivityStore>,
        sink: Arc<dyn ObservabilitySink>,
    ) -> Self {
        let applied = resolver.selections().as_ref().clone();
        Self {
            config_path,
            poll_interval,
            resolver,
            bridges,
            activity,
            applied: parking_lot::Mutex::new(applied),
            sink,
        }
    }

    /// One poll round: reload the file, diff selections, act on changes.
    /// File errors are logged and the round is skipped.
    pub async fn poll_once(&self) {
        let config = match OneiricConfig::load_layered(&self.config_path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(
                    path = %self.config_path.display(),
                    error = %err,
                    "Skipping watcher round: config unreadable"
                );
                return;
            }
        };

        let next = config.resolver_selections();
        // Future resolutions see the new selections immediately; only the
        // swap of live instances is gated by activity flags below.
        self.resolver.set_selections(next.clone());

        let changes = self.pending_changes(&next);
        for (domain, key, provider) in changes {
            self.handle_change(domain, &key, &provider).await;
        }
    }

    fn pending_changes(&self, next: &Selections) -> Vec<(Domain, String, String)> {
        let applied = self.applied.lock();
        let mut out = Vec::new();
        for (domain, keys) in &next.0 {
            for (key, provider) in keys {
                let seen = applied.provider_for(*domain, key);
                if seen != Some(provider.as_str()) {
                    out.push((*domain, key.clone(), provider.clone()));
                }
            }
        }
        out
    }

    fn mark_applied(&self, domain: Domain, key: &str, provider: &str) {
        self.applied
            .lock()
            .0
            .entry(domain)
            .or_default()
            .insert(key.to_owned(), provider.to_owned());
    }

    async fn handle_change(&self, domain: Domain, key: &str, provider: &str) {
        let slot = Slot::new(domain, key);
        let flags = self.activity.flags(&slot);

        if flags.paused {
            tracing::info!(slot = %slot, provider, "Selection change skipped: slot is paused");
            self.sink.emit(&Event::WatcherTrigger {
                domain,
                key: key.to_owned(),
                provider: provider.to_owned(),
                action: WatcherAction::SkippedPaused,
            });
            // A skip is final for this change; the operator resumes and
            // re-selects when ready.
            self.mark_applied(domain, key, provider);
            return;
        }

        if flags.draining {
            tracing::info!(slot = %slot, provider, "Selection change deferred: slot is draining");
            self.sink.emit(&Event::WatcherTrigger {
                domain,
                key: key.to_owned(),
                provider: provider.to_owned(),
                action: WatcherAction::DeferredDraining,
            });
            // Left un-applied: the next poll retries until the flag clears.
            return;
        }

        let Some(bridge) = self.bridges.get(&domain) else {
            tracing::warn!(slot = %slot, "No bridge for domain; selection change ignored");
            return;
        };

        match bridge.swap(key, provider, false).await {
            Ok(_) => {
                self.sink.emit(&Event::WatcherTrigger {
                    domain,
                    key: key.to_owned(),
                    provider: provider.to_owned(),
                    action: WatcherAction::Swapped,
                });
            }
            Err(err) => {
                tracing::warn!(slot = %slot, provider, error = %err, "Watcher-triggered swap failed");
                self.sink.emit(&Event::WatcherTrigger {
                    domain,
                    key: key.to_owned(),
                    provider: provider.to_owned(),
                    action: WatcherAction::Failed,
                });
            }
        }
        // Applied either way; swap-failure events carry the diagnosis and
        // re-polling a failing provider every round would hammer it.
        self.mark_applied(domain, key, provider);
    }
}

#[async_trait]
impl RunnableTask for ConfigWatcher {
    fn name(&self) -> &str {
        "config-watcher"
    }

    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        tracing::info!(
            path = %self.config_path.display(),
            interval_secs = self.poll_interval.as_secs(),
            "Config watcher started"
        );
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Config watcher stopped");
                    return Ok(());
                }
                () = tokio::time::sleep(self.poll_interval) => {
                    self.poll_once().await;
                }
            }
        }
    }
}
