//! Runtime orchestrator: one supervised process composing the bridges,
//! the config watcher, and any background loops (remote refresh, custom
//! runnables) under a single cancellation token.
//!
//! Tasks are spawned named and joined in `stop`; on shutdown the
//! lifecycle manager drains every live instance.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityStore;
use crate::bridge::{DomainBridge, SettingsCache};
use crate::config::OneiricConfig;
use crate::domain::Domain;
use crate::events::ObservabilitySink;
use crate::factory::{FactoryGuard, FactoryIndex};
use crate::lifecycle::{LifecycleHooks, LifecycleManager};
use crate::registry::CandidateRegistry;
use crate::resolver::Resolver;
use crate::status::StatusStore;
use crate::watcher::ConfigWatcher;

/// A long-running loop the orchestrator supervises.
///
/// Implementations exit promptly when `cancel` fires. Errors are logged
/// by the orchestrator; they do not bring the process down.
#[async_trait]
pub trait RunnableTask: Send + Sync + 'static {
    fn name(&self) -> &str;
    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// The assembled runtime: registry, resolver, guard, lifecycle manager,
/// per-domain bridges, and supervised background tasks.
pub struct Orchestrator {
    registry: Arc<CandidateRegistry>,
    resolver: Arc<Resolver>,
    guard: Arc<FactoryGuard>,
    lifecycle: Arc<LifecycleManager>,
    bridges: BTreeMap<Domain, Arc<DomainBridge>>,
    settings: Arc<SettingsCache>,
    activity: Arc<ActivityStore>,
    status: Arc<StatusStore>,
    sink: Arc<dyn ObservabilitySink>,
    cancel: CancellationToken,
    tasks: Vec<Arc<dyn RunnableTask>>,
    running: Vec<(String, JoinHandle<()>)>,
}

impl Orchestrator {
    /// Assembles the runtime from configuration.
    ///
    /// Entry-point candidates are discovered immediately; remote
    /// candidates arrive once a remote refresh task (wired by the caller
    /// via [`Self::add_task`]) syncs.
    ///
    /// # Errors
    /// Propagates entry-point registration failures.
    pub fn build(
        config: &OneiricConfig,
        index: Arc<FactoryIndex>,
        status_dir: impl Into<std::path::PathBuf>,
        sink: Arc<dyn ObservabilitySink>,
    ) -> anyhow::Result<Self> {
        let registry = Arc::new(CandidateRegistry::new(sink.clone()));
        registry.discover_entry_points()?;

        let resolver = Arc::new(Resolver::new(registry.clone(), sink.clone()));
        resolver.set_selections(config.resolver_selections());
        resolver.set_priority_source(Arc::new(config.resolver_stack_order()));

        let guard = Arc::new(FactoryGuard::new(config.factory_allowlist.clone(), index));
        let settings = SettingsCache::new(config.provider_settings.clone());
        let activity = Arc::new(ActivityStore::open(
            config.activity.store_path.clone(),
            sink.clone(),
        ));
        let status = Arc::new(StatusStore::new(status_dir));

        let lifecycle = Arc::new(LifecycleManager::new(
            resolver.clone(),
            guard.clone(),
            settings.clone(),
            activity.clone(),
            status.clone(),
            LifecycleHooks::new(),
            config.lifecycle.timeouts(),
            sink.clone(),
        ));

        let bridges: BTreeMap<Domain, Arc<DomainBridge>> = Domain::ALL
            .into_iter()
            .map(|domain| {
                (
                    domain,
                    Arc::new(DomainBridge::new(
                        domain,
                        resolver.clone(),
                        lifecycle.clone(),
                        settings.clone(),
                        activity.clone(),
                    )),
                )
            })
            .collect();

        Ok(Self {
            registry,
            resolver,
            guard,
            lifecycle,
            bridges,
            settings,
            activity,
            status,
            sink,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            running: Vec::new(),
        })
    }

    /// Wires the config watcher according to `config.watchers`; a no-op
    /// when watchers are disabled (serverless profile).
    pub fn add_config_watcher(&mut self, config: &OneiricConfig, config_path: std::path::PathBuf) {
        if !config.watchers.enabled {
            tracing::info!("Config watcher disabled by configuration");
            return;
        }
        let watcher = ConfigWatcher::new(
            config_path,
            std::time::Duration::from_secs(config.watchers.poll_interval_secs.max(1)),
            self.resolver.clone(),
            self.bridges.clone(),
            self.activity.clone(),
            self.sink.clone(),
        );
        self.add_task(Arc::new(watcher));
    }

    /// Registers a background loop to supervise. Must be called before
    /// [`Self::start`].
    pub fn add_task(&mut self, task: Arc<dyn RunnableTask>) {
        self.tasks.push(task);
    }

    /// Spawns every registered task.
    pub fn start(&mut self) {
        for task in self.tasks.clone() {
            let name = task.name().to_owned();
            let cancel = self.cancel.clone();
            tracing::info!(task = %name, "Starting supervised task");
            let handle = tokio::spawn({
                let name = name.clone();
                async move {
                    if let Err(err) = task.run(cancel).await {
                        tracing::error!(task = %name, error = %err, "Supervised task failed");
                    }
                }
            });
            self.running.push((name, handle));
        }
    }

    /// Blocks until `stop` is called from another task or the token is
    /// cancelled externally.
    pub async fn wait(&self) {
        self.cancel.cancelled().await;
    }

    /// Cancels every task, joins them, and drains live instances.
    pub async fn stop(&mut self) {
        tracing::info!("Orchestrator stopping");
        self.cancel.cancel();
        for (name, handle) in self.running.drain(..) {
            match handle.await {
                Ok(()) => tracing::info!(task = %name, "Task stopped"),
                Err(err) => tracing::warn!(task = %name, error = %err, "Task join failed"),
            }
        }
        self.lifecycle.shutdown_all().await;
        tracing::info!("Orchestrator stopped");
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<CandidateRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    #[must_use]
    pub fn factory_guard(&self) -> &Arc<FactoryGuard> {
        &self.guard
    }

    #[must_use]
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    #[must_use]
    pub fn bridge(&self, domain: Domain) -> Arc<DomainBridge> {
        self.bridges[&domain].clone()
    }

    #[must_use]
    pub fn settings(&self) -> &Arc<SettingsCache> {
        &self.settings
    }

    #[must_use]
    pub fn activity(&self) -> &Arc<ActivityStore> {
        &self.activity
    }

    #[must_use]
    pub fn status(&self) -> &Arc<StatusStore> {
        &self.status
    }
}
