//! The lifecycle manager: turns a winning candidate into a live, healthy
//! instance and keeps it swap-safe.
//!
//! Per-slot state lives behind per-key async locks, so operations on
//! distinct `(domain, key)` pairs never serialize on each other while
//! concurrent swaps of the same slot do. Cleanup is shielded from
//! cancellation; status snapshots are persisted after every transition.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::activity::{ActivityError, ActivityFlags, ActivityStore};
use crate::bridge::SettingsProvider;
use crate::candidate::{Candidate, CandidateMeta};
use crate::domain::{Domain, Slot};
use crate::events::{counters, histograms, Event, ObservabilitySink};
use crate::factory::{FactoryError, FactoryGuard};
use crate::health::{self, HealthResult};
use crate::instance::ProviderInstance;
use crate::lifecycle::binding::{ActiveBinding, BindingState, LiveInstance};
use crate::lifecycle::hooks::{CleanupHook, LifecycleHooks, SwapHook};
use crate::resolver::{ResolveError, ResolveOptions, Resolver};
use crate::status::{StatusSnapshot, StatusStore};

/// Deadline policy for lifecycle operations.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleTimeouts {
    /// Overall bound on one activate/swap, construction included.
    pub activate: Duration,
    pub init: Duration,
    pub health: Duration,
    pub hook: Duration,
    pub cleanup: Duration,
}

impl Default for LifecycleTimeouts {
    fn default() -> Self {
        Self {
            activate: Duration::from_secs(30),
            init: Duration::from_secs(30),
            health: Duration::from_secs(5),
            hook: Duration::from_secs(5),
            cleanup: Duration::from_secs(10),
        }
    }
}

/// Options for [`LifecycleManager::activate`].
#[derive(Debug, Clone, Default)]
pub struct ActivateOptions {
    pub resolve: ResolveOptions,
    /// External cancellation; propagates into init and health probes.
    pub cancel: Option<CancellationToken>,
}

/// Options for [`LifecycleManager::swap`].
#[derive(Debug, Clone, Default)]
pub struct SwapOptions {
    pub resolve: ResolveOptions,
    /// When `true`, a failed swap cleans the previous instance up instead
    /// of rolling back to it.
    pub force: bool,
    pub cancel: Option<CancellationToken>,
}

/// Short-lived reference to a live instance. Callers must not retain a
/// handle across a swap of its slot.
#[derive(Clone)]
pub struct Handle {
    pub slot: Slot,
    pub provider: String,
    pub sequence: u64,
    pub meta: CandidateMeta,
    pub instance: Arc<dyn ProviderInstance>,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("slot", &self.slot)
            .field("provider", &self.provider)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Factory(#[from] FactoryError),
    #[error(transparent)]
    Activity(#[from] ActivityError),
    #[error("activation failed for {slot}")]
    ActivateFailed {
        slot: Slot,
        provider: Option<String>,
        #[source]
        source: anyhow::Error,
    },
    #[error("swap to '{to}' failed for {slot} (rolled_back={rolled_back})")]
    SwapFailed {
        slot: Slot,
        to: String,
        rolled_back: bool,
        #[source]
        source: anyhow::Error,
    },
    #[error("health check failed for {slot} provider '{provider}': {reason}")]
    HealthCheckFailed {
        slot: Slot,
        provider: String,
        reason: String,
    },
    #[error("{op} timed out after {timeout_ms}ms for {slot}")]
    Timeout {
        slot: Slot,
        op: &'static str,
        timeout_ms: u64,
    },
    #[error("operation cancelled for {slot}")]
    Cancelled { slot: Slot },
    #[error("no live instance bound for {slot}")]
    NotActive { slot: Slot },
}

impl LifecycleError {
    /// Whether a failed swap left the previous instance re-installed.
    #[must_use]
    pub fn rolled_back(&self) -> bool {
        matches!(
            self,
            LifecycleError::SwapFailed {
                rolled_back: true,
                ..
            }
        )
    }
}

/// Owns every live instance; bridges receive read-only handles.
pub struct LifecycleManager {
    resolver: Arc<Resolver>,
    guard: Arc<FactoryGuard>,
    settings: Arc<dyn SettingsProvider>,
    activity: Arc<ActivityStore>,
    status: Arc<StatusStore>,
    bindings: DashMap<Slot, Arc<tokio::sync::Mutex<ActiveBinding>>>,
    hooks: parking_lot::RwLock<LifecycleHooks>,
    timeouts: LifecycleTimeouts,
    sink: Arc<dyn ObservabilitySink>,
}

impl LifecycleManager {
    pub fn new(
        resolver: Arc<Resolver>,
        guard: Arc<FactoryGuard>,
        settings: Arc<dyn SettingsProvider>,
        activity: Arc<ActivityStore>,
        status: Arc<StatusStore>,
        hooks: LifecycleHooks,
        timeouts: LifecycleTimeouts,
        sink: Arc<dyn ObservabilitySink>,
    ) -> Self {
        Self {
            resolver,
            guard,
            settings,
            activity,
            status,
            bindings: DashMap::new(),
            hooks: parking_lot::RwLock::new(hooks),
            timeouts,
            sink,
        }
    }

    pub fn add_swap_hook(&self, hook: Arc<dyn SwapHook>) {
        self.hooks.write().swap.push(hook);
    }

    pub fn add_cleanup_hook(&self, hook: Arc<dyn CleanupHook>) {
        self.hooks.write().cleanup.push(hook);
    }

    fn binding(&self, slot: &Slot) -> Arc<tokio::sync::Mutex<ActiveBinding>> {
        self.bindings
            .entry(slot.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(ActiveBinding::default())))
            .clone()
    }

    fn persist(&self, slot: &Slot, binding: &ActiveBinding) {
        if let Err(err) = self.status.write(&binding.snapshot(slot)) {
            tracing::warn!(slot = %slot, error = %err, "Failed to persist status snapshot");
        }
    }

    /// The live handle for a slot, when one is bound and ready.
    pub async fn current_handle(&self, domain: Domain, key: &str) -> Option<Handle> {
        let slot = Slot::new(domain, key);
        let lock = self.bindings.get(&slot)?.clone();
        let binding = lock.lock().await;
        let live = binding.current.as_ref()?;
        Some(Self::handle_for(&slot, live))
    }

    fn handle_for(slot: &Slot, live: &LiveInstance) -> Handle {
        Handle {
            slot: slot.clone(),
            provider: live.candidate.provider.clone(),
            sequence: live.candidate.sequence,
            meta: live.candidate.meta.clone(),
            instance: live.instance.clone(),
        }
    }

    /// Resolves, constructs, health-checks, and installs the winning
    /// candidate for the slot.
    ///
    /// Activating a slot that already holds a live instance behaves like
    /// [`Self::swap`] without `force`: the old instance is kept for
    /// rollback until the new one is bound.
    ///
    /// # Errors
    /// Any resolver, guard, construction, init, health, or deadline
    /// failure; no `current` is installed on failure and the partial
    /// instance has been cleaned up best-effort.
    pub async fn activate(
        &self,
        domain: Domain,
        key: &str,
        opts: &ActivateOptions,
    ) -> Result<Handle, LifecycleError> {
        let slot = Slot::new(domain, key);
        let lock = self.binding(&slot);
        let mut binding = lock.lock().await;
        binding.activity = self.activity.flags(&slot);

        if binding.current.is_some() {
            return self
                .swap_locked(&slot, &mut binding, &opts.resolve, false, opts.cancel.as_ref())
                .await;
        }

        let started = std::time::Instant::now();
        let resolution = match self.resolver.resolve(domain, key, &opts.resolve) {
            Ok(r) => r,
            Err(err) => {
                binding.last_error = Some(err.to_string());
                self.persist(&slot, &binding);
                self.sink.incr(counters::ACTIVATE_ERR);
                self.sink.emit(&Event::ActivateFailure {
                    domain,
                    key: key.to_owned(),
                    provider: None,
                    error: err.to_string(),
                });
                return Err(err.into());
            }
        };
        let candidate = resolution.selected;

        self.sink.emit(&Event::ActivateStart {
            domain,
            key: key.to_owned(),
            provider: candidate.provider.clone(),
        });
        binding.state = BindingState::Activating;
        self.persist(&slot, &binding);

        match self
            .build_deadlined(&slot, &candidate, opts.cancel.as_ref())
            .await
        {
            Ok((live, probe)) => {
                let handle = Self::handle_for(&slot, &live);
                binding.current = Some(live);
                binding.state = BindingState::Ready;
                binding.last_activated_at = Some(Utc::now());
                binding.last_error = None;
                if let Some(probe) = probe {
                    binding.last_health_at = Some(probe.checked_at);
                    binding.last_health_ok = Some(probe.healthy);
                }
                self.persist(&slot, &binding);

                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.sink.incr(counters::ACTIVATE_OK);
                self.sink.observe_ms(histograms::ACTIVATE_DURATION_MS, elapsed_ms);
                self.sink.emit(&Event::ActivateSuccess {
                    domain,
                    key: key.to_owned(),
                    provider: candidate.provider.clone(),
                    elapsed_ms,
                });
                Ok(handle)
            }
            Err(err) => {
                binding.state = BindingState::Failed;
                binding.last_error = Some(err.to_string());
                self.persist(&slot, &binding);
                self.sink.incr(counters::ACTIVATE_ERR);
                self.sink.emit(&Event::ActivateFailure {
                    domain,
                    key: key.to_owned(),
                    provider: Some(candidate.provider.clone()),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Replaces the current instance with a freshly-resolved one,
    /// rolling back on failure unless `opts.force`.
    ///
    /// # Errors
    /// [`LifecycleError::SwapFailed`] with `rolled_back = true` when the
    /// previous instance was re-installed (its cleanup was not invoked),
    /// `false` when there was nothing to restore or `force` discarded it.
    pub async fn swap(
        &self,
        domain: Domain,
        key: &str,
        opts: &SwapOptions,
    ) -> Result<Handle, LifecycleError> {
        let slot = Slot::new(domain, key);
        let lock = self.binding(&slot);
        let mut binding = lock.lock().await;
        binding.activity = self.activity.flags(&slot);
        self.swap_locked(&slot, &mut binding, &opts.resolve, opts.force, opts.cancel.as_ref())
            .await
    }

    async fn swap_locked(
        &self,
        slot: &Slot,
        binding: &mut ActiveBinding,
        resolve: &ResolveOptions,
        force: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<Handle, LifecycleError> {
        let started = std::time::Instant::now();
        let from = binding.current.as_ref().map(|l| l.provider().to_owned());

        let resolution = match self.resolver.resolve(slot.domain, &slot.key, resolve) {
            Ok(r) => r,
            Err(err) => {
                binding.last_error = Some(err.to_string());
                self.persist(slot, binding);
                return Err(err.into());
            }
        };
        let candidate = resolution.selected;
        let to = candidate.provider.clone();

        self.sink.emit(&Event::SwapStart {
            domain: slot.domain,
            key: slot.key.clone(),
            from: from.clone(),
            to: to.clone(),
        });
        binding.state = BindingState::Swapping;
        self.persist(slot, binding);

        // Hooks fire before the replacement is constructed; a failing
        // hook aborts the swap with the old instance untouched.
        if let Err(err) = self.run_pre_swap_hooks(slot, &candidate, cancel).await {
            return self.fail_swap(slot, binding, &to, force, err).await;
        }

        match self.build_deadlined(slot, &candidate, cancel).await {
            Ok((live, probe)) => {
                let handle = Self::handle_for(slot, &live);
                binding.previous = binding.current.take();
                binding.current = Some(live);
                binding.state = BindingState::Ready;
                binding.last_activated_at = Some(Utc::now());
                binding.last_error = None;
                if let Some(probe) = probe {
                    binding.last_health_at = Some(probe.checked_at);
                    binding.last_health_ok = Some(probe.healthy);
                }
                self.persist(slot, binding);

                self.run_post_swap_hooks(slot, &candidate).await;

                if let Some(old) = binding.previous.take() {
                    self.cleanup_instance(slot, &old).await;
                    self.persist(slot, binding);
                }

                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.sink.incr(counters::SWAP_OK);
                self.sink.observe_ms(histograms::SWAP_DURATION_MS, elapsed_ms);
                self.sink.emit(&Event::SwapSuccess {
                    domain: slot.domain,
                    key: slot.key.clone(),
                    from,
                    to,
                    elapsed_ms,
                });
                Ok(handle)
            }
            Err(err) => self.fail_swap(slot, binding, &to, force, err).await,
        }
    }

    /// Failure path shared by hook and construction errors. The candidate
    /// instance (if any) is already cleaned up by `build_instance`.
    async fn fail_swap(
        &self,
        slot: &Slot,
        binding: &mut ActiveBinding,
        to: &str,
        force: bool,
        cause: LifecycleError,
    ) -> Result<Handle, LifecycleError> {
        let rolled_back = if force {
            // Force discards the old instance regardless.
            if let Some(old) = binding.current.take() {
                self.cleanup_instance(slot, &old).await;
            }
            binding.state = BindingState::Failed;
            false
        } else if binding.current.is_some() {
            // The old instance never left `current`; restoring it is a
            // matter of state only -- its cleanup was not invoked.
            binding.state = BindingState::Ready;
            self.sink.incr(counters::ROLLBACK_OK);
            self.sink.emit(&Event::RollbackSuccess {
                domain: slot.domain,
                key: slot.key.clone(),
                provider: binding
                    .current
                    .as_ref()
                    .map(|l| l.provider().to_owned())
                    .unwrap_or_default(),
            });
            true
        } else {
            binding.state = BindingState::Failed;
            false
        };

        binding.last_error = Some(cause.to_string());
        self.persist(slot, binding);

        self.sink.incr(counters::SWAP_ERR);
        self.sink.emit(&Event::SwapFailure {
            domain: slot.domain,
            key: slot.key.clone(),
            to: to.to_owned(),
            rolled_back,
            error: cause.to_string(),
        });

        Err(LifecycleError::SwapFailed {
            slot: slot.clone(),
            to: to.to_owned(),
            rolled_back,
            source: anyhow::Error::new(cause),
        })
    }

    /// [`Self::build_instance`] under the overall activate deadline.
    async fn build_deadlined(
        &self,
        slot: &Slot,
        candidate: &Arc<Candidate>,
        cancel: Option<&CancellationToken>,
    ) -> Result<(LiveInstance, Option<HealthResult>), LifecycleError> {
        let overall = self.timeouts.activate;
        match tokio::time::timeout(overall, self.build_instance(slot, candidate, cancel)).await {
            Ok(result) => result,
            Err(_) => Err(LifecycleError::Timeout {
                slot: slot.clone(),
                op: "activate",
                timeout_ms: overall.as_millis() as u64,
            }),
        }
    }

    /// Constructs, initializes, and health-checks a new instance. On any
    /// failure the partial instance is cleaned up best-effort and the
    /// step's error is returned.
    async fn build_instance(
        &self,
        slot: &Slot,
        candidate: &Arc<Candidate>,
        cancel: Option<&CancellationToken>,
    ) -> Result<(LiveInstance, Option<HealthResult>), LifecycleError> {
        let factory = self.guard.resolve(&candidate.factory)?;
        let settings = self
            .settings
            .settings_for(&slot.key, candidate)
            .map_err(|source| LifecycleError::ActivateFailed {
                slot: slot.clone(),
                provider: Some(candidate.provider.clone()),
                source,
            })?;

        let instance = match self
            .deadlined(slot, "factory", self.timeouts.init, cancel, factory.create(settings))
            .await?
        {
            Ok(instance) => instance,
            Err(source) => {
                return Err(LifecycleError::ActivateFailed {
                    slot: slot.clone(),
                    provider: Some(candidate.provider.clone()),
                    source,
                });
            }
        };
        let live = LiveInstance {
            candidate: candidate.clone(),
            instance,
        };

        if let Err(err) = self
            .deadlined(slot, "init", self.timeouts.init, cancel, live.instance.init())
            .await
            .and_then(|inner| {
                inner.map_err(|source| LifecycleError::ActivateFailed {
                    slot: slot.clone(),
                    provider: Some(candidate.provider.clone()),
                    source,
                })
            })
        {
            self.cleanup_instance(slot, &live).await;
            return Err(err);
        }

        let probe = health::probe(candidate, &live.instance, self.timeouts.health).await;
        if !probe.healthy {
            self.cleanup_instance(slot, &live).await;
            return Err(LifecycleError::HealthCheckFailed {
                slot: slot.clone(),
                provider: candidate.provider.clone(),
                reason: probe
                    .error
                    .unwrap_or_else(|| format!("probe '{}' returned false", probe.probe)),
            });
        }

        Ok((live, Some(probe)))
    }

    /// Races a step against its deadline and external cancellation. The
    /// step's own result stays nested so callers attribute errors.
    async fn deadlined<T>(
        &self,
        slot: &Slot,
        op: &'static str,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
        fut: impl std::future::Future<Output = T>,
    ) -> Result<T, LifecycleError> {
        let deadline = tokio::time::timeout(timeout, fut);
        let outcome = match cancel {
            Some(token) => {
                tokio::select! {
                    () = token.cancelled() => {
                        return Err(LifecycleError::Cancelled { slot: slot.clone() });
                    }
                    outcome = deadline => outcome,
                }
            }
            None => deadline.await,
        };
        outcome.map_err(|_| LifecycleError::Timeout {
            slot: slot.clone(),
            op,
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    async fn run_pre_swap_hooks(
        &self,
        slot: &Slot,
        candidate: &Candidate,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), LifecycleError> {
        let hooks: Vec<Arc<dyn SwapHook>> = self.hooks.read().swap.clone();
        for hook in hooks {
            let outcome = self
                .deadlined(slot, "pre_swap hook", self.timeouts.hook, cancel, hook.pre_swap(slot, candidate))
                .await?;
            outcome.map_err(|source| LifecycleError::ActivateFailed {
                slot: slot.clone(),
                provider: Some(candidate.provider.clone()),
                source: source.context("pre_swap hook rejected the swap"),
            })?;
        }
        Ok(())
    }

    /// Post-swap hook failures are logged, never propagated: the new
    /// instance is already bound.
    async fn run_post_swap_hooks(&self, slot: &Slot, candidate: &Candidate) {
        let hooks: Vec<Arc<dyn SwapHook>> = self.hooks.read().swap.clone();
        for hook in hooks {
            match tokio::time::timeout(self.timeouts.hook, hook.post_swap(slot, candidate)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(slot = %slot, error = %err, "post_swap hook failed");
                }
                Err(_) => {
                    tracing::warn!(slot = %slot, "post_swap hook timed out");
                }
            }
        }
    }

    /// Best-effort cleanup: the instance's first supported release method
    /// (`cleanup`, `close`, `shutdown`), then registered cleanup hooks.
    /// Shielded from external cancellation -- only its own deadlines bound
    /// it. Errors are logged and counted, never propagated.
    async fn cleanup_instance(&self, slot: &Slot, live: &LiveInstance) {
        let provider = live.provider().to_owned();
        let release = async {
            if let Some(result) = live.instance.cleanup().await {
                return ("cleanup", result);
            }
            if let Some(result) = live.instance.close().await {
                return ("close", result);
            }
            if let Some(result) = live.instance.shutdown().await {
                return ("shutdown", result);
            }
            ("none", Ok(()))
        };
        match tokio::time::timeout(self.timeouts.cleanup, release).await {
            Ok((method, Ok(()))) => {
                tracing::debug!(slot = %slot, provider = %provider, method, "Instance released");
            }
            Ok((method, Err(err))) => {
                self.sink.incr(counters::CLEANUP_ERR);
                tracing::warn!(slot = %slot, provider = %provider, method, error = %err, "Instance release failed");
            }
            Err(_) => {
                self.sink.incr(counters::CLEANUP_ERR);
                tracing::warn!(slot = %slot, provider = %provider, "Instance release timed out");
            }
        }

        let hooks: Vec<Arc<dyn CleanupHook>> = self.hooks.read().cleanup.clone();
        for hook in hooks {
            match tokio::time::timeout(self.timeouts.hook, hook.on_cleanup(slot, &provider)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.sink.incr(counters::CLEANUP_ERR);
                    tracing::warn!(slot = %slot, error = %err, "Cleanup hook failed");
                }
                Err(_) => {
                    self.sink.incr(counters::CLEANUP_ERR);
                    tracing::warn!(slot = %slot, "Cleanup hook timed out");
                }
            }
        }
    }

    /// Runs the health probe against the current instance without
    /// touching the binding.
    ///
    /// # Errors
    /// [`LifecycleError::NotActive`] when the slot holds no instance.
    pub async fn probe(&self, domain: Domain, key: &str) -> Result<HealthResult, LifecycleError> {
        let slot = Slot::new(domain, key);
        let lock = self.binding(&slot);
        let mut binding = lock.lock().await;
        let Some(live) = binding.current.clone() else {
            return Err(LifecycleError::NotActive { slot });
        };

        let result = health::probe(&live.candidate, &live.instance, self.timeouts.health).await;
        binding.last_health_at = Some(result.checked_at);
        binding.last_health_ok = Some(result.healthy);
        self.persist(&slot, &binding);

        self.sink.incr(if result.healthy {
            counters::HEALTH_OK
        } else {
            counters::HEALTH_ERR
        });
        self.sink.emit(&Event::HealthProbe {
            domain,
            key: key.to_owned(),
            provider: result.provider.clone(),
            healthy: result.healthy,
            elapsed_ms: result.elapsed_ms,
        });
        Ok(result)
    }

    /// Flags the slot paused; watchers skip pending swaps while set.
    ///
    /// # Errors
    /// Persistence failures from the activity store.
    pub async fn pause(
        &self,
        domain: Domain,
        key: &str,
        note: Option<String>,
    ) -> Result<ActivityFlags, LifecycleError> {
        let slot = Slot::new(domain, key);
        let flags = self.activity.pause(&slot, note)?;
        self.mirror_activity(&slot, flags.clone()).await;
        Ok(flags)
    }

    /// Flags the slot draining; watchers defer pending swaps while set.
    ///
    /// # Errors
    /// Persistence failures from the activity store.
    pub async fn drain(
        &self,
        domain: Domain,
        key: &str,
        note: Option<String>,
    ) -> Result<ActivityFlags, LifecycleError> {
        let slot = Slot::new(domain, key);
        let flags = self.activity.drain(&slot, note)?;
        self.mirror_activity(&slot, flags.clone()).await;
        Ok(flags)
    }

    /// Clears pause and drain flags.
    ///
    /// # Errors
    /// Persistence failures from the activity store.
    pub async fn resume(&self, domain: Domain, key: &str) -> Result<ActivityFlags, LifecycleError> {
        let slot = Slot::new(domain, key);
        let flags = self.activity.resume(&slot)?;
        self.mirror_activity(&slot, flags.clone()).await;
        Ok(flags)
    }

    async fn mirror_activity(&self, slot: &Slot, flags: ActivityFlags) {
        let lock = self.binding(slot);
        let mut binding = lock.lock().await;
        binding.activity = flags;
        self.persist(slot, &binding);
    }

    /// In-memory status of one slot (falls back to defaults when the slot
    /// was never touched).
    pub async fn status_of(&self, domain: Domain, key: &str) -> StatusSnapshot {
        let slot = Slot::new(domain, key);
        let lock = self.binding(&slot);
        let mut binding = lock.lock().await;
        binding.activity = self.activity.flags(&slot);
        binding.snapshot(&slot)
    }

    /// Snapshots of every binding in a domain.
    pub async fn list_bindings(&self, domain: Domain) -> Vec<StatusSnapshot> {
        let slots: Vec<Slot> = self
            .bindings
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|slot| slot.domain == domain)
            .collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            let lock = self.binding(&slot);
            let binding = lock.lock().await;
            out.push(binding.snapshot(&slot));
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Releases every live instance and marks bindings drained. Called by
    /// the orchestrator on shutdown; never fails.
    pub async fn shutdown_all(&self) {
        let slots: Vec<Slot> = self.bindings.iter().map(|e| e.key().clone()).collect();
        for slot in slots {
            let lock = self.binding(&slot);
            let mut binding = lock.lock().await;
            if let Some(old) = binding.previous.take() {
                self.cleanup_instance(&slot, &old).await;
            }
            if let Some(current) = binding.current.take() {
                self.cleanup_instance(&slot, &current).await;
                binding.state = BindingState::Drained;
            }
            self.persist(&slot, &binding);
        }
    }
}
