//! Domain bridges: the uniform per-domain façade.
//!
//! A bridge exposes `use_slot`, `pause`, `drain`, `resume`, `explain`,
//! and listing operations for one domain. It owns the per-provider
//! settings cache and hands the lifecycle manager only a
//! [`SettingsProvider`] handle, which keeps the bridge ↔ manager
//! observation acyclic.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::activity::{ActivityFlags, ActivityStore};
use crate::candidate::Candidate;
use crate::domain::Domain;
use crate::lifecycle::{ActivateOptions, Handle, LifecycleError, LifecycleManager, SwapOptions};
use crate::resolver::{ExplanationTrace, ResolveOptions, Resolver};
use crate::status::StatusSnapshot;

/// Supplies the settings value injected into a provider factory.
pub trait SettingsProvider: Send + Sync + 'static {
    /// Settings for constructing `candidate` in slot `key`; `None` when
    /// the candidate declares no `settings_model`.
    ///
    /// # Errors
    /// Implementations fail when a declared model has no usable settings.
    fn settings_for(
        &self,
        key: &str,
        candidate: &Candidate,
    ) -> anyhow::Result<Option<serde_json::Value>>;
}

/// Provider that never injects settings.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSettings;

impl SettingsProvider for NoSettings {
    fn settings_for(
        &self,
        _key: &str,
        _candidate: &Candidate,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        Ok(None)
    }
}

/// Per-`(key, provider)` settings cache fed by the operator's
/// `provider_settings` map.
///
/// A candidate declaring a `settings_model` receives the settings object
/// configured for its provider; the looked-up value is cached until the
/// slot swaps or the configuration signals a change.
#[derive(Default)]
pub struct SettingsCache {
    provider_settings: ArcSwap<BTreeMap<String, serde_json::Value>>,
    cache: DashMap<(String, String), Arc<serde_json::Value>>,
}

impl SettingsCache {
    #[must_use]
    pub fn new(provider_settings: BTreeMap<String, serde_json::Value>) -> Arc<Self> {
        Arc::new(Self {
            provider_settings: ArcSwap::from_pointee(provider_settings),
            cache: DashMap::new(),
        })
    }

    /// Replaces the backing settings map and drops every cached value.
    pub fn replace(&self, provider_settings: BTreeMap<String, serde_json::Value>) {
        self.provider_settings.store(Arc::new(provider_settings));
        self.cache.clear();
    }

    /// Invalidates the cached value for one `(key, provider)` pair.
    pub fn invalidate(&self, key: &str, provider: &str) {
        self.cache.remove(&(key.to_owned(), provider.to_owned()));
    }
}

impl SettingsProvider for SettingsCache {
    fn settings_for(
        &self,
        key: &str,
        candidate: &Candidate,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        let Some(model) = candidate.meta.settings_model.as_deref() else {
            return Ok(None);
        };

        let cache_key = (key.to_owned(), candidate.provider.clone());
        if let Some(cached) = self.cache.get(&cache_key) {
            return Ok(Some(cached.as_ref().clone()));
        }

        let settings = self.provider_settings.load();
        let Some(value) = settings.get(&candidate.provider) else {
            anyhow::bail!(
                "provider '{}' declares settings_model '{model}' but no provider_settings entry exists",
                candidate.provider
            );
        };
        let value = Arc::new(value.clone());
        self.cache.insert(cache_key, value.clone());
        Ok(Some(value.as_ref().clone()))
    }
}

/// Options for [`DomainBridge::use_slot`].
#[derive(Debug, Clone, Default)]
pub struct UseOptions {
    /// Re-activate even when a live instance exists.
    pub refresh: bool,
    pub resolve: ResolveOptions,
}

/// Per-domain façade over resolver + lifecycle manager.
pub struct DomainBridge {
    domain: Domain,
    resolver: Arc<Resolver>,
    lifecycle: Arc<LifecycleManager>,
    settings: Arc<SettingsCache>,
    activity: Arc<ActivityStore>,
}

impl DomainBridge {
    pub fn new(
        domain: Domain,
        resolver: Arc<Resolver>,
        lifecycle: Arc<LifecycleManager>,
        settings: Arc<SettingsCache>,
        activity: Arc<ActivityStore>,
    ) -> Self {
        Self {
            domain,
            resolver,
            lifecycle,
            settings,
            activity,
        }
    }

    #[must_use]
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Returns a handle to the slot's live instance, activating one when
    /// none exists (or when `opts.refresh` forces it).
    ///
    /// Pausing a slot does not reject `use_slot`: the flag only gates
    /// watcher-driven swaps.
    ///
    /// # Errors
    /// Resolver and lifecycle failures, unchanged.
    pub async fn use_slot(&self, key: &str, opts: &UseOptions) -> Result<Handle, LifecycleError> {
        if !opts.refresh {
            if let Some(handle) = self.lifecycle.current_handle(self.domain, key).await {
                return Ok(handle);
            }
        }
        self.lifecycle
            .activate(
                self.domain,
                key,
                &ActivateOptions {
                    resolve: opts.resolve.clone(),
                    cancel: None,
                },
            )
            .await
    }

    /// Swaps the slot to an explicitly-chosen provider.
    ///
    /// # Errors
    /// [`LifecycleError::SwapFailed`] (with rollback state) and resolver
    /// failures.
    pub async fn swap(
        &self,
        key: &str,
        provider: &str,
        force: bool,
    ) -> Result<Handle, LifecycleError> {
        let before = self.lifecycle.current_handle(self.domain, key).await;
        let result = self
            .lifecycle
            .swap(
                self.domain,
                key,
                &SwapOptions {
                    resolve: ResolveOptions::with_provider(provider),
                    force,
                    cancel: None,
                },
            )
            .await;

        // The settings cache is scoped per (key, provider); drop both
        // sides of the swap so re-activations re-read configuration.
        if let Some(old) = before {
            self.settings.invalidate(key, &old.provider);
        }
        self.settings.invalidate(key, provider);
        result
    }

    /// # Errors
    /// Activity store persistence failures.
    pub async fn pause(
        &self,
        key: &str,
        note: Option<String>,
    ) -> Result<ActivityFlags, LifecycleError> {
        self.lifecycle.pause(self.domain, key, note).await
    }

    /// # Errors
    /// Activity store persistence failures.
    pub async fn drain(
        &self,
        key: &str,
        note: Option<String>,
    ) -> Result<ActivityFlags, LifecycleError> {
        self.lifecycle.drain(self.domain, key, note).await
    }

    /// # Errors
    /// Activity store persistence failures.
    pub async fn resume(&self, key: &str) -> Result<ActivityFlags, LifecycleError> {
        self.lifecycle.resume(self.domain, key).await
    }

    /// Activity flags as currently stored.
    #[must_use]
    pub fn activity(&self, key: &str) -> ActivityFlags {
        self.activity
            .flags(&crate::domain::Slot::new(self.domain, key))
    }

    /// Explains the resolution for one key, success or failure.
    #[must_use]
    pub fn explain(&self, key: &str, opts: &ResolveOptions) -> ExplanationTrace {
        self.resolver.explain(self.domain, key, opts)
    }

    /// Status snapshots of every binding the lifecycle manager holds for
    /// this domain.
    pub async fn list_active(&self) -> Vec<StatusSnapshot> {
        self.lifecycle.list_bindings(self.domain).await
    }

    /// Shadowed providers per key, from the resolver's traces.
    #[must_use]
    pub fn list_shadowed(&self, registry_keys: &[String]) -> BTreeMap<String, Vec<String>> {
        registry_keys
            .iter()
            .map(|key| {
                let trace = self.resolver.explain(self.domain, key, &ResolveOptions::default());
                let shadowed = trace
                    .considered
                    .iter()
                    .filter(|c| !c.selected)
                    .map(|c| c.provider.clone())
                    .collect();
                (key.clone(), shadowed)
            })
            .collect()
    }
}

/// The adapter-domain specialization: `category` is the key synonym, and
/// multi-category selection comes as a convenience.
pub struct AdapterBridge {
    inner: DomainBridge,
}

impl AdapterBridge {
    pub fn new(
        resolver: Arc<Resolver>,
        lifecycle: Arc<LifecycleManager>,
        settings: Arc<SettingsCache>,
        activity: Arc<ActivityStore>,
    ) -> Self {
        Self {
            inner: DomainBridge::new(Domain::Adapter, resolver, lifecycle, settings, activity),
        }
    }

    #[must_use]
    pub fn bridge(&self) -> &DomainBridge {
        &self.inner
    }

    /// `use_slot` with the adapter vocabulary.
    ///
    /// # Errors
    /// Same as [`DomainBridge::use_slot`].
    pub async fn use_category(
        &self,
        category: &str,
        opts: &UseOptions,
    ) -> Result<Handle, LifecycleError> {
        self.inner.use_slot(category, opts).await
    }

    /// Activates several categories, failing on the first error.
    ///
    /// # Errors
    /// The first category that fails aborts the batch; earlier handles
    /// stay live.
    pub async fn use_categories(
        &self,
        categories: &[&str],
        opts: &UseOptions,
    ) -> Result<Vec<(String, Handle)>, LifecycleError> {
        let mut out = Vec::with_capacity(categories.len());
        for category in categories {
            let handle = self.inner.use_slot(category, opts).await?;
            out.push(((*category).to_owned(), handle));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{CandidateSpec, FactorySpec};
    use crate::instance::FactoryFn;

    fn candidate_with_model(provider: &str, model: Option<&str>) -> Candidate {
        let mut spec = CandidateSpec::new(
            Domain::Adapter,
            "cache",
            provider,
            FactorySpec::Callable(FactoryFn::new(|_| anyhow::bail!("unused"))),
        );
        spec.meta.settings_model = model.map(str::to_owned);
        Candidate::from_spec(spec, 1)
    }

    #[test]
    fn no_settings_model_means_no_injection() {
        let cache = SettingsCache::new(BTreeMap::new());
        let candidate = candidate_with_model("redis", None);
        assert!(cache.settings_for("cache", &candidate).unwrap().is_none());
    }

    #[test]
    fn declared_model_requires_provider_settings() {
        let cache = SettingsCache::new(BTreeMap::new());
        let candidate = candidate_with_model("redis", Some("RedisSettings"));
        let err = cache.settings_for("cache", &candidate).unwrap_err();
        assert!(err.to_string().contains("RedisSettings"));
    }

    #[test]
    fn settings_are_cached_until_invalidated() {
        let mut map = BTreeMap::new();
        map.insert("redis".to_owned(), serde_json::json!({"url": "redis://a"}));
        let cache = SettingsCache::new(map);
        let candidate = candidate_with_model("redis", Some("RedisSettings"));

        let first = cache.settings_for("cache", &candidate).unwrap().unwrap();
        assert_eq!(first["url"], "redis://a");

        // Replacing the map without invalidation: cached value sticks.
        let mut map = BTreeMap::new();
        map.insert("redis".to_owned(), serde_json::json!({"url": "redis://b"}));
        cache.provider_settings.store(Arc::new(map));
        let second = cache.settings_for("cache", &candidate).unwrap().unwrap();
        assert_eq!(second["url"], "redis://a");

        cache.invalidate("cache", "redis");
        let third = cache.settings_for("cache", &candidate).unwrap().unwrap();
        assert_eq!(third["url"], "redis://b");
    }

    #[test]
    fn replace_drops_all_cached_values() {
        let mut map = BTreeMap::new();
        map.insert("redis".to_owned(), serde_json::json!({"url": "redis://a"}));
        let cache = SettingsCache::new(map);
        let candidate = candidate_with_model("redis", Some("RedisSettings"));
        cache.settings_for("cache", &candidate).unwrap();

        let mut map = BTreeMap::new();
        map.insert("redis".to_owned(), serde_json::json!({"url": "redis://c"}));
        cache.replace(map);

        let value = cache.settings_for("cache", &candidate).unwrap().unwrap();
        assert_eq!(value["url"], "redis://c");
    }
}
