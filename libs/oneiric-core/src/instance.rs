//! Provider construction and runtime surfaces.
//!
//! The core never links providers directly; it drives them through these
//! traits. `ProviderInstance` exposes the optional probe quartet
//! (`health`, `check_health`, `ready`, `is_healthy`) and the cleanup trio
//! (`cleanup`, `close`, `shutdown`) as default-`None` methods: a provider
//! overrides the ones it supports and the dispatch helpers in
//! [`crate::health`] try them in documented order.

use std::sync::Arc;

use async_trait::async_trait;

/// Constructs provider instances.
///
/// Factories receive the validated settings value for their provider when
/// the winning candidate declares a `settings_model`, `None` otherwise.
/// Deserializing the settings into a concrete config type is the factory's
/// job.
#[async_trait]
pub trait ProviderFactory: Send + Sync + 'static {
    async fn create(
        &self,
        settings: Option<serde_json::Value>,
    ) -> anyhow::Result<Arc<dyn ProviderInstance>>;
}

/// A live provider instance owned by the lifecycle manager.
///
/// Every method has a default implementation so that minimal providers
/// compile with an empty `impl` block.
#[async_trait]
pub trait ProviderInstance: Send + Sync + 'static {
    /// Optional initialization, run once after construction under the
    /// configured init timeout.
    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// First probe tried by the health dispatcher. `None` = unsupported.
    async fn health(&self) -> Option<anyhow::Result<bool>> {
        None
    }

    /// Second probe tried by the health dispatcher.
    async fn check_health(&self) -> Option<anyhow::Result<bool>> {
        None
    }

    /// Third probe tried by the health dispatcher.
    async fn ready(&self) -> Option<anyhow::Result<bool>> {
        None
    }

    /// Fourth probe tried by the health dispatcher.
    async fn is_healthy(&self) -> Option<anyhow::Result<bool>> {
        None
    }

    /// First release method tried during cleanup. Returning `None` means
    /// the instance does not implement it; `Some(result)` means it ran.
    async fn cleanup(&self) -> Option<anyhow::Result<()>> {
        None
    }

    /// Second release method tried during cleanup.
    async fn close(&self) -> Option<anyhow::Result<()>> {
        None
    }

    /// Third release method tried during cleanup.
    async fn shutdown(&self) -> Option<anyhow::Result<()>> {
        None
    }
}

/// Candidate-level health check, evaluated before any instance probe.
#[async_trait]
pub trait HealthCheck: Send + Sync + 'static {
    async fn check(&self) -> anyhow::Result<bool>;
}

/// Adapter turning a plain closure into a [`ProviderFactory`].
///
/// Convenient for in-process registrations and tests:
///
/// ```ignore
/// let factory = FactoryFn::new(|_settings| Ok(Arc::new(MyProvider::default()) as _));
/// ```
pub struct FactoryFn<F>(F);

impl<F> FactoryFn<F>
where
    F: Fn(Option<serde_json::Value>) -> anyhow::Result<Arc<dyn ProviderInstance>>
        + Send
        + Sync
        + 'static,
{
    pub fn new(f: F) -> Arc<Self> {
        Arc::new(Self(f))
    }
}

#[async_trait]
impl<F> ProviderFactory for FactoryFn<F>
where
    F: Fn(Option<serde_json::Value>) -> anyhow::Result<Arc<dyn ProviderInstance>>
        + Send
        + Sync
        + 'static,
{
    async fn create(
        &self,
        settings: Option<serde_json::Value>,
    ) -> anyhow::Result<Arc<dyn ProviderInstance>> {
        (self.0)(settings)
    }
}
