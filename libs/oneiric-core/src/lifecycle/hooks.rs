//! Explicit lifecycle hook arrays.
//!
//! Hooks are passed at lifecycle manager construction or added via
//! `add_*_hook`; there is no implicit registration. `pre_swap` runs before
//! the new instance is constructed, `post_swap` after it is bound and
//! before old cleanup, `on_cleanup` after an instance's own release
//! method during cleanup.

use std::sync::Arc;

use async_trait::async_trait;

use crate::candidate::Candidate;
use crate::domain::Slot;

/// Hook invoked around swaps.
#[async_trait]
pub trait SwapHook: Send + Sync + 'static {
    /// Runs before the replacement instance is constructed. An error
    /// aborts the swap (rollback path).
    async fn pre_swap(&self, slot: &Slot, next: &Candidate) -> anyhow::Result<()> {
        let _ = (slot, next);
        Ok(())
    }

    /// Runs after the new instance is bound, before the old one is
    /// cleaned up. Errors are logged, never propagated -- the swap already
    /// happened.
    async fn post_swap(&self, slot: &Slot, bound: &Candidate) -> anyhow::Result<()> {
        let _ = (slot, bound);
        Ok(())
    }
}

/// Hook invoked while cleaning up a retired instance.
#[async_trait]
pub trait CleanupHook: Send + Sync + 'static {
    async fn on_cleanup(&self, slot: &Slot, provider: &str) -> anyhow::Result<()>;
}

/// The hook arrays carried by the lifecycle manager.
#[derive(Default, Clone)]
pub struct LifecycleHooks {
    pub swap: Vec<Arc<dyn SwapHook>>,
    pub cleanup: Vec<Arc<dyn CleanupHook>>,
}

impl LifecycleHooks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}
