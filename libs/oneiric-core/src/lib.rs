//! Oneiric core -- a resolution + lifecycle layer for pluggable
//! infrastructure components.
//!
//! Applications declare what they need by `(domain, key)` -- e.g.
//! `(adapter, cache)` or `(service, payment)` -- and Oneiric chooses a
//! concrete provider among registered candidates, instantiates it,
//! supervises its lifecycle (init → health-check → bind → cleanup), and
//! swaps providers at runtime when the operator selection changes.
//!
//! High-level flow:
//! - candidates are registered into the [`registry::CandidateRegistry`]
//!   (locally, via compile-time entry points, or from remote manifests),
//! - the [`resolver::Resolver`] picks a winner per slot and explains why,
//! - the [`lifecycle::LifecycleManager`] activates the winner through the
//!   [`factory::FactoryGuard`] and keeps it swap-safe,
//! - per-domain [`bridge::DomainBridge`] façades expose
//!   `use / pause / drain / explain` to callers,
//! - the [`orchestrator::Orchestrator`] supervises watchers and background
//!   loops as one process.

pub mod activity;
pub mod bridge;
pub mod candidate;
pub mod config;
pub mod domain;
pub mod events;
pub mod factory;
pub mod health;
pub mod instance;
pub mod lifecycle;
pub mod orchestrator;
pub mod registry;
pub mod resilience;
pub mod resolver;
pub mod status;
pub mod watcher;

pub use activity::{ActivityFlags, ActivityStore};
pub use bridge::{AdapterBridge, DomainBridge, SettingsCache, SettingsProvider, UseOptions};
pub use candidate::{Candidate, CandidateMeta, CandidateSource, CandidateSpec, FactorySpec};
pub use config::{OneiricConfig, Profile};
pub use domain::{Domain, Slot};
pub use events::{Event, ObservabilitySink, TracingSink};
pub use factory::{FactoryGuard, FactoryIndex};
pub use instance::{HealthCheck, ProviderFactory, ProviderInstance};
pub use lifecycle::{
    ActivateOptions, Handle, LifecycleError, LifecycleManager, LifecycleTimeouts, SwapOptions,
};
pub use orchestrator::{Orchestrator, RunnableTask};
pub use registry::{CandidateRegistry, RegistryError};
pub use resolver::{
    ExplanationTrace, OverridePolicy, ResolveError, ResolveOptions, Resolution, Resolver,
    Selections, StackOrder,
};
pub use status::{StatusSnapshot, StatusStore};
