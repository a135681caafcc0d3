//! The candidate model: one registered provider for a `(domain, key)` slot.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::{Domain, Slot};
use crate::instance::{HealthCheck, ProviderFactory};

/// Bounds for `priority`.
pub const PRIORITY_RANGE: std::ops::RangeInclusive<i32> = -1000..=1000;
/// Bounds for `stack_level`.
pub const STACK_LEVEL_RANGE: std::ops::RangeInclusive<i32> = -100..=100;

/// How a candidate constructs its provider instance.
#[derive(Clone)]
pub enum FactorySpec {
    /// In-process callable, accepted as-is (in-language registration only).
    Callable(Arc<dyn ProviderFactory>),
    /// Symbolic `module:symbol` reference, resolved through the
    /// [`crate::factory::FactoryGuard`] allow-list.
    Symbolic(String),
}

impl fmt::Debug for FactorySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactorySpec::Callable(_) => write!(f, "Callable(<factory>)"),
            FactorySpec::Symbolic(s) => write!(f, "Symbolic({s:?})"),
        }
    }
}

impl FactorySpec {
    /// The symbolic descriptor, when present.
    #[must_use]
    pub fn symbolic(&self) -> Option<&str> {
        match self {
            FactorySpec::Callable(_) => None,
            FactorySpec::Symbolic(s) => Some(s),
        }
    }
}

/// Provenance of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    /// Registered in-process by the host application.
    Local,
    /// Discovered through compile-time entry points (`inventory`).
    EntryPoint,
    /// Ingested from a remote manifest.
    Remote,
}

impl fmt::Display for CandidateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CandidateSource::Local => "local",
            CandidateSource::EntryPoint => "entry_point",
            CandidateSource::Remote => "remote",
        };
        f.write_str(s)
    }
}

/// Closed candidate metadata record.
///
/// Only `capabilities` is interpreted by the core (capability filtering);
/// every other field is carried for operators and tooling. Fields the wire
/// format sends beyond this set land in `extra` untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateMeta {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub capabilities: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_secrets: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effect_free: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicts_with: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation_url: Option<String>,
    /// Opaque carry-through for any additional fields.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl CandidateMeta {
    /// Whether this candidate satisfies every capability in `required`.
    #[must_use]
    pub fn satisfies(&self, required: &BTreeSet<String>) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }
}

/// Registration input. The registry validates it, assigns a sequence
/// number, and stores the result as a [`Candidate`].
#[derive(Clone)]
pub struct CandidateSpec {
    pub domain: Domain,
    pub key: String,
    pub provider: String,
    pub factory: FactorySpec,
    pub priority: Option<i32>,
    pub stack_level: i32,
    pub source: CandidateSource,
    pub meta: CandidateMeta,
    pub health: Option<Arc<dyn HealthCheck>>,
    /// Content hash (hex SHA-256) when installed from a remote artifact.
    pub digest: Option<String>,
}

impl std::fmt::Debug for CandidateSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidateSpec")
            .field("domain", &self.domain)
            .field("key", &self.key)
            .field("provider", &self.provider)
            .field("factory", &self.factory)
            .field("priority", &self.priority)
            .field("stack_level", &self.stack_level)
            .field("source", &self.source)
            .field("meta", &self.meta)
            .field("digest", &self.digest)
            .finish_non_exhaustive()
    }
}

impl CandidateSpec {
    pub fn new(
        domain: Domain,
        key: impl Into<String>,
        provider: impl Into<String>,
        factory: FactorySpec,
    ) -> Self {
        Self {
            domain,
            key: key.into(),
            provider: provider.into(),
            factory,
            priority: None,
            stack_level: 0,
            source: CandidateSource::Local,
            meta: CandidateMeta::default(),
            health: None,
            digest: None,
        }
    }

    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn stack_level(mut self, stack_level: i32) -> Self {
        self.stack_level = stack_level;
        self
    }

    #[must_use]
    pub fn source(mut self, source: CandidateSource) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn capability(mut self, cap: impl Into<String>) -> Self {
        self.meta.capabilities.insert(cap.into());
        self
    }

    #[must_use]
    pub fn meta(mut self, meta: CandidateMeta) -> Self {
        self.meta = meta;
        self
    }

    #[must_use]
    pub fn health_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.health = Some(check);
        self
    }

    #[must_use]
    pub fn digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// Collects every validation problem, teacher-style: callers see all
    /// reasons at once instead of fixing them one by one.
    pub(crate) fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !crate::domain::is_valid_label(&self.key) {
            errors.push(format!("invalid key '{}'", self.key));
        }
        if !crate::domain::is_valid_label(&self.provider) {
            errors.push(format!("invalid provider '{}'", self.provider));
        }
        if let Some(p) = self.priority {
            if !PRIORITY_RANGE.contains(&p) {
                errors.push(format!(
                    "priority {p} outside [{}, {}]",
                    PRIORITY_RANGE.start(),
                    PRIORITY_RANGE.end()
                ));
            }
        }
        if !STACK_LEVEL_RANGE.contains(&self.stack_level) {
            errors.push(format!(
                "stack_level {} outside [{}, {}]",
                self.stack_level,
                STACK_LEVEL_RANGE.start(),
                STACK_LEVEL_RANGE.end()
            ));
        }
        if let FactorySpec::Symbolic(s) = &self.factory {
            if !s.contains(':') {
                errors.push(format!(
                    "symbolic factory '{s}' is not in module:symbol form"
                ));
            }
        }
        if let Some(d) = &self.digest {
            if d.len() != 64 || !d.bytes().all(|b| b.is_ascii_hexdigit()) {
                errors.push(format!("digest '{d}' is not a hex-encoded SHA-256"));
            }
        }
        errors
    }
}

/// A registered provider for a single `(domain, key)` slot.
///
/// Owned by the registry; shared by `Arc` with resolvers and the lifecycle
/// manager. Never mutated after registration -- re-registering the same
/// `(domain, key, provider)` replaces the entry wholesale.
#[derive(Clone)]
pub struct Candidate {
    pub domain: Domain,
    pub key: String,
    pub provider: String,
    pub factory: FactorySpec,
    pub priority: Option<i32>,
    pub stack_level: i32,
    /// Registration counter assigned by the registry; strictly increasing
    /// across the process lifetime.
    pub sequence: u64,
    pub source: CandidateSource,
    pub meta: CandidateMeta,
    pub health: Option<Arc<dyn HealthCheck>>,
    pub digest: Option<String>,
}

impl Candidate {
    pub(crate) fn from_spec(spec: CandidateSpec, sequence: u64) -> Self {
        Self {
            domain: spec.domain,
            key: spec.key,
            provider: spec.provider,
            factory: spec.factory,
            priority: spec.priority,
            stack_level: spec.stack_level,
            sequence,
            source: spec.source,
            meta: spec.meta,
            health: spec.health,
            digest: spec.digest,
        }
    }

    #[must_use]
    pub fn slot(&self) -> Slot {
        Slot::new(self.domain, self.key.clone())
    }
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Candidate")
            .field("domain", &self.domain)
            .field("key", &self.key)
            .field("provider", &self.provider)
            .field("factory", &self.factory)
            .field("priority", &self.priority)
            .field("stack_level", &self.stack_level)
            .field("sequence", &self.sequence)
            .field("source", &self.source)
            .field("has_health", &self.health.is_some())
            .field("digest", &self.digest)
            .finish_non_exhaustive()
    }
}
