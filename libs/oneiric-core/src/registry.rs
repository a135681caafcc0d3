//! Candidate registry: the set of known providers, grouped by slot.
//!
//! All mutating operations serialize on one exclusive lock; readers get
//! cloned `Arc` snapshots. Nothing here suspends -- the lock is never held
//! across an await point because no method is async.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::candidate::{Candidate, CandidateSource, CandidateSpec};
use crate::domain::Domain;
use crate::events::{Event, ObservabilitySink};

/// Structured errors for the candidate registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid candidate {domain}/{key}/{provider}:\n{reasons:#?}")]
    InvalidCandidate {
        domain: Domain,
        key: String,
        provider: String,
        reasons: Vec<String>,
    },
}

#[derive(Default)]
struct RegistryInner {
    /// Slot → candidates, keyed by provider label for replace semantics.
    slots: BTreeMap<(Domain, String), BTreeMap<String, Arc<Candidate>>>,
    next_sequence: u64,
}

/// The process-local candidate registry.
pub struct CandidateRegistry {
    inner: parking_lot::RwLock<RegistryInner>,
    sink: Arc<dyn ObservabilitySink>,
}

impl CandidateRegistry {
    pub fn new(sink: Arc<dyn ObservabilitySink>) -> Self {
        Self {
            inner: parking_lot::RwLock::new(RegistryInner::default()),
            sink,
        }
    }

    /// Validates and registers a candidate, returning its sequence number.
    ///
    /// `(domain, key, provider)` is unique: re-registering replaces the
    /// prior entry and assigns a fresh, strictly-larger sequence.
    ///
    /// # Errors
    /// Returns [`RegistryError::InvalidCandidate`] listing every field
    /// violation at once.
    pub fn register(&self, spec: CandidateSpec) -> Result<u64, RegistryError> {
        let reasons = spec.validation_errors();
        if !reasons.is_empty() {
            return Err(RegistryError::InvalidCandidate {
                domain: spec.domain,
                key: spec.key,
                provider: spec.provider,
                reasons,
            });
        }

        let (candidate, replaced) = {
            let mut inner = self.inner.write();
            inner.next_sequence += 1;
            let sequence = inner.next_sequence;
            let candidate = Arc::new(Candidate::from_spec(spec, sequence));
            let replaced = inner
                .slots
                .entry((candidate.domain, candidate.key.clone()))
                .or_default()
                .insert(candidate.provider.clone(), candidate.clone())
                .is_some();
            (candidate, replaced)
        };

        tracing::debug!(
            domain = %candidate.domain,
            key = %candidate.key,
            provider = %candidate.provider,
            source = %candidate.source,
            sequence = candidate.sequence,
            replaced,
            "Registered candidate"
        );
        self.sink.emit(&Event::Register {
            domain: candidate.domain,
            key: candidate.key.clone(),
            provider: candidate.provider.clone(),
            source: candidate.source,
            sequence: candidate.sequence,
            replaced,
        });
        Ok(candidate.sequence)
    }

    /// Removes one candidate. Idempotent; returns whether it existed.
    pub fn unregister(&self, domain: Domain, key: &str, provider: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(providers) = inner.slots.get_mut(&(domain, key.to_owned())) else {
            return false;
        };
        let removed = providers.remove(provider).is_some();
        if providers.is_empty() {
            inner.slots.remove(&(domain, key.to_owned()));
        }
        removed
    }

    /// Candidates for one slot, ordered by sequence (oldest first).
    #[must_use]
    pub fn candidates_for(&self, domain: Domain, key: &str) -> Vec<Arc<Candidate>> {
        let inner = self.inner.read();
        let mut out: Vec<Arc<Candidate>> = inner
            .slots
            .get(&(domain, key.to_owned()))
            .map(|providers| providers.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by_key(|c| c.sequence);
        out
    }

    /// Candidates in a domain (optionally narrowed to one key), ordered by
    /// sequence.
    #[must_use]
    pub fn list(&self, domain: Domain, key: Option<&str>) -> Vec<Arc<Candidate>> {
        let inner = self.inner.read();
        let mut out: Vec<Arc<Candidate>> = inner
            .slots
            .iter()
            .filter(|((d, k), _)| *d == domain && key.is_none_or(|want| k == want))
            .flat_map(|(_, providers)| providers.values().cloned())
            .collect();
        out.sort_by_key(|c| c.sequence);
        out
    }

    /// Distinct keys registered under a domain.
    #[must_use]
    pub fn keys(&self, domain: Domain) -> Vec<String> {
        let inner = self.inner.read();
        inner
            .slots
            .keys()
            .filter(|(d, _)| *d == domain)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Structurally-cloned view of every candidate, safe to hand out.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Candidate>> {
        let inner = self.inner.read();
        let mut out: Vec<Arc<Candidate>> = inner
            .slots
            .values()
            .flat_map(|providers| providers.values().cloned())
            .collect();
        out.sort_by_key(|c| c.sequence);
        out
    }

    /// Highest sequence assigned so far; observers can compare snapshots
    /// against it to detect staleness.
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.inner.read().next_sequence
    }

    /// Drops every candidate. Sequences keep increasing afterwards.
    pub fn clear(&self) {
        self.inner.write().slots.clear();
    }

    /// Registers every entry-point candidate contributed by linked crates
    /// via [`register_candidates!`](crate::register_candidates) /
    /// `inventory::submit!`. Returns how many registered.
    ///
    /// # Errors
    /// Fails on the first invalid contributed spec.
    pub fn discover_entry_points(&self) -> Result<usize, RegistryError> {
        let mut count = 0;
        for registrator in inventory::iter::<CandidateRegistrator> {
            for spec in (registrator.0)() {
                self.register(spec.source(CandidateSource::EntryPoint))?;
                count += 1;
            }
        }
        if count > 0 {
            tracing::info!(count, "Discovered entry-point candidates");
        }
        Ok(count)
    }
}

/// Entry-point registration hook, collected at link time.
///
/// Crates submit one with `inventory::submit!`:
///
/// ```ignore
/// inventory::submit! {
///     oneiric::registry::CandidateRegistrator(my_candidates)
/// }
/// ```
pub struct CandidateRegistrator(pub fn() -> Vec<CandidateSpec>);

inventory::collect!(CandidateRegistrator);
