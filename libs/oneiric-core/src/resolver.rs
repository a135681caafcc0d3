//! Candidate selection: "which provider wins for `(domain, key)`, and why?"
//!
//! Resolution is pure -- it never instantiates, imports, or performs I/O.
//! Every decision produces an [`ExplanationTrace`] listing all candidates
//! considered with their score components, so operators can diagnose
//! precedence without reading logs. Failures carry the same trace.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use thiserror::Error;

use crate::candidate::{Candidate, CandidateSource};
use crate::domain::Domain;
use crate::events::{counters, Event, ObservabilitySink};
use crate::registry::CandidateRegistry;

/// Effective priority supplier, fed by operator stack ordering.
pub trait PrioritySource: Send + Sync + 'static {
    /// Effective priority for a provider label, when the operator ordered
    /// it; `None` falls through to the configured default.
    fn priority_for(&self, provider: &str) -> Option<i32>;
}

/// [`PrioritySource`] backed by the `stack_order` configuration map.
#[derive(Debug, Clone, Default)]
pub struct StackOrder(pub BTreeMap<String, i32>);

impl PrioritySource for StackOrder {
    fn priority_for(&self, provider: &str) -> Option<i32> {
        self.0.get(provider).copied()
    }
}

/// Operator selection map: `domain → key → provider`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selections(pub BTreeMap<Domain, BTreeMap<String, String>>);

impl Selections {
    #[must_use]
    pub fn provider_for(&self, domain: Domain, key: &str) -> Option<&str> {
        self.0.get(&domain)?.get(key).map(String::as_str)
    }
}

/// What to do when an explicit override matches no registered provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverridePolicy {
    /// Raise [`ResolveError::UnknownProviderOverride`].
    #[default]
    Strict,
    /// Ignore the override and resolve as if none was given.
    Lenient,
}

/// Per-call resolution inputs.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Explicit provider override from the caller; takes precedence over
    /// the configured selection map.
    pub provider: Option<String>,
    /// Capabilities the selected candidate must satisfy.
    pub capabilities: BTreeSet<String>,
    pub override_policy: OverridePolicy,
}

impl ResolveOptions {
    #[must_use]
    pub fn with_provider(provider: impl Into<String>) -> Self {
        Self {
            provider: Some(provider.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn capability(mut self, cap: impl Into<String>) -> Self {
        self.capabilities.insert(cap.into());
        self
    }
}

/// Where a candidate's effective priority came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityOrigin {
    /// `candidate.priority` was set at registration.
    Explicit,
    /// Supplied by the [`PrioritySource`] (operator stack ordering).
    Stack,
    /// Neither was set; the configured default applied.
    Default,
}

/// The 5-tuple score; field order is the lexicographic comparison order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Score {
    pub override_match: u8,
    pub capability_match: usize,
    pub priority: i32,
    pub stack_level: i32,
    pub sequence: u64,
}

/// One candidate as the resolver saw it.
#[derive(Debug, Clone, Serialize)]
pub struct ConsideredCandidate {
    pub provider: String,
    pub source: CandidateSource,
    pub score: Score,
    pub priority_origin: PriorityOrigin,
    pub selected: bool,
    /// Why this candidate lost, when it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shadow_reason: Option<String>,
}

/// Pure value describing one resolution, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct ExplanationTrace {
    pub domain: Domain,
    pub key: String,
    /// Effective override (caller-supplied or from the selection map).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_override: Option<String>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub required_capabilities: BTreeSet<String>,
    pub considered: Vec<ConsideredCandidate>,
}

/// Successful resolution output.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub selected: Arc<Candidate>,
    /// Candidates considered but not selected, by descending score.
    pub shadowed: Vec<Arc<Candidate>>,
    pub trace: ExplanationTrace,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no candidate registered for {domain}/{key}")]
    NoCandidate {
        domain: Domain,
        key: String,
        trace: Box<ExplanationTrace>,
    },
    #[error("no candidate for {domain}/{key} satisfies capabilities {required:?}")]
    NoCapableCandidate {
        domain: Domain,
        key: String,
        required: BTreeSet<String>,
        trace: Box<ExplanationTrace>,
    },
    #[error("provider override '{provider}' matches no candidate for {domain}/{key}")]
    UnknownProviderOverride {
        domain: Domain,
        key: String,
        provider: String,
        trace: Box<ExplanationTrace>,
    },
}

impl ResolveError {
    /// The trace accompanying the failure.
    #[must_use]
    pub fn trace(&self) -> &ExplanationTrace {
        match self {
            ResolveError::NoCandidate { trace, .. }
            | ResolveError::NoCapableCandidate { trace, .. }
            | ResolveError::UnknownProviderOverride { trace, .. } => trace,
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            ResolveError::NoCandidate { .. } => "no-candidate",
            ResolveError::NoCapableCandidate { .. } => "no-capable-candidate",
            ResolveError::UnknownProviderOverride { .. } => "unknown-override",
        }
    }
}

/// The resolver. Selection state (operator selections, stack ordering) is
/// swappable at runtime without locking readers.
pub struct Resolver {
    registry: Arc<CandidateRegistry>,
    selections: ArcSwap<Selections>,
    // Trait objects are fat pointers, which ArcSwap cannot hold; the
    // source swaps rarely, so a read-mostly lock is fine here.
    priorities: parking_lot::RwLock<Arc<dyn PrioritySource>>,
    default_priority: i32,
    sink: Arc<dyn ObservabilitySink>,
}

impl Resolver {
    pub fn new(registry: Arc<CandidateRegistry>, sink: Arc<dyn ObservabilitySink>) -> Self {
        Self {
            registry,
            selections: ArcSwap::from_pointee(Selections::default()),
            priorities: parking_lot::RwLock::new(
                Arc::new(StackOrder::default()) as Arc<dyn PrioritySource>
            ),
            default_priority: 0,
            sink,
        }
    }

    pub fn set_selections(&self, selections: Selections) {
        self.selections.store(Arc::new(selections));
    }

    #[must_use]
    pub fn selections(&self) -> Arc<Selections> {
        self.selections.load_full()
    }

    pub fn set_priority_source(&self, source: Arc<dyn PrioritySource>) {
        *self.priorities.write() = source;
    }

    /// Selects the winning candidate for `(domain, key)`.
    ///
    /// # Errors
    /// [`ResolveError::NoCandidate`], [`ResolveError::NoCapableCandidate`],
    /// or [`ResolveError::UnknownProviderOverride`] -- each carrying the
    /// full explanation trace.
    pub fn resolve(
        &self,
        domain: Domain,
        key: &str,
        opts: &ResolveOptions,
    ) -> Result<Resolution, ResolveError> {
        let result = self.resolve_inner(domain, key, opts);
        match &result {
            Ok(resolution) => {
                self.sink.incr(counters::RESOLVE_OK);
                self.sink.emit(&Event::ResolveDecision {
                    domain,
                    key: key.to_owned(),
                    selected: Some(resolution.selected.provider.clone()),
                    outcome: "selected",
                    considered: resolution.trace.considered.len(),
                });
            }
            Err(err) => {
                self.sink.incr(counters::RESOLVE_ERR);
                self.sink.emit(&Event::ResolveDecision {
                    domain,
                    key: key.to_owned(),
                    selected: None,
                    outcome: err.outcome(),
                    considered: err.trace().considered.len(),
                });
            }
        }
        result
    }

    /// Trace-only variant of [`Self::resolve`]; failures still explain.
    #[must_use]
    pub fn explain(&self, domain: Domain, key: &str, opts: &ResolveOptions) -> ExplanationTrace {
        match self.resolve_inner(domain, key, opts) {
            Ok(resolution) => resolution.trace,
            Err(err) => err.trace().clone(),
        }
    }

    fn resolve_inner(
        &self,
        domain: Domain,
        key: &str,
        opts: &ResolveOptions,
    ) -> Result<Resolution, ResolveError> {
        let candidates = self.registry.candidates_for(domain, key);
        let required = &opts.capabilities;

        // Effective override: caller first, then the operator selection map.
        let selections = self.selections.load();
        let mut override_provider: Option<String> = opts
            .provider
            .clone()
            .or_else(|| selections.provider_for(domain, key).map(str::to_owned));

        if candidates.is_empty() {
            return Err(ResolveError::NoCandidate {
                domain,
                key: key.to_owned(),
                trace: Box::new(ExplanationTrace {
                    domain,
                    key: key.to_owned(),
                    provider_override: override_provider,
                    required_capabilities: required.clone(),
                    considered: Vec::new(),
                }),
            });
        }

        if let Some(wanted) = &override_provider {
            let known = candidates.iter().any(|c| &c.provider == wanted);
            if !known {
                match opts.override_policy {
                    OverridePolicy::Strict => {
                        let trace = self.trace_candidates(
                            domain,
                            key,
                            &candidates,
                            Some(wanted.as_str()),
                            required,
                            None,
                        );
                        return Err(ResolveError::UnknownProviderOverride {
                            domain,
                            key: key.to_owned(),
                            provider: wanted.clone(),
                            trace: Box::new(trace),
                        });
                    }
                    OverridePolicy::Lenient => {
                        tracing::debug!(
                            domain = %domain,
                            key,
                            provider = %wanted,
                            "Ignoring unmatched provider override (lenient policy)"
                        );
                        override_provider = None;
                    }
                }
            }
        }

        let scored = self.score_all(&candidates, override_provider.as_deref(), required);

        // Candidates that fail the capability filter are shadowed, never
        // selected; they still appear in the trace.
        let winner = scored
            .iter()
            .filter(|(c, _, _)| required.is_empty() || c.meta.satisfies(required))
            .max_by(|(a, sa, _), (b, sb, _)| sa.cmp(sb).then(a.sequence.cmp(&b.sequence)))
            .map(|(c, _, _)| c.clone());

        let Some(selected) = winner else {
            let trace =
                self.trace_candidates(domain, key, &candidates, override_provider.as_deref(), required, None);
            return Err(ResolveError::NoCapableCandidate {
                domain,
                key: key.to_owned(),
                required: required.clone(),
                trace: Box::new(trace),
            });
        };

        let trace = self.trace_candidates(
            domain,
            key,
            &candidates,
            override_provider.as_deref(),
            required,
            Some(&selected),
        );

        let mut shadowed: Vec<(Arc<Candidate>, Score)> = scored
            .into_iter()
            .filter(|(c, _, _)| c.sequence != selected.sequence)
            .map(|(c, s, _)| (c, s))
            .collect();
        shadowed.sort_by(|(_, a), (_, b)| b.cmp(a));

        Ok(Resolution {
            selected,
            shadowed: shadowed.into_iter().map(|(c, _)| c).collect(),
            trace,
        })
    }

    fn score_all(
        &self,
        candidates: &[Arc<Candidate>],
        override_provider: Option<&str>,
        required: &BTreeSet<String>,
    ) -> Vec<(Arc<Candidate>, Score, PriorityOrigin)> {
        let priorities = self.priorities.read().clone();
        candidates
            .iter()
            .map(|c| {
                let (priority, origin) = match c.priority {
                    Some(p) => (p, PriorityOrigin::Explicit),
                    None => match priorities.priority_for(&c.provider) {
                        Some(p) => (p.clamp(-1000, 1000), PriorityOrigin::Stack),
                        None => (self.default_priority, PriorityOrigin::Default),
                    },
                };
                let score = Score {
                    override_match: u8::from(override_provider == Some(c.provider.as_str())),
                    capability_match: required
                        .iter()
                        .filter(|cap| c.meta.capabilities.contains(*cap))
                        .count(),
                    priority,
                    stack_level: c.stack_level,
                    sequence: c.sequence,
                };
                (c.clone(), score, origin)
            })
            .collect()
    }

    fn trace_candidates(
        &self,
        domain: Domain,
        key: &str,
        candidates: &[Arc<Candidate>],
        override_provider: Option<&str>,
        required: &BTreeSet<String>,
        selected: Option<&Arc<Candidate>>,
    ) -> ExplanationTrace {
        let scored = self.score_all(candidates, override_provider, required);
        let winner_score = selected.and_then(|w| {
            scored
                .iter()
                .find(|(c, _, _)| c.sequence == w.sequence)
                .map(|(_, s, _)| *s)
        });

        let considered = scored
            .iter()
            .map(|(c, score, origin)| {
                let is_selected = selected.is_some_and(|w| w.sequence == c.sequence);
                let shadow_reason = if is_selected {
                    None
                } else if !required.is_empty() && !c.meta.satisfies(required) {
                    let missing: Vec<&str> = required
                        .iter()
                        .filter(|cap| !c.meta.capabilities.contains(*cap))
                        .map(String::as_str)
                        .collect();
                    Some(format!("missing capabilities: {}", missing.join(", ")))
                } else {
                    winner_score.map(|w| shadow_reason(&w, score))
                };
                ConsideredCandidate {
                    provider: c.provider.clone(),
                    source: c.source,
                    score: *score,
                    priority_origin: *origin,
                    selected: is_selected,
                    shadow_reason,
                }
            })
            .collect();

        ExplanationTrace {
            domain,
            key: key.to_owned(),
            provider_override: override_provider.map(str::to_owned),
            required_capabilities: required.clone(),
            considered,
        }
    }
}

/// Human-readable reason the `winner` score beat the `loser` score: the
/// first tuple component that differs, e.g. `stack_level 10 > 5`.
fn shadow_reason(winner: &Score, loser: &Score) -> String {
    if winner.override_match != loser.override_match {
        format!(
            "override_match {} > {}",
            winner.override_match, loser.override_match
        )
    } else if winner.capability_match != loser.capability_match {
        format!(
            "capability_match {} > {}",
            winner.capability_match, loser.capability_match
        )
    } else if winner.priority != loser.priority {
        format!("priority {} > {}", winner.priority, loser.priority)
    } else if winner.stack_level != loser.stack_level {
        format!("stack_level {} > {}", winner.stack_level, loser.stack_level)
    } else {
        format!("sequence {} > {}", winner.sequence, loser.sequence)
    }
}
