//! Factory guard: turns a factory descriptor into a callable safely.
//!
//! In-process callables pass through untouched. Symbolic `module:symbol`
//! descriptors are vetted against a configured allow-list of module
//! prefixes and a hard block-list, then looked up in the process-local
//! [`FactoryIndex`] -- the core never loads code dynamically. Resolution
//! results are cached per descriptor for the life of the process.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::candidate::FactorySpec;
use crate::instance::ProviderFactory;

/// Module segments that are always denied, regardless of the allow-list:
/// process/shell spawning, filesystem mutation, dynamic loading,
/// eval-style execution, and tempfile primitives.
pub const FACTORY_BLOCKLIST: &[&str] = &[
    "process",
    "subprocess",
    "shell",
    "cmd",
    "os",
    "fs",
    "shutil",
    "libloading",
    "dlopen",
    "importlib",
    "eval",
    "exec",
    "tempfile",
    "mktemp",
];

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("factory '{descriptor}' is not allowed: {reason}")]
    NotAllowed { descriptor: String, reason: String },
}

/// Process-local index of named constructors.
///
/// Host applications register every factory a symbolic descriptor may
/// refer to; the guard only ever resolves against this index.
#[derive(Default)]
pub struct FactoryIndex {
    factories: DashMap<String, Arc<dyn ProviderFactory>>,
}

impl FactoryIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor under its `module:symbol` name. Replaces
    /// any prior registration for the same name.
    pub fn insert(&self, descriptor: impl Into<String>, factory: Arc<dyn ProviderFactory>) {
        self.factories.insert(descriptor.into(), factory);
    }

    #[must_use]
    pub fn get(&self, descriptor: &str) -> Option<Arc<dyn ProviderFactory>> {
        self.factories.get(descriptor).map(|f| f.value().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

/// Validates factory descriptors and resolves them to callables.
pub struct FactoryGuard {
    allowlist: Vec<String>,
    index: Arc<FactoryIndex>,
    cache: DashMap<String, Arc<dyn ProviderFactory>>,
}

impl FactoryGuard {
    /// `allowlist` holds dotted module prefixes (e.g. `myapp.providers`);
    /// a symbolic descriptor is accepted when its module equals a prefix
    /// or lives underneath one.
    pub fn new(allowlist: Vec<String>, index: Arc<FactoryIndex>) -> Self {
        Self {
            allowlist,
            index,
            cache: DashMap::new(),
        }
    }

    /// Checks a symbolic descriptor against the allow/block lists without
    /// resolving it. Used by the remote pipeline's entry validator.
    ///
    /// # Errors
    /// Returns [`FactoryError::NotAllowed`] with the denial reason.
    pub fn ensure_allowed(&self, descriptor: &str) -> Result<(), FactoryError> {
        let (module, symbol) = descriptor.split_once(':').ok_or_else(|| {
            FactoryError::NotAllowed {
                descriptor: descriptor.to_owned(),
                reason: "not in module:symbol form".to_owned(),
            }
        })?;
        if module.is_empty() || symbol.is_empty() {
            return Err(FactoryError::NotAllowed {
                descriptor: descriptor.to_owned(),
                reason: "empty module or symbol".to_owned(),
            });
        }

        if let Some(denied) = module
            .split('.')
            .find(|segment| FACTORY_BLOCKLIST.contains(segment))
        {
            return Err(FactoryError::NotAllowed {
                descriptor: descriptor.to_owned(),
                reason: format!("module segment '{denied}' is block-listed"),
            });
        }

        let allowed = self.allowlist.iter().any(|prefix| {
            module == prefix
                || (module.len() > prefix.len()
                    && module.starts_with(prefix.as_str())
                    && module.as_bytes()[prefix.len()] == b'.')
        });
        if !allowed {
            return Err(FactoryError::NotAllowed {
                descriptor: descriptor.to_owned(),
                reason: format!("module '{module}' matches no allow-list prefix"),
            });
        }
        Ok(())
    }

    /// Resolves a factory spec to a callable.
    ///
    /// # Errors
    /// Returns [`FactoryError::NotAllowed`] when a symbolic descriptor is
    /// denied or unknown to the index.
    pub fn resolve(&self, spec: &FactorySpec) -> Result<Arc<dyn ProviderFactory>, FactoryError> {
        match spec {
            FactorySpec::Callable(factory) => Ok(factory.clone()),
            FactorySpec::Symbolic(descriptor) => {
                if let Some(cached) = self.cache.get(descriptor.as_str()) {
                    return Ok(cached.value().clone());
                }
                self.ensure_allowed(descriptor)?;
                let factory = self.index.get(descriptor).ok_or_else(|| {
                    FactoryError::NotAllowed {
                        descriptor: descriptor.clone(),
                        reason: "no factory registered under this name".to_owned(),
                    }
                })?;
                self.cache.insert(descriptor.clone(), factory.clone());
                Ok(factory)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{FactoryFn, ProviderInstance};

    struct Noop;
    impl ProviderInstance for Noop {}

    fn noop_factory() -> Arc<dyn ProviderFactory> {
        FactoryFn::new(|_| Ok(Arc::new(Noop) as Arc<dyn ProviderInstance>))
    }

    fn guard_with(allow: &[&str]) -> (FactoryGuard, Arc<FactoryIndex>) {
        let index = Arc::new(FactoryIndex::new());
        let guard = FactoryGuard::new(allow.iter().map(|s| (*s).to_owned()).collect(), index.clone());
        (guard, index)
    }

    #[test]
    fn callable_passes_through() {
        let (guard, _) = guard_with(&[]);
        let spec = FactorySpec::Callable(noop_factory());
        assert!(guard.resolve(&spec).is_ok());
    }

    #[test]
    fn symbolic_resolves_when_allowed_and_indexed() {
        let (guard, index) = guard_with(&["myapp"]);
        index.insert("myapp.providers:redis", noop_factory());

        let spec = FactorySpec::Symbolic("myapp.providers:redis".into());
        assert!(guard.resolve(&spec).is_ok());
        // Second resolution hits the cache.
        assert!(guard.resolve(&spec).is_ok());
    }

    #[test]
    fn module_outside_allowlist_is_denied() {
        let (guard, index) = guard_with(&["myapp"]);
        index.insert("otherpkg.providers:redis", noop_factory());

        let err = match guard.resolve(&FactorySpec::Symbolic("otherpkg.providers:redis".into())) {
            Ok(_) => panic!("expected resolve to fail"),
            Err(err) => err,
        };
        let FactoryError::NotAllowed { reason, .. } = err;
        assert!(reason.contains("allow-list"), "{reason}");
    }

    #[test]
    fn prefix_match_requires_dot_boundary() {
        let (guard, _) = guard_with(&["myapp"]);
        // "myapplication" must not ride on the "myapp" prefix.
        let err = guard.ensure_allowed("myapplication.providers:x").unwrap_err();
        let FactoryError::NotAllowed { reason, .. } = err;
        assert!(reason.contains("allow-list"), "{reason}");
    }

    #[test]
    fn blocklisted_segments_are_denied_even_under_allowed_prefix() {
        let (guard, _) = guard_with(&["myapp"]);
        for descriptor in [
            "myapp.subprocess:spawn",
            "myapp.os.shell:run",
            "myapp.tempfile:mkstemp",
            "myapp.eval:call",
            "myapp.fs.writer:new",
        ] {
            let err = guard.ensure_allowed(descriptor).unwrap_err();
            let FactoryError::NotAllowed { reason, .. } = err;
            assert!(reason.contains("block-listed"), "{descriptor}: {reason}");
        }
    }

    #[test]
    fn malformed_descriptors_are_denied() {
        let (guard, _) = guard_with(&["myapp"]);
        for descriptor in ["myapp.providers", ":redis", "myapp.providers:"] {
            assert!(guard.ensure_allowed(descriptor).is_err(), "{descriptor}");
        }
    }

    #[test]
    fn unindexed_symbol_is_denied() {
        let (guard, _) = guard_with(&["myapp"]);
        let err = match guard.resolve(&FactorySpec::Symbolic("myapp.providers:ghost".into())) {
            Ok(_) => panic!("expected resolve to fail"),
            Err(err) => err,
        };
        let FactoryError::NotAllowed { reason, .. } = err;
        assert!(reason.contains("no factory registered"), "{reason}");
    }
}
