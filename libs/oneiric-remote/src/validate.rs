//! Manifest entry validation.
//!
//! Checks domain, label charsets, factory form, bounds, and URI scheme
//! before an entry reaches the factory guard and the registry. Produces
//! the registry-ready candidate spec.

use std::str::FromStr;

use oneiric::candidate::{
    CandidateMeta, CandidateSource, CandidateSpec, FactorySpec, PRIORITY_RANGE, STACK_LEVEL_RANGE,
};
use oneiric::domain::{is_valid_label, Domain};

use crate::error::RemoteError;
use crate::manifest::ManifestEntry;

fn invalid(entry: &ManifestEntry, reason: impl Into<String>) -> RemoteError {
    RemoteError::InvalidEntry {
        domain: entry.domain.clone(),
        key: entry.key.clone(),
        provider: entry.provider.clone(),
        reason: reason.into(),
    }
}

/// Validates one wire entry into a [`CandidateSpec`].
///
/// # Errors
/// [`RemoteError::InvalidEntry`] or [`RemoteError::UnsafeArtifactUri`]
/// naming the offending field.
pub fn validate_entry(entry: &ManifestEntry) -> Result<CandidateSpec, RemoteError> {
    let domain = Domain::from_str(&entry.domain).map_err(|e| invalid(entry, e.to_string()))?;

    if !is_valid_label(&entry.key) {
        return Err(invalid(entry, format!("invalid key '{}'", entry.key)));
    }
    if !is_valid_label(&entry.provider) {
        return Err(invalid(
            entry,
            format!("invalid provider '{}'", entry.provider),
        ));
    }
    if !entry.factory.contains(':') {
        return Err(invalid(
            entry,
            format!("factory '{}' is not in module:symbol form", entry.factory),
        ));
    }
    if let Some(priority) = entry.priority {
        if !PRIORITY_RANGE.contains(&priority) {
            return Err(invalid(entry, format!("priority {priority} out of range")));
        }
    }
    if let Some(stack_level) = entry.stack_level {
        if !STACK_LEVEL_RANGE.contains(&stack_level) {
            return Err(invalid(
                entry,
                format!("stack_level {stack_level} out of range"),
            ));
        }
    }

    match (&entry.uri, &entry.sha256) {
        (Some(uri), Some(sha)) => {
            if !uri.starts_with("https://") && !uri.starts_with("http://") {
                return Err(RemoteError::UnsafeArtifactUri {
                    uri: uri.clone(),
                    reason: "only http(s) artifact URIs are accepted".to_owned(),
                });
            }
            if sha.len() != 64 || !sha.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid(entry, format!("sha256 '{sha}' is not hex SHA-256")));
            }
        }
        (Some(_), None) => {
            return Err(invalid(entry, "artifact uri declared without sha256"));
        }
        (None, Some(_)) => {
            return Err(invalid(entry, "sha256 declared without artifact uri"));
        }
        (None, None) => {}
    }

    let mut meta: CandidateMeta = match &entry.metadata {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| invalid(entry, format!("metadata rejected: {e}")))?,
        None => CandidateMeta::default(),
    };
    for capability in &entry.capabilities {
        meta.capabilities.insert(capability.clone());
    }
    if meta.version.is_none() {
        meta.version.clone_from(&entry.version);
    }

    let mut spec = CandidateSpec::new(
        domain,
        entry.key.clone(),
        entry.provider.clone(),
        FactorySpec::Symbolic(entry.factory.clone()),
    )
    .source(CandidateSource::Remote)
    .meta(meta);
    spec.priority = entry.priority;
    spec.stack_level = entry.stack_level.unwrap_or(0);
    spec.digest = entry.sha256.as_ref().map(|s| s.to_ascii_lowercase());
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> ManifestEntry {
        serde_json::from_value(serde_json::json!({
            "domain": "adapter",
            "key": "cache",
            "provider": "redis",
            "factory": "myapp.providers:redis",
            "capabilities": ["kv"],
            "version": "1.2.0",
            "stack_level": 10
        }))
        .unwrap()
    }

    #[test]
    fn valid_entry_becomes_a_remote_spec() {
        let spec = validate_entry(&entry()).unwrap();
        assert_eq!(spec.domain, Domain::Adapter);
        assert_eq!(spec.source, CandidateSource::Remote);
        assert_eq!(spec.stack_level, 10);
        assert!(spec.meta.capabilities.contains("kv"));
        assert_eq!(spec.meta.version.as_deref(), Some("1.2.0"));
    }

    #[test]
    fn unknown_domain_is_invalid() {
        let mut e = entry();
        e.domain = "plugin".to_owned();
        let err = validate_entry(&e).unwrap_err();
        assert!(matches!(err, RemoteError::InvalidEntry { .. }), "{err}");
    }

    #[test]
    fn bad_labels_are_invalid() {
        let mut e = entry();
        e.key = "ca che".to_owned();
        assert!(validate_entry(&e).is_err());

        let mut e = entry();
        e.provider = "re/dis".to_owned();
        assert!(validate_entry(&e).is_err());
    }

    #[test]
    fn non_symbolic_factory_is_invalid() {
        let mut e = entry();
        e.factory = "just-a-name".to_owned();
        assert!(validate_entry(&e).is_err());
    }

    #[test]
    fn out_of_range_bounds_are_invalid() {
        let mut e = entry();
        e.priority = Some(2000);
        assert!(validate_entry(&e).is_err());

        let mut e = entry();
        e.stack_level = Some(-500);
        assert!(validate_entry(&e).is_err());
    }

    #[test]
    fn uri_and_sha256_must_travel_together() {
        let mut e = entry();
        e.uri = Some("https://cdn.example/x.whl".to_owned());
        assert!(validate_entry(&e).is_err());

        let mut e = entry();
        e.sha256 = Some("a".repeat(64));
        assert!(validate_entry(&e).is_err());

        let mut e = entry();
        e.uri = Some("https://cdn.example/x.whl".to_owned());
        e.sha256 = Some("A".repeat(64));
        let spec = validate_entry(&e).unwrap();
        assert_eq!(spec.digest.as_deref(), Some("a".repeat(64).as_str()));
    }

    #[test]
    fn file_uri_is_unsafe() {
        let mut e = entry();
        e.uri = Some("file:///../etc/passwd".to_owned());
        e.sha256 = Some("a".repeat(64));
        let err = validate_entry(&e).unwrap_err();
        assert!(matches!(err, RemoteError::UnsafeArtifactUri { .. }));
    }

    #[test]
    fn metadata_merges_with_entry_capabilities() {
        let mut e = entry();
        e.metadata = Some(serde_json::json!({
            "capabilities": ["ttl"],
            "owner": "platform-team"
        }));
        let spec = validate_entry(&e).unwrap();
        assert!(spec.meta.capabilities.contains("kv"));
        assert!(spec.meta.capabilities.contains("ttl"));
        assert_eq!(spec.meta.owner.as_deref(), Some("platform-team"));
    }
}
