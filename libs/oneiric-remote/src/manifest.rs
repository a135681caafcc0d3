//! Remote manifest wire format.
//!
//! A manifest is a YAML or JSON object; parsing keeps the raw value
//! alongside the typed model because signature verification runs over the
//! canonical form of the *raw* document, not the typed projection.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

/// One provider entry in a manifest. Fields beyond the typed set are
/// carried through in `extra` untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub domain: String,
    pub key: String,
    pub provider: String,
    /// Symbolic `module:symbol` descriptor.
    pub factory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_level: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// The manifest document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteManifest {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Only `ed25519` is defined; absent means `ed25519`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_algorithm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entries: Vec<ManifestEntry>,
}

/// Parses manifest bytes as JSON first, then YAML. Returns the typed
/// manifest and the raw value (for canonicalization).
///
/// # Errors
/// [`RemoteError::Parse`] when neither format yields a manifest object.
pub fn parse(bytes: &[u8]) -> Result<(RemoteManifest, serde_json::Value), RemoteError> {
    let raw: serde_json::Value = match serde_json::from_slice(bytes) {
        Ok(value) => value,
        Err(json_err) => {
            let text = std::str::from_utf8(bytes).map_err(|e| RemoteError::Parse {
                reason: format!("not UTF-8: {e}"),
            })?;
            serde_saphyr::from_str(text).map_err(|yaml_err| RemoteError::Parse {
                reason: format!("JSON: {json_err}; YAML: {yaml_err}"),
            })?
        }
    };
    let manifest: RemoteManifest =
        serde_json::from_value(raw.clone()).map_err(|e| RemoteError::Parse {
            reason: e.to_string(),
        })?;
    Ok((manifest, raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_yaml_manifest() {
        let yaml = br"
source: cdn
signed_at: 2026-05-01T12:00:00Z
entries:
  - domain: adapter
    key: cache
    provider: redis
    factory: myapp.providers:redis
    capabilities: [kv, ttl]
    stack_level: 10
";
        let (manifest, raw) = parse(yaml).unwrap();
        assert_eq!(manifest.source, "cdn");
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries[0].provider, "redis");
        assert_eq!(manifest.entries[0].stack_level, Some(10));
        assert_eq!(raw["source"], "cdn");
    }

    #[test]
    fn parses_json_manifest_with_extra_fields() {
        let json = br#"{
            "source": "cdn",
            "entries": [{
                "domain": "task",
                "key": "send-email",
                "provider": "smtp",
                "factory": "myapp.tasks:smtp",
                "rollout_ring": 2
            }]
        }"#;
        let (manifest, _) = parse(json).unwrap();
        assert!(manifest.entries[0].extra.contains_key("rollout_ring"));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = parse(b"\x00\xffnot a manifest").unwrap_err();
        assert!(matches!(err, RemoteError::Parse { .. }));
    }

    #[test]
    fn missing_source_is_a_parse_error() {
        let err = parse(b"{\"entries\": []}").unwrap_err();
        assert!(matches!(err, RemoteError::Parse { .. }));
    }
}
