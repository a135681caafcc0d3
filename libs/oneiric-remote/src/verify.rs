//! Manifest signature and freshness verification.
//!
//! A manifest is accepted when verification is disabled by explicit
//! configuration, or when at least one trusted Ed25519 key verifies the
//! signature over the canonical form. A present `signed_at` must fall
//! inside the configured freshness window.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use chrono::Utc;
use ed25519_dalek::{Signature, VerifyingKey};

use oneiric::config::RemoteConfig;
use oneiric::events::{counters, ObservabilitySink};

use crate::canonical::canonical_bytes;
use crate::error::RemoteError;
use crate::manifest::RemoteManifest;

pub struct ManifestVerifier {
    verify_signature: bool,
    trusted_keys: Vec<VerifyingKey>,
    max_age: Option<Duration>,
    allowed_skew: Duration,
    sink: Arc<dyn ObservabilitySink>,
}

impl ManifestVerifier {
    /// Builds a verifier from configuration, decoding the trusted keys.
    ///
    /// # Errors
    /// [`RemoteError::SignatureInvalid`] for malformed keys; enabling
    /// verification with no trusted keys is rejected outright.
    pub fn from_config(
        config: &RemoteConfig,
        sink: Arc<dyn ObservabilitySink>,
    ) -> Result<Self, RemoteError> {
        let mut trusted_keys = Vec::with_capacity(config.trusted_public_keys.len());
        for encoded in &config.trusted_public_keys {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| RemoteError::SignatureInvalid {
                    reason: format!("trusted key is not valid base64: {e}"),
                })?;
            let bytes: [u8; 32] = bytes.try_into().map_err(|_| RemoteError::SignatureInvalid {
                reason: "trusted key must decode to 32 bytes".to_owned(),
            })?;
            let key =
                VerifyingKey::from_bytes(&bytes).map_err(|e| RemoteError::SignatureInvalid {
                    reason: format!("trusted key rejected: {e}"),
                })?;
            trusted_keys.push(key);
        }

        if config.verify_signature && trusted_keys.is_empty() {
            return Err(RemoteError::SignatureInvalid {
                reason: "verification enabled but no trusted public keys configured".to_owned(),
            });
        }

        Ok(Self {
            verify_signature: config.verify_signature,
            trusted_keys,
            max_age: config.manifest_max_age_secs.map(Duration::from_secs),
            allowed_skew: Duration::from_secs(config.manifest_allowed_skew_secs),
            sink,
        })
    }

    /// Verifies one parsed manifest against its raw document.
    ///
    /// # Errors
    /// [`RemoteError::SignatureInvalid`] or [`RemoteError::ManifestExpired`].
    pub fn verify(
        &self,
        manifest: &RemoteManifest,
        raw: &serde_json::Value,
    ) -> Result<(), RemoteError> {
        self.check_freshness(manifest)?;

        if !self.verify_signature {
            tracing::debug!(source = %manifest.source, "Signature verification disabled by configuration");
            return Ok(());
        }

        let result = self.check_signature(manifest, raw);
        self.sink.incr(if result.is_ok() {
            counters::SIGNATURE_OK
        } else {
            counters::SIGNATURE_ERR
        });
        result
    }

    fn check_signature(
        &self,
        manifest: &RemoteManifest,
        raw: &serde_json::Value,
    ) -> Result<(), RemoteError> {
        if let Some(algorithm) = manifest.signature_algorithm.as_deref() {
            if algorithm != "ed25519" {
                return Err(RemoteError::SignatureInvalid {
                    reason: format!("unsupported signature algorithm '{algorithm}'"),
                });
            }
        }

        let encoded = manifest
            .signature
            .as_deref()
            .ok_or_else(|| RemoteError::SignatureInvalid {
                reason: "manifest carries no signature".to_owned(),
            })?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| RemoteError::SignatureInvalid {
                reason: format!("signature is not valid base64: {e}"),
            })?;
        let signature =
            Signature::from_slice(&bytes).map_err(|e| RemoteError::SignatureInvalid {
                reason: format!("signature malformed: {e}"),
            })?;

        let canonical = canonical_bytes(raw)?;
        let accepted = self
            .trusted_keys
            .iter()
            .any(|key| key.verify_strict(&canonical, &signature).is_ok());
        if accepted {
            Ok(())
        } else {
            Err(RemoteError::SignatureInvalid {
                reason: format!(
                    "no trusted key ({} configured) verifies the manifest",
                    self.trusted_keys.len()
                ),
            })
        }
    }

    fn check_freshness(&self, manifest: &RemoteManifest) -> Result<(), RemoteError> {
        let Some(signed_at) = manifest.signed_at else {
            // Absent signed_at is accepted; deployments that require it
            // set manifest_max_age_secs and sign with timestamps.
            return Ok(());
        };
        let now = Utc::now();

        if let Some(max_age) = self.max_age {
            let age = now.signed_duration_since(signed_at);
            if age.num_seconds() > 0 && age.to_std().unwrap_or_default() > max_age {
                return Err(RemoteError::ManifestExpired {
                    reason: format!(
                        "signed_at {signed_at} is older than max_age {}s",
                        max_age.as_secs()
                    ),
                });
            }
        }

        let ahead = signed_at.signed_duration_since(now);
        if ahead.num_seconds() > 0 && ahead.to_std().unwrap_or_default() > self.allowed_skew {
            return Err(RemoteError::ManifestExpired {
                reason: format!(
                    "signed_at {signed_at} is further than {}s in the future",
                    self.allowed_skew.as_secs()
                ),
            });
        }
        Ok(())
    }
}
