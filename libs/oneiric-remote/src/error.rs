//! Remote pipeline error kinds.

use std::path::PathBuf;

use thiserror::Error;

use oneiric::resilience::CircuitOpen;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("failed to fetch '{uri}'")]
    Fetch {
        uri: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to read manifest file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("manifest is not valid YAML or JSON: {reason}")]
    Parse { reason: String },
    #[error("manifest signature rejected: {reason}")]
    SignatureInvalid { reason: String },
    #[error("manifest expired: {reason}")]
    ManifestExpired { reason: String },
    #[error("artifact digest mismatch for '{uri}': expected {expected}, got {actual}")]
    DigestMismatch {
        uri: String,
        expected: String,
        actual: String,
    },
    #[error("artifact path escapes the cache directory: {reason}")]
    PathTraversalBlocked { reason: String },
    #[error("unsafe artifact URI '{uri}': {reason}")]
    UnsafeArtifactUri { uri: String, reason: String },
    #[error("invalid manifest entry {domain}/{key}/{provider}: {reason}")]
    InvalidEntry {
        domain: String,
        key: String,
        provider: String,
        reason: String,
    },
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),
    #[error("failed to write artifact to {path}")]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("remote sync is not configured: {reason}")]
    NotConfigured { reason: String },
}
