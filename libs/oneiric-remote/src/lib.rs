//! Remote manifest pipeline for Oneiric.
//!
//! Keeps the candidate registry in sync with externally-authored,
//! Ed25519-signed manifests:
//!
//! - [`loader::ManifestLoader`] fetches the manifest (local path or
//!   HTTPS) with timeouts, retries, and a private-address guard,
//! - [`verify::ManifestVerifier`] checks the signature over the
//!   [`canonical`] form and the `signed_at` freshness window,
//! - [`artifact::ArtifactManager`] downloads declared artifacts into a
//!   contained cache directory and enforces exact SHA-256 digests,
//! - [`validate`] turns wire entries into registry candidate specs,
//! - [`sync::RemotePipeline`] composes the above under a circuit breaker
//!   and [`sync::RefreshLoop`] re-runs it on the configured interval.

pub mod artifact;
pub mod canonical;
pub mod error;
pub mod loader;
pub mod manifest;
pub mod sync;
pub mod validate;
pub mod verify;

pub use artifact::{ArtifactManager, StoredArtifact};
pub use error::RemoteError;
pub use loader::{ManifestLoader, ManifestSource};
pub use manifest::{ManifestEntry, RemoteManifest};
pub use sync::{RefreshLoop, RemotePipeline, SyncReport};
pub use verify::ManifestVerifier;
