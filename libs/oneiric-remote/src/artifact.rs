//! Artifact download, digest enforcement, and cache containment.
//!
//! Every artifact lands in a bounded cache directory. Filename derivation
//! is strictly contained: traversal components (including percent-encoded
//! ones), separators, and absolute paths are rejected before any byte is
//! written, and the final path is re-checked after symlink resolution.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use url::Url;

use oneiric::events::{counters, ObservabilitySink};

use crate::error::RemoteError;
use crate::loader::ManifestLoader;

/// A verified artifact in the cache.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub path: PathBuf,
    pub sha256: String,
    pub len: u64,
}

/// Owns the artifact cache directory; the only writer to it.
pub struct ArtifactManager {
    cache_root: PathBuf,
    sink: Arc<dyn ObservabilitySink>,
}

impl ArtifactManager {
    /// Creates the cache directory and pins its canonical path.
    ///
    /// # Errors
    /// Filesystem errors creating or resolving the directory.
    pub fn new(
        cache_root: impl Into<PathBuf>,
        sink: Arc<dyn ObservabilitySink>,
    ) -> Result<Self, RemoteError> {
        let requested = cache_root.into();
        std::fs::create_dir_all(&requested).map_err(|source| RemoteError::Store {
            path: requested.clone(),
            source,
        })?;
        let cache_root = requested
            .canonicalize()
            .map_err(|source| RemoteError::Store {
                path: requested,
                source,
            })?;
        Ok(Self { cache_root, sink })
    }

    #[must_use]
    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Downloads `uri`, verifies its SHA-256 equals `expected_sha256`,
    /// and stores it under the cache root.
    ///
    /// # Errors
    /// [`RemoteError::UnsafeArtifactUri`], [`RemoteError::PathTraversalBlocked`],
    /// [`RemoteError::DigestMismatch`], or fetch/store failures. Nothing
    /// is written on any failure path.
    pub async fn store(
        &self,
        loader: &ManifestLoader,
        uri: &str,
        expected_sha256: &str,
    ) -> Result<StoredArtifact, RemoteError> {
        let url = Url::parse(uri).map_err(|e| RemoteError::UnsafeArtifactUri {
            uri: uri.to_owned(),
            reason: e.to_string(),
        })?;
        let filename = derive_filename(&url)?;
        let target = self.contained_path(&filename)?;

        let bytes = loader.fetch_url(&url).await?;

        let actual = hex::encode(Sha256::digest(&bytes));
        let expected = expected_sha256.to_ascii_lowercase();
        if actual != expected {
            self.sink.incr(counters::DIGEST_ERR);
            return Err(RemoteError::DigestMismatch {
                uri: uri.to_owned(),
                expected,
                actual,
            });
        }
        self.sink.incr(counters::DIGEST_OK);

        let tmp = target.with_extension("part");
        let write = || -> std::io::Result<()> {
            std::fs::write(&tmp, &bytes)?;
            std::fs::rename(&tmp, &target)
        };
        write().map_err(|source| RemoteError::Store {
            path: target.clone(),
            source,
        })?;

        // Containment must hold after symlink resolution too.
        let resolved = target.canonicalize().map_err(|source| RemoteError::Store {
            path: target.clone(),
            source,
        })?;
        if !resolved.starts_with(&self.cache_root) {
            let _ = std::fs::remove_file(&resolved);
            return Err(RemoteError::PathTraversalBlocked {
                reason: "artifact resolved outside the cache directory".to_owned(),
            });
        }

        tracing::info!(
            uri,
            path = %resolved.display(),
            bytes = bytes.len(),
            "Artifact cached"
        );
        Ok(StoredArtifact {
            path: resolved,
            sha256: actual,
            len: bytes.len() as u64,
        })
    }

    /// Joins a derived filename to the cache root, lexically verified.
    fn contained_path(&self, filename: &str) -> Result<PathBuf, RemoteError> {
        let joined = self.cache_root.join(filename);
        if !joined.starts_with(&self.cache_root) {
            return Err(RemoteError::PathTraversalBlocked {
                reason: format!("filename '{filename}' escapes the cache directory"),
            });
        }
        Ok(joined)
    }
}

/// Derives the cache filename from the final URL path segment. Every
/// segment is percent-decoded and checked: a traversal component anywhere
/// in the path poisons the whole URI.
fn derive_filename(url: &Url) -> Result<String, RemoteError> {
    let segments: Vec<String> = url
        .path_segments()
        .map(|segments| {
            segments
                .map(|segment| {
                    urlencoding::decode(segment)
                        .map(|decoded| decoded.into_owned())
                        .map_err(|e| RemoteError::UnsafeArtifactUri {
                            uri: url.to_string(),
                            reason: format!("path is not valid UTF-8 after decoding: {e}"),
                        })
                })
                .collect()
        })
        .transpose()?
        .unwrap_or_default();

    if segments
        .iter()
        .any(|segment| segment == ".." || segment.contains('/') || segment.contains('\\'))
    {
        return Err(RemoteError::PathTraversalBlocked {
            reason: "URI path contains a traversal component".to_owned(),
        });
    }

    let name = segments.last().map(String::as_str).unwrap_or_default();
    if name.is_empty() || name == "." {
        return Err(RemoteError::PathTraversalBlocked {
            reason: format!("unusable artifact filename '{name}'"),
        });
    }
    if name.contains('\0') || name.contains("..") {
        return Err(RemoteError::PathTraversalBlocked {
            reason: format!("suspicious artifact filename '{name}'"),
        });
    }
    Ok(name.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn plain_filename_is_accepted() {
        assert_eq!(
            derive_filename(&url("https://cdn.example/pkgs/x.whl")).unwrap(),
            "x.whl"
        );
    }

    #[test]
    fn percent_encoded_traversal_is_defused_or_blocked() {
        // The URL parser already collapses encoded dot segments
        // (WHATWG double-dot handling); whatever survives must be a bare
        // filename with no separators.
        match derive_filename(&url("https://host/%2E%2E/key")) {
            Ok(name) => assert_eq!(name, "key"),
            Err(err) => assert!(matches!(err, RemoteError::PathTraversalBlocked { .. })),
        }
        for uri in ["https://host/pkgs/%2E%2E", "https://host/..%2fescape.whl"] {
            let err = derive_filename(&url(uri)).unwrap_err();
            assert!(
                matches!(err, RemoteError::PathTraversalBlocked { .. }),
                "{uri}: {err}"
            );
        }
    }

    #[test]
    fn encoded_separator_is_blocked() {
        let err = derive_filename(&url("https://host/a%2Fb")).unwrap_err();
        assert!(matches!(err, RemoteError::PathTraversalBlocked { .. }));
    }

    #[test]
    fn empty_segment_is_blocked() {
        let err = derive_filename(&url("https://host/dir/")).unwrap_err();
        assert!(matches!(err, RemoteError::PathTraversalBlocked { .. }));
    }
}
