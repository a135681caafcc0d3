//! Manifest and artifact fetching.
//!
//! HTTP requests carry an overall timeout and retry with jittered
//! backoff. The loader refuses to talk to private, loopback, or
//! link-local addresses -- whether given literally or resolved through
//! DNS -- unless the operator explicitly allows it.

use std::net::IpAddr;
use std::path::PathBuf;

use url::Url;

use oneiric::config::RemoteConfig;
use oneiric::resilience::RetryPolicy;

use crate::error::RemoteError;

/// Where a manifest comes from.
#[derive(Debug, Clone)]
pub enum ManifestSource {
    Url(Url),
    Path(PathBuf),
}

impl ManifestSource {
    /// Parses an operator-supplied location: URLs by scheme prefix,
    /// anything else as a local path.
    ///
    /// # Errors
    /// [`RemoteError::UnsafeArtifactUri`] for malformed URLs.
    pub fn parse(location: &str) -> Result<Self, RemoteError> {
        if location.starts_with("https://") || location.starts_with("http://") {
            let url = Url::parse(location).map_err(|e| RemoteError::UnsafeArtifactUri {
                uri: location.to_owned(),
                reason: e.to_string(),
            })?;
            Ok(ManifestSource::Url(url))
        } else {
            Ok(ManifestSource::Path(PathBuf::from(location)))
        }
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            ManifestSource::Url(url) => url.to_string(),
            ManifestSource::Path(path) => path.display().to_string(),
        }
    }
}

/// HTTP/file loader with retry, timeout, and address guarding.
pub struct ManifestLoader {
    client: reqwest::Client,
    retry: RetryPolicy,
    allow_private_ips: bool,
}

impl ManifestLoader {
    /// # Errors
    /// Client construction failures (TLS backend).
    pub fn from_config(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|source| RemoteError::Fetch {
                uri: "<client construction>".to_owned(),
                source,
            })?;
        Ok(Self {
            client,
            retry: config.retry_policy(),
            allow_private_ips: config.allow_private_ips,
        })
    }

    /// Loads manifest bytes from the source.
    ///
    /// # Errors
    /// Read/fetch failures after retries, or the address guard.
    pub async fn load(&self, source: &ManifestSource) -> Result<Vec<u8>, RemoteError> {
        match source {
            ManifestSource::Path(path) => {
                tokio::fs::read(path)
                    .await
                    .map_err(|source| RemoteError::Read {
                        path: path.clone(),
                        source,
                    })
            }
            ManifestSource::Url(url) => self.fetch_url(url).await,
        }
    }

    /// Fetches a URL with the guard and retry policy applied. Shared by
    /// the manifest path and the artifact manager.
    ///
    /// # Errors
    /// [`RemoteError::UnsafeArtifactUri`] from the guard, or the last
    /// fetch error once retries are exhausted.
    pub async fn fetch_url(&self, url: &Url) -> Result<Vec<u8>, RemoteError> {
        self.guard_url(url).await?;

        let mut last_err: Option<RemoteError> = None;
        for attempt in 1..=self.retry.max_attempts {
            match self.fetch_once(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    tracing::warn!(
                        uri = %url,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        error = %err,
                        "Fetch attempt failed"
                    );
                    last_err = Some(err);
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RemoteError::NotConfigured {
            reason: "retry loop ran zero attempts".to_owned(),
        }))
    }

    async fn fetch_once(&self, url: &Url) -> Result<Vec<u8>, RemoteError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|source| RemoteError::Fetch {
                uri: url.to_string(),
                source,
            })?;
        let bytes = response.bytes().await.map_err(|source| RemoteError::Fetch {
            uri: url.to_string(),
            source,
        })?;
        Ok(bytes.to_vec())
    }

    /// Scheme and address policy. HTTPS is required unless private
    /// addresses are explicitly allowed (development escape hatch, which
    /// also unlocks plain HTTP for local fixtures).
    async fn guard_url(&self, url: &Url) -> Result<(), RemoteError> {
        match url.scheme() {
            "https" => {}
            "http" if self.allow_private_ips => {}
            other => {
                return Err(RemoteError::UnsafeArtifactUri {
                    uri: url.to_string(),
                    reason: format!("scheme '{other}' is not allowed"),
                });
            }
        }

        if self.allow_private_ips {
            return Ok(());
        }

        let host = url.host_str().ok_or_else(|| RemoteError::UnsafeArtifactUri {
            uri: url.to_string(),
            reason: "URL has no host".to_owned(),
        })?;

        let addrs: Vec<IpAddr> = if let Ok(ip) = host.parse::<IpAddr>() {
            vec![ip]
        } else {
            let port = url.port_or_known_default().unwrap_or(443);
            tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| RemoteError::UnsafeArtifactUri {
                    uri: url.to_string(),
                    reason: format!("host resolution failed: {e}"),
                })?
                .map(|addr| addr.ip())
                .collect()
        };

        if let Some(private) = addrs.iter().find(|ip| is_private_address(**ip)) {
            return Err(RemoteError::UnsafeArtifactUri {
                uri: url.to_string(),
                reason: format!("resolves to private address {private}"),
            });
        }
        Ok(())
    }
}

/// Link-local, loopback, RFC1918, unspecified, and ULA addresses.
fn is_private_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 (unique local)
                || (segments[0] & 0xfe00) == 0xfc00
                // fe80::/10 (link local)
                || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}
