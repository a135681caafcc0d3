//! Operator configuration.
//!
//! Strongly-typed sections with `deny_unknown_fields` everywhere, layered
//! loading (defaults → YAML file → `ONEIRIC__`-prefixed environment), and
//! a YAML dump of the effective configuration for operators.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::Domain;
use crate::lifecycle::LifecycleTimeouts;
use crate::resilience::RetryPolicy;
use crate::resolver::{Selections, StackOrder};

/// Execution profile.
///
/// `Serverless` disables the watcher and long-running loops and turns the
/// remote refresh into a one-shot sync so cold starts stay fast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Default,
    Serverless,
}

/// Main configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OneiricConfig {
    /// Explicit `(domain, key) → provider` overrides.
    #[serde(default)]
    pub selections: BTreeMap<Domain, BTreeMap<String, String>>,
    /// Opaque per-provider settings objects, validated by factories.
    #[serde(default)]
    pub provider_settings: BTreeMap<String, serde_json::Value>,
    /// Operator stack ordering feeding effective priorities.
    #[serde(default)]
    pub stack_order: BTreeMap<String, i32>,
    /// Module prefixes the factory guard accepts.
    #[serde(default)]
    pub factory_allowlist: Vec<String>,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub activity: ActivityConfig,
    #[serde(default)]
    pub watchers: WatcherConfig,
    #[serde(default)]
    pub profile: Profile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub manifest_url: Option<String>,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// `0` means one-shot sync (no refresh loop).
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: f64,
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_breaker_reset_secs")]
    pub circuit_breaker_reset_secs: u64,
    #[serde(default = "default_latency_budget_ms")]
    pub latency_budget_ms: u64,
    #[serde(default = "default_verify_signature")]
    pub verify_signature: bool,
    /// Base64-encoded Ed25519 public keys; any one verifying accepts.
    #[serde(default)]
    pub trusted_public_keys: Vec<String>,
    /// When set, manifests with `signed_at` older than this are rejected.
    #[serde(default)]
    pub manifest_max_age_secs: Option<u64>,
    /// Tolerated clock skew for `signed_at` in the future.
    #[serde(default = "default_allowed_skew_secs")]
    pub manifest_allowed_skew_secs: u64,
    #[serde(default)]
    pub allow_private_ips: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            manifest_url: None,
            cache_dir: default_cache_dir(),
            refresh_interval_secs: default_refresh_interval_secs(),
            http_timeout_secs: default_http_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_jitter: default_retry_jitter(),
            circuit_breaker_threshold: default_breaker_threshold(),
            circuit_breaker_reset_secs: default_breaker_reset_secs(),
            latency_budget_ms: default_latency_budget_ms(),
            verify_signature: default_verify_signature(),
            trusted_public_keys: Vec::new(),
            manifest_max_age_secs: None,
            manifest_allowed_skew_secs: default_allowed_skew_secs(),
            allow_private_ips: false,
        }
    }
}

impl RemoteConfig {
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.max(1),
            base_delay_ms: self.retry_base_delay_ms,
            max_delay_ms: self.retry_max_delay_ms,
            factor: 2.0,
            jitter: self.retry_jitter,
        }
    }

    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LifecycleConfig {
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,
    #[serde(default = "default_cleanup_timeout_secs")]
    pub cleanup_timeout_secs: u64,
    #[serde(default = "default_hook_timeout_secs")]
    pub hook_timeout_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            init_timeout_secs: default_init_timeout_secs(),
            health_timeout_secs: default_health_timeout_secs(),
            cleanup_timeout_secs: default_cleanup_timeout_secs(),
            hook_timeout_secs: default_hook_timeout_secs(),
        }
    }
}

impl LifecycleConfig {
    #[must_use]
    pub fn timeouts(&self) -> LifecycleTimeouts {
        LifecycleTimeouts {
            activate: Duration::from_secs(30),
            init: Duration::from_secs(self.init_timeout_secs),
            health: Duration::from_secs(self.health_timeout_secs),
            hook: Duration::from_secs(self.hook_timeout_secs),
            cleanup: Duration::from_secs(self.cleanup_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActivityConfig {
    #[serde(default = "default_activity_store_path")]
    pub store_path: PathBuf,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            store_path: default_activity_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatcherConfig {
    #[serde(default = "default_watchers_enabled")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: default_watchers_enabled(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".oneiric/cache")
}
fn default_refresh_interval_secs() -> u64 {
    300
}
fn default_http_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    500
}
fn default_retry_max_delay_ms() -> u64 {
    30_000
}
fn default_retry_jitter() -> f64 {
    0.1
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_reset_secs() -> u64 {
    60
}
fn default_latency_budget_ms() -> u64 {
    2_000
}
fn default_verify_signature() -> bool {
    true
}
fn default_allowed_skew_secs() -> u64 {
    300
}
fn default_init_timeout_secs() -> u64 {
    30
}
fn default_health_timeout_secs() -> u64 {
    5
}
fn default_cleanup_timeout_secs() -> u64 {
    10
}
fn default_hook_timeout_secs() -> u64 {
    5
}
fn default_activity_store_path() -> PathBuf {
    PathBuf::from(".oneiric/activity.json")
}
fn default_watchers_enabled() -> bool {
    true
}
fn default_poll_interval_secs() -> u64 {
    5
}

impl OneiricConfig {
    /// Layered loading: defaults → YAML file → environment variables.
    /// `ONEIRIC__REMOTE__ENABLED=true` maps to `remote.enabled`.
    ///
    /// # Errors
    /// Fails on unreadable YAML, unknown keys, or type mismatches.
    pub fn load_layered(config_path: &PathBuf) -> Result<Self> {
        use figment::providers::{Env, Format, Serialized, Yaml};
        use figment::Figment;

        let mut config: OneiricConfig = Figment::new()
            .merge(Serialized::defaults(OneiricConfig::default()))
            .merge(Yaml::file(config_path))
            .merge(Env::prefixed("ONEIRIC__").split("__"))
            .extract()
            .context("Failed to extract configuration")?;

        config.apply_profile();
        Ok(config)
    }

    /// Loads from a file when given, defaults otherwise.
    ///
    /// # Errors
    /// Fails when a path is given but no file exists there, or on any
    /// parse error.
    pub fn load_or_default(config_path: Option<&PathBuf>) -> Result<Self> {
        match config_path {
            Some(path) => {
                ensure!(
                    path.is_file(),
                    "config file does not exist: {}",
                    path.display()
                );
                Self::load_layered(path)
            }
            None => {
                let mut config = Self::default();
                config.apply_profile();
                Ok(config)
            }
        }
    }

    /// Enforces profile-implied settings.
    pub fn apply_profile(&mut self) {
        if self.profile == Profile::Serverless {
            self.watchers.enabled = false;
            self.remote.refresh_interval_secs = 0;
        }
    }

    /// Effective configuration as YAML, for `oneiric config`.
    ///
    /// # Errors
    /// Serialization failures only.
    pub fn to_yaml(&self) -> Result<String> {
        serde_saphyr::to_string(self).context("Failed to serialize config to YAML")
    }

    #[must_use]
    pub fn resolver_selections(&self) -> Selections {
        Selections(self.selections.clone())
    }

    #[must_use]
    pub fn resolver_stack_order(&self) -> StackOrder {
        StackOrder(self.stack_order.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = OneiricConfig::default();
        assert!(!config.remote.enabled);
        assert!(config.remote.verify_signature);
        assert!(config.watchers.enabled);
        assert_eq!(config.watchers.poll_interval_secs, 5);
        assert_eq!(config.lifecycle.health_timeout_secs, 5);
        assert_eq!(config.profile, Profile::Default);
    }

    #[test]
    fn serverless_profile_disables_loops() {
        let mut config = OneiricConfig {
            profile: Profile::Serverless,
            ..OneiricConfig::default()
        };
        config.apply_profile();
        assert!(!config.watchers.enabled);
        assert_eq!(config.remote.refresh_interval_secs, 0);
    }

    #[test]
    fn yaml_round_trip_with_selections() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("oneiric.yaml");
        std::fs::write(
            &path,
            r"
selections:
  adapter:
    cache: redis
  service:
    payment: stripe
stack_order:
  redis: 10
factory_allowlist:
  - myapp.providers
remote:
  enabled: true
  manifest_url: https://cdn.example/manifest.yaml
  verify_signature: false
watchers:
  poll_interval_secs: 2
",
        )
        .unwrap();

        let config = OneiricConfig::load_layered(&path).unwrap();
        assert_eq!(
            config.selections[&Domain::Adapter]["cache"],
            "redis".to_owned()
        );
        assert_eq!(config.stack_order["redis"], 10);
        assert!(config.remote.enabled);
        assert!(!config.remote.verify_signature);
        assert_eq!(config.watchers.poll_interval_secs, 2);
        // Untouched sections keep defaults.
        assert_eq!(config.lifecycle.init_timeout_secs, 30);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("oneiric.yaml");
        std::fs::write(&path, "nonsense_section:\n  a: 1\n").unwrap();
        assert!(OneiricConfig::load_layered(&path).is_err());
    }

    #[test]
    fn missing_file_is_an_error_when_named() {
        let missing = PathBuf::from("/definitely/not/here.yaml");
        assert!(OneiricConfig::load_or_default(Some(&missing)).is_err());
        assert!(OneiricConfig::load_or_default(None).is_ok());
    }

    #[test]
    fn retry_policy_maps_fields() {
        let config = RemoteConfig {
            max_retries: 5,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 2_000,
            retry_jitter: 0.0,
            ..RemoteConfig::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_for(2).as_millis(), 200);
    }

    #[test]
    fn effective_config_dumps_to_yaml() {
        let yaml = OneiricConfig::default().to_yaml().unwrap();
        assert!(yaml.contains("remote"));
        assert!(yaml.contains("watchers"));
    }
}
