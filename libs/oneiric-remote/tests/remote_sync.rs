#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end remote pipeline behavior against a mock HTTP server:
//! registration, digest rejection, traversal blocking, signatures, and
//! the circuit breaker.

use std::sync::Arc;

use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey};
use httpmock::prelude::*;
use sha2::{Digest, Sha256};

use oneiric::candidate::CandidateSource;
use oneiric::config::RemoteConfig;
use oneiric::domain::Domain;
use oneiric::events::{counters, CapturingSink};
use oneiric::factory::{FactoryGuard, FactoryIndex};
use oneiric::registry::CandidateRegistry;
use oneiric_remote::canonical::canonical_bytes;
use oneiric_remote::{RemoteError, RemotePipeline};

struct Rig {
    registry: Arc<CandidateRegistry>,
    sink: Arc<CapturingSink>,
    cache_dir: std::path::PathBuf,
    _tmp: tempfile::TempDir,
}

impl Rig {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let sink = CapturingSink::new();
        let registry = Arc::new(CandidateRegistry::new(sink.clone()));
        Self {
            cache_dir: tmp.path().join("cache"),
            registry,
            sink,
            _tmp: tmp,
        }
    }

    fn pipeline(&self, config: RemoteConfig) -> RemotePipeline {
        let guard = Arc::new(FactoryGuard::new(
            vec!["myapp".to_owned()],
            Arc::new(FactoryIndex::new()),
        ));
        RemotePipeline::from_config(&config, self.registry.clone(), guard, self.sink.clone())
            .unwrap()
    }

    fn config(&self, manifest_url: String) -> RemoteConfig {
        RemoteConfig {
            enabled: true,
            manifest_url: Some(manifest_url),
            cache_dir: self.cache_dir.clone(),
            verify_signature: false,
            allow_private_ips: true,
            max_retries: 1,
            retry_base_delay_ms: 1,
            ..RemoteConfig::default()
        }
    }
}

#[tokio::test]
async fn sync_registers_manifest_entries() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/manifest.yaml");
        then.status(200).body(
            r"
source: cdn
entries:
  - domain: adapter
    key: cache
    provider: redis
    factory: myapp.providers:redis
    stack_level: 10
    capabilities: [kv]
  - domain: service
    key: payment
    provider: stripe
    factory: myapp.providers:stripe
",
        );
    });

    let rig = Rig::new();
    let pipeline = rig.pipeline(rig.config(server.url("/manifest.yaml")));
    let report = pipeline.sync_once().await.unwrap();

    assert_eq!(report.total_registered(), 2);
    assert_eq!(report.total_rejected(), 0);
    assert_eq!(report.registered[&Domain::Adapter], 1);
    assert_eq!(report.registered[&Domain::Service], 1);

    let cached = rig.registry.candidates_for(Domain::Adapter, "cache");
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].provider, "redis");
    assert_eq!(cached[0].source, CandidateSource::Remote);
    assert_eq!(cached[0].stack_level, 10);

    let names = rig.sink.event_names();
    assert!(names.contains(&"remote-sync-start"));
    assert!(names.contains(&"remote-sync-success"));
}

#[tokio::test]
async fn digest_mismatch_rejects_entry_without_registering() {
    // The server returns bytes whose SHA-256 differs from the declared one.
    let server = MockServer::start();
    let payload = b"actual artifact bytes";
    let wrong_sha = hex::encode(Sha256::digest(b"the bytes the manifest promised"));

    server.mock(|when, then| {
        when.method(GET).path("/x.whl");
        then.status(200).body(payload);
    });
    let manifest = format!(
        r"
source: cdn
entries:
  - domain: adapter
    key: cache
    provider: redis
    factory: myapp.providers:redis
    uri: {}
    sha256: {wrong_sha}
",
        server.url("/x.whl")
    );
    server.mock(|when, then| {
        when.method(GET).path("/manifest.yaml");
        then.status(200).body(manifest);
    });

    let rig = Rig::new();
    let pipeline = rig.pipeline(rig.config(server.url("/manifest.yaml")));
    let report = pipeline.sync_once().await.unwrap();

    assert_eq!(report.total_registered(), 0);
    assert_eq!(report.rejected[&Domain::Adapter], 1);
    assert!(report.errors[0].contains("digest mismatch"), "{:?}", report.errors);

    assert!(rig.registry.candidates_for(Domain::Adapter, "cache").is_empty());
    assert_eq!(rig.sink.counter(counters::DIGEST_ERR), 1);
    // Nothing was written into the cache.
    let leftovers: Vec<_> = std::fs::read_dir(&rig.cache_dir)
        .unwrap()
        .filter_map(Result::ok)
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[tokio::test]
async fn matching_digest_stores_artifact_in_cache() {
    let server = MockServer::start();
    let payload = b"wheel bytes";
    let sha = hex::encode(Sha256::digest(payload));

    server.mock(|when, then| {
        when.method(GET).path("/pkgs/x.whl");
        then.status(200).body(payload);
    });
    let manifest = format!(
        r"
source: cdn
entries:
  - domain: adapter
    key: cache
    provider: redis
    factory: myapp.providers:redis
    uri: {}
    sha256: {sha}
",
        server.url("/pkgs/x.whl")
    );
    server.mock(|when, then| {
        when.method(GET).path("/manifest.yaml");
        then.status(200).body(manifest);
    });

    let rig = Rig::new();
    let pipeline = rig.pipeline(rig.config(server.url("/manifest.yaml")));
    let report = pipeline.sync_once().await.unwrap();

    assert_eq!(report.total_registered(), 1);
    let stored = rig.cache_dir.join("x.whl");
    assert_eq!(std::fs::read(&stored).unwrap(), payload);
    assert_eq!(rig.sink.counter(counters::DIGEST_OK), 1);

    let candidate = &rig.registry.candidates_for(Domain::Adapter, "cache")[0];
    assert_eq!(candidate.digest.as_deref(), Some(sha.as_str()));
}

#[tokio::test]
async fn traversal_uris_are_rejected_and_nothing_is_written() {
    let server = MockServer::start();
    let sha = hex::encode(Sha256::digest(b"irrelevant"));
    let manifest = format!(
        r"
source: cdn
entries:
  - domain: adapter
    key: cache
    provider: redis
    factory: myapp.providers:redis
    uri: {}/%2E%2E/key
    sha256: {sha}
  - domain: adapter
    key: cache
    provider: memcached
    factory: myapp.providers:memcached
    uri: file:///../etc/passwd
    sha256: {sha}
",
        server.base_url()
    );
    server.mock(|when, then| {
        when.method(GET).path("/manifest.yaml");
        then.status(200).body(manifest);
    });

    let rig = Rig::new();
    let pipeline = rig.pipeline(rig.config(server.url("/manifest.yaml")));
    let report = pipeline.sync_once().await.unwrap();

    assert_eq!(report.total_registered(), 0);
    assert_eq!(report.rejected[&Domain::Adapter], 2);
    assert!(rig.registry.snapshot().is_empty());
    let leftovers: Vec<_> = std::fs::read_dir(&rig.cache_dir)
        .unwrap()
        .filter_map(Result::ok)
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[tokio::test]
async fn disallowed_factory_rejects_entry() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/manifest.yaml");
        then.status(200).body(
            r"
source: cdn
entries:
  - domain: adapter
    key: cache
    provider: redis
    factory: otherpkg.providers:redis
",
        );
    });

    let rig = Rig::new();
    let pipeline = rig.pipeline(rig.config(server.url("/manifest.yaml")));
    let report = pipeline.sync_once().await.unwrap();

    assert_eq!(report.total_registered(), 0);
    assert_eq!(report.total_rejected(), 1);
    assert!(report.errors[0].contains("not allowed"), "{:?}", report.errors);
}

#[tokio::test]
async fn signed_manifest_round_trips() {
    let key = SigningKey::from_bytes(&[42u8; 32]);
    let mut raw = serde_json::json!({
        "source": "cdn",
        "entries": [{
            "domain": "workflow",
            "key": "fulfillment",
            "provider": "temporal",
            "factory": "myapp.workflows:temporal"
        }]
    });
    let signature = key.sign(&canonical_bytes(&raw).unwrap());
    raw["signature"] = serde_json::Value::String(
        base64::engine::general_purpose::STANDARD.encode(signature.to_bytes()),
    );

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/manifest.json");
        then.status(200).body(serde_json::to_vec(&raw).unwrap());
    });

    let rig = Rig::new();
    let config = RemoteConfig {
        verify_signature: true,
        trusted_public_keys: vec![
            base64::engine::general_purpose::STANDARD.encode(key.verifying_key().to_bytes()),
        ],
        ..rig.config(server.url("/manifest.json"))
    };
    let pipeline = rig.pipeline(config);
    let report = pipeline.sync_once().await.unwrap();

    assert_eq!(report.total_registered(), 1);
    assert_eq!(rig.sink.counter(counters::SIGNATURE_OK), 1);
    assert_eq!(
        rig.registry.candidates_for(Domain::Workflow, "fulfillment")[0].provider,
        "temporal"
    );
}

#[tokio::test]
async fn unsigned_manifest_fails_when_verification_is_on() {
    let key = SigningKey::from_bytes(&[42u8; 32]);
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/manifest.yaml");
        then.status(200).body("source: cdn\nentries: []\n");
    });

    let rig = Rig::new();
    let config = RemoteConfig {
        verify_signature: true,
        trusted_public_keys: vec![
            base64::engine::general_purpose::STANDARD.encode(key.verifying_key().to_bytes()),
        ],
        ..rig.config(server.url("/manifest.yaml"))
    };
    let pipeline = rig.pipeline(config);
    let err = pipeline.sync_once().await.unwrap_err();
    assert!(matches!(err, RemoteError::SignatureInvalid { .. }), "{err}");
    assert!(rig.sink.event_names().contains(&"remote-sync-failure"));
}

#[tokio::test]
async fn repeated_failures_open_the_breaker() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/manifest.yaml");
        then.status(500);
    });

    let rig = Rig::new();
    let config = RemoteConfig {
        circuit_breaker_threshold: 2,
        circuit_breaker_reset_secs: 3600,
        ..rig.config(server.url("/manifest.yaml"))
    };
    let pipeline = rig.pipeline(config);

    assert!(pipeline.sync_once().await.is_err());
    assert!(pipeline.sync_once().await.is_err());
    // Threshold reached: the third call is refused without fetching.
    let err = pipeline.sync_once().await.unwrap_err();
    assert!(matches!(err, RemoteError::CircuitOpen(_)), "{err}");
    assert!(rig.sink.counter(counters::BREAKER_OPEN) >= 1);
}

#[tokio::test]
async fn missing_manifest_url_is_a_configuration_error() {
    let rig = Rig::new();
    let guard = Arc::new(FactoryGuard::new(
        vec!["myapp".to_owned()],
        Arc::new(FactoryIndex::new()),
    ));
    let config = RemoteConfig {
        cache_dir: rig.cache_dir.clone(),
        verify_signature: false,
        ..RemoteConfig::default()
    };
    let err = RemotePipeline::from_config(&config, rig.registry.clone(), guard, rig.sink.clone())
        .unwrap_err();
    assert!(matches!(err, RemoteError::NotConfigured { .. }), "{err}");
}
