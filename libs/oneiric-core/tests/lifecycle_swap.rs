#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end lifecycle behavior: activation, hot-swap with rollback,
//! forced swaps, cancellation, and handle reuse through the bridge.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use oneiric::bridge::{DomainBridge, SettingsCache, UseOptions};
use oneiric::candidate::{CandidateSpec, FactorySpec};
use oneiric::domain::{Domain, Slot};
use oneiric::events::CapturingSink;
use oneiric::factory::{FactoryGuard, FactoryIndex};
use oneiric::instance::{FactoryFn, ProviderFactory, ProviderInstance};
use oneiric::lifecycle::{
    ActivateOptions, BindingState, LifecycleError, LifecycleHooks, LifecycleManager,
    LifecycleTimeouts, SwapOptions,
};
use oneiric::registry::CandidateRegistry;
use oneiric::resolver::{ResolveOptions, Resolver};
use oneiric::status::StatusStore;
use oneiric::ActivityStore;
use tokio_util::sync::CancellationToken;

/// Instance that counts cleanup invocations.
struct Tracked {
    cleanups: Arc<AtomicUsize>,
}

#[async_trait]
impl ProviderInstance for Tracked {
    async fn cleanup(&self) -> Option<anyhow::Result<()>> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Some(Ok(()))
    }
}

/// Instance whose `init` always fails.
struct BrokenInit;

#[async_trait]
impl ProviderInstance for BrokenInit {
    async fn init(&self) -> anyhow::Result<()> {
        anyhow::bail!("connection pool exhausted")
    }
}

/// Instance whose `init` never returns.
struct HangingInit;

#[async_trait]
impl ProviderInstance for HangingInit {
    async fn init(&self) -> anyhow::Result<()> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok(())
    }
}

struct Rig {
    registry: Arc<CandidateRegistry>,
    manager: Arc<LifecycleManager>,
    status: Arc<StatusStore>,
    sink: Arc<CapturingSink>,
    _tmp: tempfile::TempDir,
}

fn rig() -> Rig {
    let tmp = tempfile::tempdir().unwrap();
    let sink = CapturingSink::new();
    let registry = Arc::new(CandidateRegistry::new(sink.clone()));
    let resolver = Arc::new(Resolver::new(registry.clone(), sink.clone()));
    let guard = Arc::new(FactoryGuard::new(vec![], Arc::new(FactoryIndex::new())));
    let settings = SettingsCache::new(Default::default());
    let activity = Arc::new(ActivityStore::open(
        tmp.path().join("activity.json"),
        sink.clone(),
    ));
    let status = Arc::new(StatusStore::new(tmp.path().join("status")));
    let manager = Arc::new(LifecycleManager::new(
        resolver,
        guard,
        settings,
        activity,
        status.clone(),
        LifecycleHooks::new(),
        LifecycleTimeouts::default(),
        sink.clone(),
    ));
    Rig {
        registry,
        manager,
        status,
        sink,
        _tmp: tmp,
    }
}

fn tracked_factory(cleanups: Arc<AtomicUsize>) -> Arc<dyn ProviderFactory> {
    FactoryFn::new(move |_| {
        Ok(Arc::new(Tracked {
            cleanups: cleanups.clone(),
        }) as Arc<dyn ProviderInstance>)
    })
}

fn register(rig: &Rig, provider: &str, factory: Arc<dyn ProviderFactory>) {
    rig.registry
        .register(CandidateSpec::new(
            Domain::Adapter,
            "cache",
            provider,
            FactorySpec::Callable(factory),
        ))
        .unwrap();
}

#[tokio::test]
async fn activate_installs_current_and_persists_status() {
    let rig = rig();
    let cleanups = Arc::new(AtomicUsize::new(0));
    register(&rig, "redis", tracked_factory(cleanups));

    let handle = rig
        .manager
        .activate(Domain::Adapter, "cache", &ActivateOptions::default())
        .await
        .unwrap();
    assert_eq!(handle.provider, "redis");

    let snapshot = rig
        .status
        .load(&Slot::new(Domain::Adapter, "cache"))
        .unwrap();
    assert_eq!(snapshot.state, BindingState::Ready);
    assert_eq!(snapshot.current_provider.as_deref(), Some("redis"));
    assert!(snapshot.last_activated_at.is_some());

    let names = rig.sink.event_names();
    assert!(names.contains(&"activate-start"));
    assert!(names.contains(&"activate-success"));
}

#[tokio::test]
async fn swap_failure_rolls_back_without_cleaning_previous() {
    // Scenario: redis is current; swapping to memcached fails on init.
    let rig = rig();
    let redis_cleanups = Arc::new(AtomicUsize::new(0));
    register(&rig, "redis", tracked_factory(redis_cleanups.clone()));
    register(
        &rig,
        "memcached",
        FactoryFn::new(|_| Ok(Arc::new(BrokenInit) as Arc<dyn ProviderInstance>)),
    );

    rig.manager
        .activate(
            Domain::Adapter,
            "cache",
            &ActivateOptions {
                resolve: ResolveOptions::with_provider("redis"),
                cancel: None,
            },
        )
        .await
        .unwrap();

    let err = rig
        .manager
        .swap(
            Domain::Adapter,
            "cache",
            &SwapOptions {
                resolve: ResolveOptions::with_provider("memcached"),
                force: false,
                cancel: None,
            },
        )
        .await
        .unwrap_err();

    assert!(err.rolled_back(), "expected rollback, got: {err}");
    match &err {
        LifecycleError::SwapFailed { to, .. } => assert_eq!(to, "memcached"),
        other => panic!("expected SwapFailed, got: {other:?}"),
    }

    // Previous instance survived untouched.
    assert_eq!(redis_cleanups.load(Ordering::SeqCst), 0);
    let current = rig
        .manager
        .current_handle(Domain::Adapter, "cache")
        .await
        .unwrap();
    assert_eq!(current.provider, "redis");

    // Status snapshot reflects the rollback.
    let snapshot = rig
        .status
        .load(&Slot::new(Domain::Adapter, "cache"))
        .unwrap();
    assert_eq!(snapshot.state, BindingState::Ready);
    assert_eq!(snapshot.current_provider.as_deref(), Some("redis"));
    assert!(snapshot.last_error.is_some());

    let names = rig.sink.event_names();
    assert!(names.contains(&"rollback-success"));
    assert!(names.contains(&"swap-failure"));
}

#[tokio::test]
async fn forced_swap_discards_previous_on_failure() {
    let rig = rig();
    let redis_cleanups = Arc::new(AtomicUsize::new(0));
    register(&rig, "redis", tracked_factory(redis_cleanups.clone()));
    register(
        &rig,
        "memcached",
        FactoryFn::new(|_| Ok(Arc::new(BrokenInit) as Arc<dyn ProviderInstance>)),
    );

    rig.manager
        .activate(
            Domain::Adapter,
            "cache",
            &ActivateOptions {
                resolve: ResolveOptions::with_provider("redis"),
                cancel: None,
            },
        )
        .await
        .unwrap();

    let err = rig
        .manager
        .swap(
            Domain::Adapter,
            "cache",
            &SwapOptions {
                resolve: ResolveOptions::with_provider("memcached"),
                force: true,
                cancel: None,
            },
        )
        .await
        .unwrap_err();

    assert!(!err.rolled_back());
    assert_eq!(redis_cleanups.load(Ordering::SeqCst), 1);
    assert!(rig
        .manager
        .current_handle(Domain::Adapter, "cache")
        .await
        .is_none());

    let snapshot = rig
        .status
        .load(&Slot::new(Domain::Adapter, "cache"))
        .unwrap();
    assert_eq!(snapshot.state, BindingState::Failed);
}

#[tokio::test]
async fn successful_swap_cleans_up_previous_exactly_once() {
    let rig = rig();
    let redis_cleanups = Arc::new(AtomicUsize::new(0));
    let memcached_cleanups = Arc::new(AtomicUsize::new(0));
    register(&rig, "redis", tracked_factory(redis_cleanups.clone()));
    register(&rig, "memcached", tracked_factory(memcached_cleanups.clone()));

    rig.manager
        .activate(
            Domain::Adapter,
            "cache",
            &ActivateOptions {
                resolve: ResolveOptions::with_provider("redis"),
                cancel: None,
            },
        )
        .await
        .unwrap();
    let handle = rig
        .manager
        .swap(
            Domain::Adapter,
            "cache",
            &SwapOptions {
                resolve: ResolveOptions::with_provider("memcached"),
                force: false,
                cancel: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(handle.provider, "memcached");
    assert_eq!(redis_cleanups.load(Ordering::SeqCst), 1);
    assert_eq!(memcached_cleanups.load(Ordering::SeqCst), 0);

    let names = rig.sink.event_names();
    assert!(names.contains(&"swap-start"));
    assert!(names.contains(&"swap-success"));
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_init_leaves_failed_not_activating() {
    let rig = rig();
    register(
        &rig,
        "redis",
        FactoryFn::new(|_| Ok(Arc::new(HangingInit) as Arc<dyn ProviderInstance>)),
    );

    let cancel = CancellationToken::new();
    let manager = rig.manager.clone();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        manager
            .activate(
                Domain::Adapter,
                "cache",
                &ActivateOptions {
                    resolve: ResolveOptions::default(),
                    cancel: Some(token),
                },
            )
            .await
    });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    cancel.cancel();
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, LifecycleError::Cancelled { .. }), "{err}");

    let snapshot = rig
        .status
        .load(&Slot::new(Domain::Adapter, "cache"))
        .unwrap();
    assert_eq!(snapshot.state, BindingState::Failed);
}

#[tokio::test(start_paused = true)]
async fn init_deadline_is_enforced() {
    let rig = rig();
    register(
        &rig,
        "redis",
        FactoryFn::new(|_| Ok(Arc::new(HangingInit) as Arc<dyn ProviderInstance>)),
    );

    let err = rig
        .manager
        .activate(Domain::Adapter, "cache", &ActivateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Timeout { op: "init", .. }), "{err}");
}

#[tokio::test]
async fn bridge_reuses_live_instance_unless_refreshed() {
    let rig = rig();
    let cleanups = Arc::new(AtomicUsize::new(0));
    register(&rig, "redis", tracked_factory(cleanups));

    let resolver = Arc::new(Resolver::new(rig.registry.clone(), rig.sink.clone()));
    let settings = SettingsCache::new(Default::default());
    let activity = Arc::new(ActivityStore::open(
        rig._tmp.path().join("bridge-activity.json"),
        rig.sink.clone(),
    ));
    let bridge = DomainBridge::new(
        Domain::Adapter,
        resolver,
        rig.manager.clone(),
        settings,
        activity,
    );

    let first = bridge.use_slot("cache", &UseOptions::default()).await.unwrap();
    let second = bridge.use_slot("cache", &UseOptions::default()).await.unwrap();
    assert!(Arc::ptr_eq(&first.instance, &second.instance));

    let refreshed = bridge
        .use_slot(
            "cache",
            &UseOptions {
                refresh: true,
                resolve: ResolveOptions::default(),
            },
        )
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&first.instance, &refreshed.instance));
}

#[tokio::test]
async fn probe_reports_and_persists_health() {
    let rig = rig();
    register(
        &rig,
        "redis",
        FactoryFn::new(|_| Ok(Arc::new(Tracked {
            cleanups: Arc::new(AtomicUsize::new(0)),
        }) as Arc<dyn ProviderInstance>)),
    );

    rig.manager
        .activate(Domain::Adapter, "cache", &ActivateOptions::default())
        .await
        .unwrap();
    let result = rig.manager.probe(Domain::Adapter, "cache").await.unwrap();
    assert!(result.healthy);

    let snapshot = rig
        .status
        .load(&Slot::new(Domain::Adapter, "cache"))
        .unwrap();
    assert_eq!(snapshot.last_health_ok, Some(true));
    assert!(snapshot.last_health_at.is_some());
}

#[tokio::test]
async fn probe_without_binding_is_not_active() {
    let rig = rig();
    let err = rig.manager.probe(Domain::Adapter, "cache").await.unwrap_err();
    assert!(matches!(err, LifecycleError::NotActive { .. }));
}

#[tokio::test]
async fn concurrent_swaps_serialize_on_the_slot() {
    let rig = rig();
    let cleanups = Arc::new(AtomicUsize::new(0));
    register(&rig, "redis", tracked_factory(cleanups.clone()));
    register(&rig, "memcached", tracked_factory(cleanups.clone()));

    rig.manager
        .activate(
            Domain::Adapter,
            "cache",
            &ActivateOptions {
                resolve: ResolveOptions::with_provider("redis"),
                cancel: None,
            },
        )
        .await
        .unwrap();

    let a = {
        let manager = rig.manager.clone();
        tokio::spawn(async move {
            manager
                .swap(
                    Domain::Adapter,
                    "cache",
                    &SwapOptions {
                        resolve: ResolveOptions::with_provider("memcached"),
                        force: false,
                        cancel: None,
                    },
                )
                .await
        })
    };
    let b = {
        let manager = rig.manager.clone();
        tokio::spawn(async move {
            manager
                .swap(
                    Domain::Adapter,
                    "cache",
                    &SwapOptions {
                        resolve: ResolveOptions::with_provider("memcached"),
                        force: false,
                        cancel: None,
                    },
                )
                .await
        })
    };

    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    // Both swaps completed; at any point exactly one current existed.
    let current = rig
        .manager
        .current_handle(Domain::Adapter, "cache")
        .await
        .unwrap();
    assert_eq!(current.provider, "memcached");
}

#[tokio::test]
async fn adapter_bridge_activates_categories() {
    use oneiric::bridge::AdapterBridge;

    let rig = rig();
    let cleanups = Arc::new(AtomicUsize::new(0));
    register(&rig, "redis", tracked_factory(cleanups.clone()));
    rig.registry
        .register(CandidateSpec::new(
            Domain::Adapter,
            "queue",
            "rabbitmq",
            FactorySpec::Callable(tracked_factory(cleanups)),
        ))
        .unwrap();

    let resolver = Arc::new(Resolver::new(rig.registry.clone(), rig.sink.clone()));
    let settings = SettingsCache::new(Default::default());
    let activity = Arc::new(ActivityStore::open(
        rig._tmp.path().join("adapter-activity.json"),
        rig.sink.clone(),
    ));
    let adapters = AdapterBridge::new(resolver, rig.manager.clone(), settings, activity);

    let handles = adapters
        .use_categories(&["cache", "queue"], &UseOptions::default())
        .await
        .unwrap();
    assert_eq!(handles.len(), 2);
    assert_eq!(handles[0].0, "cache");
    assert_eq!(handles[0].1.provider, "redis");
    assert_eq!(handles[1].1.provider, "rabbitmq");

    let single = adapters
        .use_category("cache", &UseOptions::default())
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&single.instance, &handles[0].1.instance));
}

#[tokio::test]
async fn shutdown_drains_all_bindings() {
    let rig = rig();
    let cleanups = Arc::new(AtomicUsize::new(0));
    register(&rig, "redis", tracked_factory(cleanups.clone()));

    rig.manager
        .activate(Domain::Adapter, "cache", &ActivateOptions::default())
        .await
        .unwrap();
    rig.manager.shutdown_all().await;

    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    let snapshot = rig
        .status
        .load(&Slot::new(Domain::Adapter, "cache"))
        .unwrap();
    assert_eq!(snapshot.state, BindingState::Drained);
}
