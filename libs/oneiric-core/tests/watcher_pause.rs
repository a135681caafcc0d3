#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Watcher behavior around activity flags: paused slots skip selection
//! changes, draining slots defer them until resumed.

use std::collections::BTreeMap;
use std::sync::Arc;

use oneiric::bridge::{DomainBridge, SettingsCache};
use oneiric::candidate::{CandidateSpec, FactorySpec};
use oneiric::domain::{Domain, Slot};
use oneiric::events::{CapturingSink, Event, WatcherAction};
use oneiric::factory::{FactoryGuard, FactoryIndex};
use oneiric::instance::{FactoryFn, ProviderInstance};
use oneiric::lifecycle::{ActivateOptions, LifecycleHooks, LifecycleManager, LifecycleTimeouts};
use oneiric::registry::CandidateRegistry;
use oneiric::resolver::{ResolveOptions, Resolver};
use oneiric::status::StatusStore;
use oneiric::watcher::ConfigWatcher;
use oneiric::ActivityStore;

struct Nop;
impl ProviderInstance for Nop {}

struct Rig {
    manager: Arc<LifecycleManager>,
    activity: Arc<ActivityStore>,
    watcher: ConfigWatcher,
    sink: Arc<CapturingSink>,
    config_path: std::path::PathBuf,
    _tmp: tempfile::TempDir,
}

fn rig() -> Rig {
    let tmp = tempfile::tempdir().unwrap();
    let config_path = tmp.path().join("oneiric.yaml");
    std::fs::write(&config_path, "{}\n").unwrap();

    let sink = CapturingSink::new();
    let registry = Arc::new(CandidateRegistry::new(sink.clone()));
    for provider in ["stripe", "adyen"] {
        registry
            .register(CandidateSpec::new(
                Domain::Service,
                "payment",
                provider,
                FactorySpec::Callable(FactoryFn::new(|_| {
                    Ok(Arc::new(Nop) as Arc<dyn ProviderInstance>)
                })),
            ))
            .unwrap();
    }

    let resolver = Arc::new(Resolver::new(registry.clone(), sink.clone()));
    let guard = Arc::new(FactoryGuard::new(vec![], Arc::new(FactoryIndex::new())));
    let settings = SettingsCache::new(BTreeMap::new());
    let activity = Arc::new(ActivityStore::open(
        tmp.path().join("activity.json"),
        sink.clone(),
    ));
    let status = Arc::new(StatusStore::new(tmp.path().join("status")));
    let manager = Arc::new(LifecycleManager::new(
        resolver.clone(),
        guard,
        settings.clone(),
        activity.clone(),
        status,
        LifecycleHooks::new(),
        LifecycleTimeouts::default(),
        sink.clone(),
    ));

    let bridges: BTreeMap<Domain, Arc<DomainBridge>> = Domain::ALL
        .into_iter()
        .map(|domain| {
            (
                domain,
                Arc::new(DomainBridge::new(
                    domain,
                    resolver.clone(),
                    manager.clone(),
                    settings.clone(),
                    activity.clone(),
                )),
            )
        })
        .collect();

    let watcher = ConfigWatcher::new(
        config_path.clone(),
        std::time::Duration::from_secs(5),
        resolver,
        bridges,
        activity.clone(),
        sink.clone(),
    );

    Rig {
        manager,
        activity,
        watcher,
        sink,
        config_path,
        _tmp: tmp,
    }
}

fn select_adyen(rig: &Rig) {
    std::fs::write(
        &rig.config_path,
        "selections:\n  service:\n    payment: adyen\n",
    )
    .unwrap();
}

fn watcher_actions(rig: &Rig) -> Vec<WatcherAction> {
    rig.sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::WatcherTrigger { action, .. } => Some(action),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn paused_slot_skips_selection_change() {
    let rig = rig();
    rig.manager
        .activate(
            Domain::Service,
            "payment",
            &ActivateOptions {
                resolve: ResolveOptions::with_provider("stripe"),
                cancel: None,
            },
        )
        .await
        .unwrap();
    rig.manager
        .pause(Domain::Service, "payment", Some("migration".into()))
        .await
        .unwrap();

    select_adyen(&rig);
    rig.watcher.poll_once().await;

    // The bridge did not swap: stripe is still current.
    let current = rig
        .manager
        .current_handle(Domain::Service, "payment")
        .await
        .unwrap();
    assert_eq!(current.provider, "stripe");

    assert_eq!(watcher_actions(&rig), vec![WatcherAction::SkippedPaused]);
    let flags = rig.activity.flags(&Slot::new(Domain::Service, "payment"));
    assert!(flags.paused);
}

#[tokio::test]
async fn draining_slot_defers_until_resumed() {
    let rig = rig();
    rig.manager
        .activate(
            Domain::Service,
            "payment",
            &ActivateOptions {
                resolve: ResolveOptions::with_provider("stripe"),
                cancel: None,
            },
        )
        .await
        .unwrap();
    rig.manager
        .drain(Domain::Service, "payment", None)
        .await
        .unwrap();

    select_adyen(&rig);
    rig.watcher.poll_once().await;
    assert_eq!(watcher_actions(&rig), vec![WatcherAction::DeferredDraining]);
    assert_eq!(
        rig.manager
            .current_handle(Domain::Service, "payment")
            .await
            .unwrap()
            .provider,
        "stripe"
    );

    // Deferred changes retry on later polls; once resumed, the swap runs.
    rig.manager.resume(Domain::Service, "payment").await.unwrap();
    rig.watcher.poll_once().await;

    let actions = watcher_actions(&rig);
    assert_eq!(
        actions,
        vec![WatcherAction::DeferredDraining, WatcherAction::Swapped]
    );
    assert_eq!(
        rig.manager
            .current_handle(Domain::Service, "payment")
            .await
            .unwrap()
            .provider,
        "adyen"
    );
}

#[tokio::test]
async fn unflagged_selection_change_swaps() {
    let rig = rig();
    rig.manager
        .activate(
            Domain::Service,
            "payment",
            &ActivateOptions {
                resolve: ResolveOptions::with_provider("stripe"),
                cancel: None,
            },
        )
        .await
        .unwrap();

    select_adyen(&rig);
    rig.watcher.poll_once().await;

    assert_eq!(watcher_actions(&rig), vec![WatcherAction::Swapped]);
    assert_eq!(
        rig.manager
            .current_handle(Domain::Service, "payment")
            .await
            .unwrap()
            .provider,
        "adyen"
    );
}

#[tokio::test]
async fn unchanged_selections_do_not_retrigger() {
    let rig = rig();
    select_adyen(&rig);
    rig.watcher.poll_once().await;
    rig.watcher.poll_once().await;

    // One trigger only: the second poll saw an already-applied map.
    assert_eq!(watcher_actions(&rig).len(), 1);
}

#[tokio::test]
async fn unreadable_config_skips_the_round() {
    let rig = rig();
    std::fs::write(&rig.config_path, "selections: [not, a, map\n").unwrap();
    rig.watcher.poll_once().await;
    assert!(watcher_actions(&rig).is_empty());
}
