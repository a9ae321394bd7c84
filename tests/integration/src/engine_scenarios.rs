//! Engine scenarios spanning every crate.
//!
//! Each test drives the manager the way the daemon does: a service tree on
//! disk, a process host, and the event loop pumped by hand.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use rstest::rstest;
use serde_json::{Value, json};
use svc_cache::InterfaceCache;
use svc_manager::{
    CODE_SERVICE_UNAVAILABLE, DirectorySource, DynamicServiceManager, EngineConfig, ManagerEvent,
};
use svc_meta::{ServiceKey, ServiceSummary};
use svc_resolve::{AvailableService, RequireStatement};
use svc_runner::AllocationContext;
use svc_test_utils::{
    Behavior, FakeHost, ServiceTree, dependent_manifest, package, provider_manifest,
};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

// =============================================================================
// Test Infrastructure
// =============================================================================

struct Daemon {
    manager: DynamicServiceManager,
    events: UnboundedReceiver<ManagerEvent>,
}

impl Daemon {
    async fn boot(tree: &ServiceTree, host: &FakeHost) -> Self {
        let mut config = EngineConfig::rooted_at(tree.data_dir());
        config.kill_grace_ms = 0;
        let (mut manager, events) = DynamicServiceManager::new(config, Arc::new(host.clone()));
        manager.force_rescan().await;
        Self { manager, events }
    }

    async fn pump(&mut self) -> ManagerEvent {
        let manager = &mut self.manager;
        let events = &mut self.events;
        timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(event) = events.try_recv() {
                    return event;
                }
                let runner = manager.next_runner_event().await.unwrap();
                manager.handle_runner_event(runner);
            }
        })
        .await
        .expect("engine went quiet")
    }

    async fn instantiate(&mut self, name: &str) -> svc_manager::InstanceId {
        let instance = self
            .manager
            .instantiate(name, "", AllocationContext::default())
            .unwrap();
        assert_eq!(self.pump().await, ManagerEvent::Instantiated { instance });
        instance
    }
}

/// A directory laid out as a package mirror.
struct Mirror {
    dir: TempDir,
    index: Vec<Value>,
}

impl Mirror {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            index: Vec::new(),
        }
    }

    fn publish(
        mut self,
        name: &str,
        version: &str,
        manifest: &Value,
        provider: Option<(&str, &str)>,
    ) -> Self {
        let mut entry = json!({ "name": name, "version": version, "size": 512 });
        if let Some((provider, minversion)) = provider {
            entry["provider"] = json!({ "name": provider, "minversion": minversion });
        }
        self.index.push(entry);
        let archive = self.dir.path().join(format!("{name}-{version}.tar.gz"));
        fs::write(archive, package(manifest)).unwrap();
        fs::write(
            self.dir.path().join("index.json"),
            serde_json::to_vec_pretty(&self.index).unwrap(),
        )
        .unwrap();
        self
    }

    fn source(&self) -> DirectorySource {
        DirectorySource::new(self.dir.path())
    }
}

fn names(services: &[AvailableService]) -> Vec<String> {
    services.iter().map(|s| s.to_string()).collect()
}

// =============================================================================
// Resolution
// =============================================================================

#[tokio::test]
async fn test_empty_install_resolves_single_download() {
    let tree = ServiceTree::new();
    let daemon = Daemon::boot(&tree, &FakeHost::new()).await;
    let available = vec![AvailableService::standalone("X", "1.0.0").unwrap()];

    let resolution = daemon
        .manager
        .satisfy_requirements(&[RequireStatement::new("X")], &available, true)
        .unwrap();

    assert_eq!(names(&resolution.ordered), vec!["X@1.0.0"]);
    assert_eq!(resolution.to_download, resolution.ordered);
}

#[tokio::test]
async fn test_dependent_resolves_after_newest_adequate_provider() {
    let tree = ServiceTree::new();
    let daemon = Daemon::boot(&tree, &FakeHost::new()).await;
    let available = vec![
        AvailableService::dependent("D", "1.0", "P", "", "2.0").unwrap(),
        AvailableService::standalone("P", "2.1").unwrap(),
        AvailableService::standalone("P", "1.9").unwrap(),
    ];

    let resolution = daemon
        .manager
        .satisfy_requirements(&[RequireStatement::new("D")], &available, true)
        .unwrap();

    assert_eq!(names(&resolution.ordered), vec!["P@2.1", "D@1.0"]);
}

#[rstest]
#[case::keep_installed(false, "Echo@1.0.0", false)]
#[case::prefer_newest(true, "Echo@2.0.0", true)]
#[tokio::test]
async fn test_installed_services_count_as_candidates(
    #[case] prefer_newest: bool,
    #[case] expected: &str,
    #[case] downloads: bool,
) {
    let tree = ServiceTree::new();
    tree.standalone("Echo", "1.0.0");
    let daemon = Daemon::boot(&tree, &FakeHost::new()).await;
    let available = vec![AvailableService::standalone("Echo", "2.0.0").unwrap()];

    let resolution = daemon
        .manager
        .satisfy_requirements(&[RequireStatement::new("Echo")], &available, prefer_newest)
        .unwrap();

    assert_eq!(names(&resolution.ordered), vec![expected]);
    assert_eq!(!resolution.to_download.is_empty(), downloads);
}

#[tokio::test]
async fn test_unsatisfiable_requirement_is_a_typed_failure() {
    let tree = ServiceTree::new();
    tree.standalone("Echo", "1.0.0");
    let daemon = Daemon::boot(&tree, &FakeHost::new()).await;
    let requirement = RequireStatement::parse("Echo", "", "3.0").unwrap();

    let err = daemon
        .manager
        .satisfy_requirements(&[requirement], &[], true)
        .unwrap_err();

    assert!(matches!(err, svc_manager::Error::Resolve(_)));
}

// =============================================================================
// Install, scan and run
// =============================================================================

#[tokio::test]
async fn test_fetched_dependent_runs_inside_fetched_provider() {
    let tree = ServiceTree::new();
    let host = FakeHost::new();
    let mirror = Mirror::new()
        .publish("Runtime", "1.9.0", &provider_manifest(), None)
        .publish("Runtime", "2.1.0", &provider_manifest(), None)
        .publish(
            "Script",
            "1.0.0",
            &dependent_manifest("Runtime", "2.0"),
            Some(("Runtime", "2.0")),
        );
    let mut daemon = Daemon::boot(&tree, &host).await;
    assert!(daemon.manager.available_services().is_empty());

    let staged = daemon
        .manager
        .fetch_updates(&mirror.source(), &[RequireStatement::new("Script")])
        .await
        .unwrap();
    let staged: Vec<ServiceKey> = staged.iter().map(ServiceSummary::key).collect();
    assert_eq!(
        staged,
        vec![ServiceKey::new("Runtime", "2.1.0"), ServiceKey::new("Script", "1.0.0")]
    );

    let installed = daemon.manager.install_updates().await.unwrap();
    assert_eq!(installed.len(), 2);
    tree.assert_installed("Runtime", "2.1.0");
    tree.assert_installed("Script", "1.0.0");
    assert!(!tree.service_path("Runtime", "1.9.0").exists());

    daemon.instantiate("Script").await;
    let spawn = host
        .spawns()
        .into_iter()
        .filter(|r| r.service_dir == tree.service_path("Script", "1.0.0"))
        .last()
        .unwrap();
    assert_eq!(spawn.provider_dir, Some(tree.service_path("Runtime", "2.1.0")));
}

#[tokio::test]
async fn test_scan_populates_interface_cache_on_disk() {
    let tree = ServiceTree::new();
    tree.standalone("Echo", "1.0.0");
    let daemon = Daemon::boot(&tree, &FakeHost::new()).await;
    drop(daemon);

    let cache = InterfaceCache::new(tree.interface_dir());
    let cached = cache.get("Echo", "1.0.0").expect("interface cached");
    assert_eq!(cached.name, "Echo");
    assert!(cached.function("echo").is_some());
    assert!(tree.interface_dir().join("Echo_1.0.0.json").is_file());
}

#[tokio::test]
async fn test_restart_reuses_cached_interfaces() {
    let tree = ServiceTree::new();
    let echo = tree.standalone("Echo", "1.0.0");
    let host = FakeHost::new();
    drop(Daemon::boot(&tree, &host).await);
    let first_boot = host.spawns_of(&echo);

    let daemon = Daemon::boot(&tree, &host).await;

    assert_eq!(host.spawns_of(&echo), first_boot);
    assert_eq!(daemon.manager.last_scan().cached, 1);
    assert!(daemon.manager.describe("Echo", "", "").is_ok());
}

// =============================================================================
// Failure isolation
// =============================================================================

#[tokio::test]
async fn test_crash_fails_only_its_own_instances() {
    let tree = ServiceTree::new();
    tree.standalone("Echo", "1.0.0");
    let clock = tree.standalone("Clock", "1.0.0");
    let host = FakeHost::new();
    let mut daemon = Daemon::boot(&tree, &host).await;
    host.set_behavior(&clock, Behavior::CrashOnInvoke);

    let echo_instance = daemon.instantiate("Echo").await;
    let clock_instance = daemon.instantiate("Clock").await;

    daemon
        .manager
        .execute(clock_instance, 1, "echo", json!({ "text": "tick" }))
        .unwrap();
    let mut seen = Vec::new();
    loop {
        let event = daemon.pump().await;
        let ended = matches!(event, ManagerEvent::InstanceEnded { .. });
        seen.push(event);
        if ended {
            break;
        }
    }
    assert!(seen.iter().any(|e| matches!(
        e,
        ManagerEvent::Error { instance, tid: 1, code, .. }
            if *instance == clock_instance && code == CODE_SERVICE_UNAVAILABLE
    )));
    assert!(matches!(
        seen.last(),
        Some(ManagerEvent::InstanceEnded { instance, .. }) if *instance == clock_instance
    ));

    daemon
        .manager
        .execute(echo_instance, 2, "echo", json!({ "text": "still here" }))
        .unwrap();
    assert_eq!(
        daemon.pump().await,
        ManagerEvent::Result {
            instance: echo_instance,
            tid: 2,
            result: json!({ "text": "still here" }),
        }
    );
    tree.assert_installed("Clock", "1.0.0");
}

#[tokio::test]
async fn test_bogus_services_do_not_block_healthy_ones() {
    let tree = ServiceTree::new();
    tree.standalone("Echo", "1.0.0");
    let broken = tree.standalone("Broken", "1.0.0");
    let no_strings = json!({ "type": "standalone", "ServiceLibrary": "x.so" });
    tree.write_manifest("NoStrings", "1.0.0", &no_strings);
    let host = FakeHost::new().with_behavior(&broken, Behavior::BadDescription);

    let daemon = Daemon::boot(&tree, &host).await;

    assert_eq!(daemon.manager.available_services(), vec![ServiceKey::new("Echo", "1.0.0")]);
    tree.assert_removed("Broken", "1.0.0");
    tree.assert_removed("NoStrings", "1.0.0");
    assert_eq!(daemon.manager.last_scan().bogus, 2);
}

#[tokio::test]
async fn test_purge_makes_service_downloadable_again() {
    let tree = ServiceTree::new();
    tree.standalone("Echo", "1.0.0");
    let mut daemon = Daemon::boot(&tree, &FakeHost::new()).await;
    daemon.instantiate("Echo").await;
    let available = vec![AvailableService::standalone("Echo", "1.0.0").unwrap()];

    daemon.manager.purge_service("Echo", "1.0.0").await.unwrap();

    assert!(!daemon.manager.have_service("Echo", "", ""));
    assert!(!tree.interface_dir().join("Echo_1.0.0.json").exists());
    let resolution = daemon
        .manager
        .satisfy_requirements(&[RequireStatement::new("Echo")], &available, true)
        .unwrap();
    assert_eq!(names(&resolution.to_download), vec!["Echo@1.0.0"]);
}
