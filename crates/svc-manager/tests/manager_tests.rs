//! End-to-end manager flows over the fake process host.

use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::json;
use svc_manager::{
    CODE_INSTANCE_ERROR, CODE_INVALID_ARGUMENTS, CODE_SERVICE_UNAVAILABLE, DirectorySource,
    DynamicServiceManager, EngineConfig, Error, InstanceId, ManagerEvent,
};
use svc_meta::ServiceKey;
use svc_resolve::{AvailableService, RequireStatement};
use svc_runner::AllocationContext;
use svc_test_utils::{Behavior, FakeHost, ServiceTree, package, standalone_manifest};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

struct Engine {
    manager: DynamicServiceManager,
    events: UnboundedReceiver<ManagerEvent>,
}

impl Engine {
    async fn start(tree: &ServiceTree, host: &FakeHost) -> Self {
        let mut config = EngineConfig::rooted_at(tree.data_dir());
        config.kill_grace_ms = 0;
        config.describe_timeout_secs = 2;
        let (mut manager, events) = DynamicServiceManager::new(config, Arc::new(host.clone()));
        manager.force_rescan().await;
        Self { manager, events }
    }

    /// Drive process I/O until the manager reports something.
    async fn next_event(&mut self) -> ManagerEvent {
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
        .expect("no manager event within 5s")
    }

    /// Drive process I/O until no process is left.
    async fn settle(&mut self) {
        let manager = &mut self.manager;
        timeout(Duration::from_secs(5), async {
            while manager.is_busy() {
                let runner = manager.next_runner_event().await.unwrap();
                manager.handle_runner_event(runner);
            }
        })
        .await
        .expect("processes still running after 5s");
    }

    async fn instantiate(&mut self, name: &str, version: &str) -> InstanceId {
        let instance = self
            .manager
            .instantiate(name, version, AllocationContext::default())
            .unwrap();
        assert_eq!(self.next_event().await, ManagerEvent::Instantiated { instance });
        instance
    }
}

#[tokio::test]
async fn test_instantiate_execute_destroy() {
    let tree = ServiceTree::new();
    tree.standalone("Echo", "1.0.0");
    let mut engine = Engine::start(&tree, &FakeHost::new()).await;

    let instance = engine.instantiate("Echo", "1.0.0").await;
    engine
        .manager
        .execute(instance, 7, "echo", json!({ "text": "hi" }))
        .unwrap();
    assert_eq!(
        engine.next_event().await,
        ManagerEvent::Result {
            instance,
            tid: 7,
            result: json!({ "text": "hi" }),
        }
    );

    engine.manager.destroy(instance).unwrap();
    engine.settle().await;
    assert!(!engine.manager.is_busy());
    assert_eq!(engine.manager.instance_count(), 0);
}

#[tokio::test]
async fn test_instances_share_one_process() {
    let tree = ServiceTree::new();
    let echo = tree.standalone("Echo", "1.0.0");
    let host = FakeHost::new();
    let mut engine = Engine::start(&tree, &host).await;
    let after_scan = host.spawns_of(&echo);

    let first = engine.instantiate("Echo", "").await;
    let second = engine.instantiate("Echo", "1.0").await;

    assert_ne!(first, second);
    assert_eq!(host.spawns_of(&echo), after_scan + 1);
    assert_eq!(
        engine.manager.running_services().into_iter().collect::<Vec<_>>(),
        vec![ServiceKey::new("Echo", "1.0.0")]
    );
}

#[tokio::test]
async fn test_dependent_runs_inside_newest_provider() {
    let tree = ServiceTree::new();
    tree.provider("Runtime", "1.9.0");
    let newest = tree.provider("Runtime", "2.1.0");
    let script = tree.dependent("Script", "1.0.0", "Runtime", "2.0");
    let host = FakeHost::new();
    let mut engine = Engine::start(&tree, &host).await;

    engine.instantiate("Script", "1.0.0").await;

    let spawn = host
        .spawns()
        .into_iter()
        .filter(|r| r.service_dir == script)
        .last()
        .unwrap();
    assert_eq!(spawn.provider_dir, Some(newest));
}

#[tokio::test]
async fn test_lookup_picks_newest_match() {
    let tree = ServiceTree::new();
    tree.standalone("Echo", "1.0.0");
    tree.standalone("Echo", "2.0.0");
    let engine = Engine::start(&tree, &FakeHost::new()).await;
    let m = &engine.manager;

    assert_eq!(m.summary("Echo", "", "").unwrap().version(), "2.0.0");
    assert_eq!(m.summary("Echo", "1", "").unwrap().version(), "1.0.0");
    assert_eq!(m.describe("Echo", "", "1.5").unwrap().version.to_string(), "2.0.0");
    assert!(m.have_service("Echo", "", "2.0.0"));
    assert!(!m.have_service("Echo", "", "3"));
    assert!(!m.have_service("Echo", "x.y", ""));
    assert!(matches!(m.summary("Nope", "", ""), Err(Error::ServiceNotFound { .. })));
    assert_eq!(m.available_services().len(), 2);
    assert_eq!(m.available_summaries().len(), 2);
}

#[tokio::test]
async fn test_arguments_are_checked_before_sending() {
    let tree = ServiceTree::new();
    tree.standalone("Echo", "1.0.0");
    let mut engine = Engine::start(&tree, &FakeHost::new()).await;
    let instance = engine.instantiate("Echo", "1.0.0").await;

    for (tid, function, args) in [
        (1, "echo", json!({ "text": 5 })),
        (2, "nope", json!({})),
        (3, "echo", json!({ "volume": 11 })),
        (4, "echo", json!([1, 2])),
    ] {
        engine.manager.execute(instance, tid, function, args).unwrap();
        match engine.next_event().await {
            ManagerEvent::Error { tid: got, code, .. } => {
                assert_eq!(got, tid);
                assert_eq!(code, CODE_INVALID_ARGUMENTS);
            }
            other => panic!("expected an error event, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_execute_before_allocation_fails_locally() {
    let tree = ServiceTree::new();
    tree.standalone("Echo", "1.0.0");
    let mut engine = Engine::start(&tree, &FakeHost::new()).await;

    let instance = engine
        .manager
        .instantiate("Echo", "1.0.0", AllocationContext::default())
        .unwrap();
    engine.manager.execute(instance, 1, "echo", json!(null)).unwrap();

    match engine.next_event().await {
        ManagerEvent::Error { code, .. } => assert_eq!(code, CODE_INSTANCE_ERROR),
        other => panic!("expected an error event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_service_error_callback_and_prompt() {
    let tree = ServiceTree::new();
    tree.standalone("Echo", "1.0.0");
    let mut engine = Engine::start(&tree, &FakeHost::new()).await;
    let instance = engine.instantiate("Echo", "1.0.0").await;

    engine.manager.execute(instance, 1, "fail", json!({})).unwrap();
    assert_eq!(
        engine.next_event().await,
        ManagerEvent::Error {
            instance,
            tid: 1,
            code: "echo_failed".to_string(),
            message: "asked to fail".to_string(),
        }
    );

    engine
        .manager
        .execute(instance, 2, "callback", json!({ "text": "cb" }))
        .unwrap();
    assert_eq!(
        engine.next_event().await,
        ManagerEvent::Callback {
            instance,
            tid: 2,
            callback: 1,
            params: json!({ "text": "cb" }),
        }
    );
    assert!(matches!(engine.next_event().await, ManagerEvent::Result { tid: 2, .. }));

    engine.manager.execute(instance, 3, "prompt", json!({})).unwrap();
    let prompt = match engine.next_event().await {
        ManagerEvent::Prompt { tid: 3, prompt, .. } => prompt,
        other => panic!("expected a prompt, got {other:?}"),
    };
    engine
        .manager
        .prompt_response(instance, prompt, json!("yes"))
        .unwrap();
    assert_eq!(
        engine.next_event().await,
        ManagerEvent::Result {
            instance,
            tid: 3,
            result: json!("yes"),
        }
    );
    assert!(engine.manager.prompt_response(instance, prompt, json!("again")).is_err());
}

#[tokio::test]
async fn test_prompt_answered_by_other_instance_is_rejected() {
    let tree = ServiceTree::new();
    tree.standalone("Echo", "1.0.0");
    let mut engine = Engine::start(&tree, &FakeHost::new()).await;
    let owner = engine.instantiate("Echo", "1.0.0").await;
    let intruder = engine.instantiate("Echo", "1.0.0").await;

    engine.manager.execute(owner, 4, "prompt", json!({})).unwrap();
    let prompt = match engine.next_event().await {
        ManagerEvent::Prompt { instance, prompt, .. } if instance == owner => prompt,
        other => panic!("expected a prompt, got {other:?}"),
    };

    let err = engine
        .manager
        .prompt_response(intruder, prompt, json!("no"))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Runner(svc_runner::Error::PromptNotOwned { prompt: p, .. }) if p == prompt
    ));

    engine.manager.prompt_response(owner, prompt, json!("yes")).unwrap();
    assert_eq!(
        engine.next_event().await,
        ManagerEvent::Result {
            instance: owner,
            tid: 4,
            result: json!("yes"),
        }
    );
}

#[tokio::test]
async fn test_destroy_fails_open_calls() {
    let tree = ServiceTree::new();
    tree.standalone("Echo", "1.0.0");
    let mut engine = Engine::start(&tree, &FakeHost::new()).await;
    let instance = engine.instantiate("Echo", "1.0.0").await;

    engine.manager.execute(instance, 9, "hang", json!({})).unwrap();
    engine.manager.destroy(instance).unwrap();

    match engine.next_event().await {
        ManagerEvent::Error { tid, code, .. } => {
            assert_eq!(tid, 9);
            assert_eq!(code, CODE_INSTANCE_ERROR);
        }
        other => panic!("expected an error event, got {other:?}"),
    }
    assert!(matches!(
        engine.manager.destroy(instance),
        Err(Error::InstanceUnknown(id)) if id == instance
    ));
}

#[tokio::test]
async fn test_crash_fails_calls_and_instances_but_keeps_install() {
    let tree = ServiceTree::new();
    let echo = tree.standalone("Echo", "1.0.0");
    let host = FakeHost::new().with_behavior(&echo, Behavior::CrashOnInvoke);
    let mut engine = Engine::start(&tree, &host).await;
    let instance = engine.instantiate("Echo", "1.0.0").await;

    engine.manager.execute(instance, 1, "echo", json!({})).unwrap();

    match engine.next_event().await {
        ManagerEvent::Error { tid, code, .. } => {
            assert_eq!(tid, 1);
            assert_eq!(code, CODE_SERVICE_UNAVAILABLE);
        }
        other => panic!("expected an error event, got {other:?}"),
    }
    assert!(matches!(
        engine.next_event().await,
        ManagerEvent::InstanceEnded { instance: id, .. } if id == instance
    ));
    assert!(!engine.manager.is_busy());
    tree.assert_installed("Echo", "1.0.0");
    assert!(engine.manager.have_service("Echo", "1.0.0", ""));
    assert!(matches!(
        engine.manager.execute(instance, 2, "echo", json!({})),
        Err(Error::InstanceUnknown(_))
    ));
}

#[tokio::test]
async fn test_service_that_never_starts_is_removed() {
    let tree = ServiceTree::new();
    let echo = tree.standalone("Echo", "1.0.0");
    let host = FakeHost::new();
    let mut engine = Engine::start(&tree, &host).await;
    host.set_behavior(&echo, Behavior::CrashOnStart);

    let instance = engine
        .manager
        .instantiate("Echo", "1.0.0", AllocationContext::default())
        .unwrap();

    assert!(matches!(
        engine.next_event().await,
        ManagerEvent::InstantiateFailed { instance: id, .. } if id == instance
    ));
    tree.assert_removed("Echo", "1.0.0");
    assert!(!engine.manager.have_service("Echo", "1.0.0", ""));
    assert!(engine.manager.interface_cache().get("Echo", "1.0.0").is_none());
}

#[tokio::test]
async fn test_idle_service_lingers_for_its_shutdown_delay() {
    let tree = ServiceTree::new();
    tree.standalone_with_delay("Echo", "1.0.0", 30);
    let mut engine = Engine::start(&tree, &FakeHost::new()).await;

    let instance = engine.instantiate("Echo", "1.0.0").await;
    engine.manager.destroy(instance).unwrap();

    assert!(engine.manager.is_busy());
    let deadline = engine.manager.next_idle_deadline().unwrap();
    assert_eq!(engine.manager.reap_idle(Instant::now()), 0);

    let again = engine.instantiate("Echo", "1.0.0").await;
    assert_eq!(engine.manager.next_idle_deadline(), None);
    engine.manager.destroy(again).unwrap();

    let later = engine.manager.next_idle_deadline().unwrap();
    assert!(later >= deadline);
    assert_eq!(engine.manager.reap_idle(later + Duration::from_secs(1)), 1);
    engine.settle().await;
    assert!(!engine.manager.is_busy());
}

#[tokio::test]
async fn test_purge_service_stops_and_uninstalls() {
    let tree = ServiceTree::new();
    tree.standalone("Echo", "1.0.0");
    tree.standalone("Other", "1.0.0");
    let mut engine = Engine::start(&tree, &FakeHost::new()).await;
    let instance = engine.instantiate("Echo", "1.0.0").await;

    engine.manager.purge_service("Echo", "1.0.0").await.unwrap();

    tree.assert_removed("Echo", "1.0.0");
    assert!(!engine.manager.have_service("Echo", "", ""));
    assert!(engine.manager.have_service("Other", "", ""));
    assert!(engine.manager.interface_cache().get("Echo", "1.0.0").is_none());
    assert!(matches!(
        engine.next_event().await,
        ManagerEvent::InstanceEnded { instance: id, .. } if id == instance
    ));
    assert!(matches!(
        engine.manager.purge_service("Echo", "1.0.0").await,
        Err(Error::ServiceNotFound { .. })
    ));
}

#[tokio::test]
async fn test_rescan_stops_services_that_vanished() {
    let tree = ServiceTree::new();
    let echo = tree.standalone("Echo", "1.0.0");
    let mut engine = Engine::start(&tree, &FakeHost::new()).await;
    let instance = engine.instantiate("Echo", "1.0.0").await;

    fs::remove_dir_all(&echo).unwrap();
    engine.manager.force_rescan().await;

    assert!(matches!(
        engine.next_event().await,
        ManagerEvent::InstanceEnded { instance: id, .. } if id == instance
    ));
    assert!(engine.manager.available_services().is_empty());
}

#[tokio::test]
async fn test_satisfy_requirements_marks_downloads() {
    let tree = ServiceTree::new();
    tree.provider("Runtime", "2.1.0");
    let engine = Engine::start(&tree, &FakeHost::new()).await;

    let available =
        vec![AvailableService::dependent("Script", "1.0.0", "Runtime", "", "2.0").unwrap()];
    let wanted = vec![RequireStatement::new("Script")];
    let resolution = engine
        .manager
        .satisfy_requirements(&wanted, &available, true)
        .unwrap();

    let ordered: Vec<String> = resolution.ordered.iter().map(ToString::to_string).collect();
    assert_eq!(ordered, vec!["Runtime@2.1.0", "Script@1.0.0"]);
    assert_eq!(resolution.to_download, available);

    let missing = vec![RequireStatement::new("Absent")];
    assert!(matches!(
        engine.manager.satisfy_requirements(&missing, &available, true),
        Err(Error::Resolve(_))
    ));
}

#[tokio::test]
async fn test_fetch_and_install_updates() {
    let tree = ServiceTree::new();
    tree.standalone("Echo", "1.0.0");
    let mirror = TempDir::new().unwrap();
    fs::write(
        mirror.path().join("index.json"),
        r#"[{ "name": "Echo", "version": "2.0.0", "size": 100 }]"#,
    )
    .unwrap();
    fs::write(mirror.path().join("Echo-2.0.0.tar.gz"), package(&standalone_manifest())).unwrap();
    let source = DirectorySource::new(mirror.path());
    let mut engine = Engine::start(&tree, &FakeHost::new()).await;

    let staged = engine
        .manager
        .fetch_updates(&source, &[RequireStatement::new("Echo")])
        .await
        .unwrap();
    assert_eq!(staged.len(), 1);
    assert!(engine.manager.pending_cache().is_cached("Echo", "2.0.0"));

    let again = engine
        .manager
        .fetch_updates(&source, &[RequireStatement::new("Echo")])
        .await
        .unwrap();
    assert!(again.is_empty());

    let installed = engine.manager.install_updates().await.unwrap();
    assert_eq!(installed, vec![ServiceKey::new("Echo", "2.0.0")]);
    tree.assert_installed("Echo", "2.0.0");
    assert!(engine.manager.have_service("Echo", "2.0.0", ""));
    assert!(!engine.manager.pending_cache().is_cached("Echo", "2.0.0"));
}

#[test]
fn test_events_serialize_with_tag() {
    let event = ManagerEvent::InstantiateFailed {
        instance: InstanceId(4),
        reason: "gone".to_string(),
    };
    assert_eq!(
        serde_json::to_value(event).unwrap(),
        json!({ "event": "instantiate_failed", "instance": 4, "reason": "gone" })
    );
}
