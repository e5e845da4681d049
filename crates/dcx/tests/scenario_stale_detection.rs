//! Stale detection: `start`/`exec` behave differently from `up` once a workspace's
//! `hash.overall` no longer matches the primary container's stamped label.

use dcx_core::action::{plan_command, Command, PlanAction};
use dcx_core::detector::{detect_state, ContainerState};
use dcx_core::build_pipeline::BuildFlags;
use dcx_core::executor;
use dcx_core::identity::HashSet;
use dcx_core::plan::{ExecutionPlan, ImagePlan};
use dcx_core::resolved::ResolvedDevContainer;
use dcx_core::runtime_adapter::fake::FakeRuntimeAdapter;
use std::collections::HashMap;
use std::path::PathBuf;

fn image_resolved(overall_hash: &str) -> ResolvedDevContainer {
    ResolvedDevContainer {
        id: "ws-stale".into(),
        name: Some("stale-app".into()),
        config_dir: PathBuf::from("/workspace/.devcontainer"),
        local_root: PathBuf::from("/workspace"),
        config_path: PathBuf::from("/workspace/.devcontainer/devcontainer.json"),
        workspace_folder: "/workspaces/app".into(),
        workspace_mount: None,
        plan: ExecutionPlan::Image(ImagePlan { image: "ubuntu:22.04".into() }),
        features: vec![],
        mounts: vec![],
        container_env: HashMap::new(),
        remote_env: HashMap::new(),
        forward_ports: vec![],
        remote_user: Some("vscode".into()),
        container_user: None,
        should_update_uid: false,
        host_uid: 1000,
        host_gid: 1000,
        cap_add: vec![],
        security_opt: vec![],
        privileged: false,
        init: false,
        runtime_secrets: HashMap::new(),
        hashes: HashSet {
            overall: overall_hash.to_string(),
            config: overall_hash.to_string(),
            dockerfile: String::new(),
            compose: String::new(),
            features: String::new(),
        },
        override_command: None,
    }
}

async fn detect(adapter: &FakeRuntimeAdapter, resolved: &ResolvedDevContainer) -> ContainerState {
    let mut filter = HashMap::new();
    filter.insert("dcx.workspace.id".to_string(), resolved.id.clone());
    let containers = adapter.list_by_labels(&filter).await.unwrap();
    detect_state(&resolved.id, &resolved.hashes.overall, &containers).state
}

#[tokio::test]
async fn start_on_a_stale_environment_errors_with_a_recovery_hint() {
    let adapter = FakeRuntimeAdapter::new();
    let original = image_resolved("hash-v1");
    executor::execute(&adapter, &original, PlanAction::Create, None, BuildFlags::default()).await.unwrap();

    let changed = image_resolved("hash-v2");
    assert_eq!(detect(&adapter, &changed).await, ContainerState::Stale);

    let action = plan_command(Command::Start, ContainerState::Stale);
    let PlanAction::Error(hint) = action else {
        panic!("expected start on a stale environment to be disallowed, got {action:?}");
    };
    assert!(hint.contains("up"), "recovery hint should point at `up`: {hint}");
}

#[tokio::test]
async fn exec_on_a_stale_environment_proceeds_with_a_warning() {
    let adapter = FakeRuntimeAdapter::new();
    let original = image_resolved("hash-v1");
    let outcome = executor::execute(&adapter, &original, PlanAction::Create, None, BuildFlags::default()).await.unwrap();
    let container_id = outcome.container_id.unwrap();

    let changed = image_resolved("hash-v2");
    assert_eq!(detect(&adapter, &changed).await, ContainerState::Stale);

    let action = plan_command(Command::Exec, ContainerState::Stale);
    assert_eq!(action, PlanAction::ExecWithWarning);

    let outcome = executor::execute(&adapter, &changed, action, Some(&container_id), BuildFlags::default()).await.unwrap();
    assert_eq!(outcome.container_id.as_deref(), Some(container_id.as_str()));
}

#[tokio::test]
async fn up_on_a_stale_environment_recreates_it() {
    let adapter = FakeRuntimeAdapter::new();
    let original = image_resolved("hash-v1");
    let outcome = executor::execute(&adapter, &original, PlanAction::Create, None, BuildFlags::default()).await.unwrap();
    let original_id = outcome.container_id.unwrap();

    let changed = image_resolved("hash-v2");
    assert_eq!(detect(&adapter, &changed).await, ContainerState::Stale);

    let action = plan_command(Command::Up, ContainerState::Stale);
    assert_eq!(action, PlanAction::Recreate);

    let outcome = executor::execute(&adapter, &changed, action, Some(&original_id), BuildFlags::default()).await.unwrap();
    let new_id = outcome.container_id.unwrap();
    assert_ne!(new_id, original_id);
    assert_eq!(detect(&adapter, &changed).await, ContainerState::Running);
}
