//! Dockerfile-based devcontainer: config changes make the container stale, `up` rebuilds
//! the image and recreates it.

use dcx_core::action::{plan_action, PlanFlags};
use dcx_core::detector::{detect_state, ContainerState};
use dcx_core::build_pipeline::BuildFlags;
use dcx_core::executor;
use dcx_core::identity::HashSet;
use dcx_core::plan::{DockerfilePlan, ExecutionPlan};
use dcx_core::resolved::ResolvedDevContainer;
use dcx_core::runtime_adapter::fake::FakeRuntimeAdapter;
use dcx_core::runtime_adapter::RuntimeAdapter;
use std::collections::HashMap;
use std::path::PathBuf;

fn dockerfile_resolved(overall_hash: &str) -> ResolvedDevContainer {
    ResolvedDevContainer {
        id: "ws-dockerfile".into(),
        name: Some("dockerfile-app".into()),
        config_dir: PathBuf::from("/workspace/.devcontainer"),
        local_root: PathBuf::from("/workspace"),
        config_path: PathBuf::from("/workspace/.devcontainer/devcontainer.json"),
        workspace_folder: "/workspaces/app".into(),
        workspace_mount: None,
        plan: ExecutionPlan::Dockerfile(DockerfilePlan {
            dockerfile: PathBuf::from("/workspace/.devcontainer/Dockerfile"),
            context: PathBuf::from("/workspace/.devcontainer"),
            build_args: HashMap::new(),
            target: None,
        }),
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
            dockerfile: "hash-dockerfile-1".into(),
            compose: String::new(),
            features: String::new(),
        },
        override_command: None,
    }
}

#[tokio::test]
async fn config_change_triggers_rebuild_and_recreate() {
    let adapter = FakeRuntimeAdapter::new();
    let resolved = dockerfile_resolved("hash-v1");

    let action = plan_action(ContainerState::Absent, PlanFlags::default());
    let outcome = executor::execute(&adapter, &resolved, action, None, BuildFlags::default()).await.unwrap();
    let original_id = outcome.container_id.unwrap();

    let built_tag = format!("dcx/{}:base", resolved.id);
    assert!(adapter.image_exists(&built_tag).await.unwrap());

    // Simulate the config changing: a new overall hash, same workspace id.
    let changed = dockerfile_resolved("hash-v2");

    let mut filter = HashMap::new();
    filter.insert("dcx.workspace.id".to_string(), changed.id.clone());
    let containers = adapter.list_by_labels(&filter).await.unwrap();
    let detection = detect_state(&changed.id, &changed.hashes.overall, &containers);
    assert_eq!(detection.state, ContainerState::Stale);

    let action = plan_action(detection.state, PlanFlags::default());
    assert_eq!(action, dcx_core::action::PlanAction::Recreate);

    let outcome = executor::execute(&adapter, &changed, action, Some(&original_id), BuildFlags::default()).await.unwrap();
    let new_id = outcome.container_id.expect("recreate should return a new container id");
    assert_ne!(new_id, original_id, "recreate should produce a fresh container id");

    let containers = adapter.list_by_labels(&HashMap::new()).await.unwrap();
    assert_eq!(containers.len(), 1, "the stale container should have been removed");

    let detection = detect_state(&changed.id, &changed.hashes.overall, &containers);
    assert_eq!(detection.state, ContainerState::Running);
}

#[tokio::test]
async fn explicit_rebuild_flag_forces_rebuild_even_when_running() {
    let adapter = FakeRuntimeAdapter::new();
    let resolved = dockerfile_resolved("hash-v1");

    let outcome = executor::execute(&adapter, &resolved, dcx_core::action::PlanAction::Create, None, BuildFlags::default())
        .await
        .unwrap();
    let original_id = outcome.container_id.unwrap();

    let action = plan_action(ContainerState::Running, PlanFlags { rebuild: true, recreate: false });
    assert_eq!(action, dcx_core::action::PlanAction::Rebuild);

    let outcome = executor::execute(&adapter, &resolved, action, Some(&original_id), BuildFlags::default()).await.unwrap();
    assert!(outcome.container_id.is_some());

    let containers = adapter.list_by_labels(&HashMap::new()).await.unwrap();
    assert_eq!(containers.len(), 1, "rebuild should leave exactly one primary container");
}
