//! Compose-based devcontainer with features: `up` on an absent environment brings the
//! primary service up via `compose up --build` and the resulting container is detected
//! as the managed primary for the workspace.

use dcx_core::action::{plan_action, PlanAction, PlanFlags};
use dcx_core::detector::{detect_state, ContainerState};
use dcx_core::build_pipeline::BuildFlags;
use dcx_core::executor;
use dcx_core::features::{FeatureMetadata, ResolvedFeature};
use dcx_core::identity::HashSet;
use dcx_core::plan::{ComposePlan, ExecutionPlan};
use dcx_core::resolved::ResolvedDevContainer;
use dcx_core::runtime_adapter::fake::FakeRuntimeAdapter;
use std::collections::HashMap;
use std::path::PathBuf;

fn docker_feature() -> ResolvedFeature {
    ResolvedFeature {
        id: "docker-in-docker".to_string(),
        source: "ghcr.io/devcontainers/features/docker-in-docker".to_string(),
        options: HashMap::new(),
        metadata: FeatureMetadata {
            id: "docker-in-docker".to_string(),
            version: Some("2".to_string()),
            name: Some("Docker in Docker".to_string()),
            description: None,
            documentation_url: None,
            license_url: None,
            options: HashMap::new(),
            container_env: HashMap::new(),
            mounts: Vec::new(),
            init: Some(true),
            privileged: Some(true),
            cap_add: vec!["SYS_ADMIN".to_string()],
            security_opt: vec![],
            installs_after: Vec::new(),
            depends_on: HashMap::new(),
            on_create_command: None,
            update_content_command: None,
            post_create_command: None,
            post_start_command: None,
            post_attach_command: None,
        },
    }
}

fn compose_resolved() -> ResolvedDevContainer {
    ResolvedDevContainer {
        id: "ws-compose".into(),
        name: Some("compose-app".into()),
        config_dir: PathBuf::from("/workspace/.devcontainer"),
        local_root: PathBuf::from("/workspace"),
        config_path: PathBuf::from("/workspace/.devcontainer/devcontainer.json"),
        workspace_folder: "/workspaces/app".into(),
        workspace_mount: None,
        plan: ExecutionPlan::Compose(ComposePlan {
            files: vec![PathBuf::from("/workspace/.devcontainer/docker-compose.yml")],
            service: "app".into(),
            run_services: vec!["db".into()],
        }),
        features: vec![docker_feature()],
        mounts: vec![],
        container_env: HashMap::new(),
        remote_env: HashMap::new(),
        forward_ports: vec![],
        remote_user: Some("vscode".into()),
        container_user: None,
        should_update_uid: false,
        host_uid: 1000,
        host_gid: 1000,
        cap_add: vec!["SYS_ADMIN".into()],
        security_opt: vec![],
        privileged: true,
        init: true,
        runtime_secrets: HashMap::new(),
        hashes: HashSet {
            overall: "hash-compose-1".into(),
            config: "hash-compose-config-1".into(),
            dockerfile: String::new(),
            compose: "hash-compose-file-1".into(),
            features: "hash-compose-features-1".into(),
        },
        override_command: None,
    }
}

#[tokio::test]
async fn up_on_absent_compose_project_brings_the_primary_service_up() {
    let adapter = FakeRuntimeAdapter::new();
    let resolved = compose_resolved();

    assert!(!resolved.effective_override_command(), "compose plans don't override CMD by default");

    let action = plan_action(ContainerState::Absent, PlanFlags::default());
    assert_eq!(action, PlanAction::Create);

    let outcome = executor::execute(&adapter, &resolved, action, None, BuildFlags::default()).await.unwrap();
    let container_id = outcome.container_id.expect("compose up should resolve a primary container id");

    let summary = adapter
        .inspect(&container_id)
        .await
        .expect("the service compose started should be inspectable");
    assert!(summary.running);
    assert_eq!(summary.name, "app", "the primary service name is used as the container name");
    assert_eq!(
        summary.labels.get("dcx.compose.service").map(String::as_str),
        Some("app")
    );
    assert_eq!(
        summary.labels.get("dcx.workspace.id").map(String::as_str),
        Some(resolved.id.as_str())
    );

    let mut filter = HashMap::new();
    filter.insert("dcx.workspace.id".to_string(), resolved.id.clone());
    let containers = adapter.list_by_labels(&filter).await.unwrap();
    let detection = detect_state(&resolved.id, &resolved.hashes.overall, &containers);
    assert_eq!(detection.state, ContainerState::Running);
}

#[tokio::test]
async fn down_on_a_running_compose_project_removes_the_primary_container() {
    let adapter = FakeRuntimeAdapter::new();
    let resolved = compose_resolved();

    let outcome = executor::execute(&adapter, &resolved, PlanAction::Create, None, BuildFlags::default()).await.unwrap();
    let container_id = outcome.container_id.unwrap();

    let action = dcx_core::action::plan_command(dcx_core::action::Command::Down, ContainerState::Running);
    assert_eq!(action, PlanAction::StopAndRemove);

    executor::execute(&adapter, &resolved, action, Some(&container_id), BuildFlags::default()).await.unwrap();

    let containers = adapter.list_by_labels(&HashMap::new()).await.unwrap();
    assert!(containers.is_empty());
}
