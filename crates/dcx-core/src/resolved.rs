//! The resolved dev container: the single input the rest of the core consumes
//!
//! `ResolvedDevContainer` is produced once, up front, by combining the loaded config,
//! parsed mounts, ordered features, computed identity/hashes, and the accumulated
//! security requirements. Everything downstream (the plan resolver, build pipeline,
//! state detector, action planner, lifecycle executor) takes this record as input instead
//! of re-reading devcontainer.json.

use crate::config::{ConfigLoader, DevContainerConfig};
use crate::errors::{DcxError, Result};
use crate::features::{order_features, ResolvedFeature};
use crate::identity::{compute_hashes, compute_workspace_id, FeatureHashInput, HashInputs, HashSet};
use crate::mount::{Mount, MountMode, MountParser, MountType};
use crate::plan::{resolve_plan, ComposePlan, DockerfilePlan, ExecutionPlan, ImagePlan};
use crate::security::SecurityOptions;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Aggregate security posture accumulated from the config and every resolved feature, per
/// the build pipeline's features-layer step. A superset of [`SecurityOptions`] that also
/// carries `init` and the accumulated `container_env`, since those two also come from
/// feature metadata but aren't part of the narrower security-conflict-detection type.
#[derive(Debug, Clone, Default)]
pub struct SecurityRequirements {
    pub cap_add: Vec<String>,
    pub security_opt: Vec<String>,
    pub privileged: bool,
    pub init: bool,
    pub container_env: HashMap<String, String>,
}

impl SecurityRequirements {
    pub fn from_config_and_features(
        config: &DevContainerConfig,
        features: &[ResolvedFeature],
    ) -> Self {
        let merged: SecurityOptions = SecurityOptions::merge_from_config_and_features(config, features);

        let mut container_env = config.container_env.clone();
        let mut init = config.init.unwrap_or(false);
        for feature in features {
            for (k, v) in &feature.metadata.container_env {
                container_env.insert(k.clone(), v.clone());
            }
            if let Some(feature_init) = feature.metadata.init {
                init = init || feature_init;
            }
        }

        Self {
            cap_add: merged.cap_add,
            security_opt: merged.security_opt,
            privileged: merged.privileged,
            init,
            container_env,
        }
    }
}

/// Everything the lifecycle engine needs to decide and execute a plan, resolved once from
/// devcontainer.json and the workspace on disk.
#[derive(Debug, Clone)]
pub struct ResolvedDevContainer {
    /// The workspace id; also used as the container's name root.
    pub id: String,
    pub name: Option<String>,
    pub config_dir: PathBuf,
    pub local_root: PathBuf,
    pub config_path: PathBuf,
    pub workspace_folder: String,
    pub workspace_mount: Option<String>,
    pub plan: ExecutionPlan,
    pub features: Vec<ResolvedFeature>,
    pub mounts: Vec<Mount>,
    pub container_env: HashMap<String, String>,
    pub remote_env: HashMap<String, Option<String>>,
    pub forward_ports: Vec<String>,
    pub remote_user: Option<String>,
    pub container_user: Option<String>,
    pub should_update_uid: bool,
    pub host_uid: u32,
    pub host_gid: u32,
    pub cap_add: Vec<String>,
    pub security_opt: Vec<String>,
    pub privileged: bool,
    pub init: bool,
    pub runtime_secrets: HashMap<String, String>,
    pub hashes: HashSet,
    pub override_command: Option<bool>,
}

impl ResolvedDevContainer {
    /// Whether the engine should override the image's default CMD to keep the container
    /// alive (`sleep infinity`). Defaults to true for image/dockerfile plans, false for
    /// compose plans, unless the config says otherwise.
    pub fn effective_override_command(&self) -> bool {
        match self.override_command {
            Some(v) => v,
            None => !matches!(self.plan, ExecutionPlan::Compose(_)),
        }
    }
}

fn plan_from_config(config: &DevContainerConfig, config_dir: &Path) -> Result<ExecutionPlan> {
    if let Some(compose_value) = &config.docker_compose_file {
        let files: Vec<PathBuf> = match compose_value {
            serde_json::Value::String(s) => vec![PathBuf::from(s)],
            serde_json::Value::Array(arr) => arr
                .iter()
                .filter_map(|v| v.as_str().map(PathBuf::from))
                .collect(),
            _ => Vec::new(),
        };
        let service = config
            .service
            .clone()
            .ok_or_else(|| DcxError::configuration("dockerComposeFile requires a service"))?;
        return Ok(ExecutionPlan::Compose(ComposePlan {
            files,
            service,
            run_services: config.run_services.clone(),
        }));
    }

    if let Some(dockerfile) = &config.dockerfile {
        let (build_args, target) = match &config.build {
            Some(serde_json::Value::Object(obj)) => {
                let build_args = obj
                    .get("args")
                    .and_then(|v| v.as_object())
                    .map(|m| {
                        m.iter()
                            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                            .collect()
                    })
                    .unwrap_or_default();
                let target = obj.get("target").and_then(|v| v.as_str()).map(String::from);
                (build_args, target)
            }
            _ => (HashMap::new(), None),
        };
        return Ok(ExecutionPlan::Dockerfile(DockerfilePlan {
            dockerfile: PathBuf::from(dockerfile),
            context: config_dir.to_path_buf(),
            build_args,
            target,
        }));
    }

    if let Some(image) = &config.image {
        return Ok(ExecutionPlan::Image(ImagePlan {
            image: image.clone(),
        }));
    }

    Err(DcxError::configuration(
        "devcontainer.json must specify one of image, dockerFile, or dockerComposeFile",
    ))
}

/// The mount that puts the workspace inside the container: `config.workspace_mount` if set,
/// else a default bind of `local_root` onto `workspace_folder`. Without this, a created
/// container has no workspace in it at all.
fn workspace_bind_mount(config: &DevContainerConfig, local_root: &Path, workspace_folder: &str) -> Result<Mount> {
    match &config.workspace_mount {
        Some(spec) => MountParser::parse_mount(spec),
        None => Ok(Mount {
            mount_type: MountType::Bind,
            source: Some(local_root.to_string_lossy().to_string()),
            target: workspace_folder.to_string(),
            mode: MountMode::ReadWrite,
            consistency: None,
            options: HashMap::new(),
        }),
    }
}

/// Resolve a devcontainer.json on disk, its workspace root, and pre-resolved features into
/// a [`ResolvedDevContainer`]. `features` must already carry parsed metadata; ordering and
/// the security/hash aggregation happen here.
pub fn resolve(
    config_path: &Path,
    local_root: &Path,
    features: Vec<ResolvedFeature>,
    project_name: Option<&str>,
    host_uid: u32,
    host_gid: u32,
) -> Result<ResolvedDevContainer> {
    let config_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let (config, _report) = ConfigLoader::load_with_substitution(config_path, local_root)?;

    let ordered_features = order_features(features)?;

    let plan = plan_from_config(&config, &config_dir)?;
    let plan = resolve_plan(plan, &config_dir)?;

    let workspace_folder = config
        .workspace_folder
        .clone()
        .unwrap_or_else(|| "/workspaces/workspace".to_string());

    let mut mounts = MountParser::parse_mounts_from_json(&config.mounts);
    mounts.insert(0, workspace_bind_mount(&config, local_root, &workspace_folder)?);

    let security = SecurityRequirements::from_config_and_features(&config, &ordered_features);

    let workspace_id = compute_workspace_id(local_root, project_name)?;

    let devcontainer_json = std::fs::read(config_path).map_err(DcxError::from)?;
    let dockerfile_bytes = if let ExecutionPlan::Dockerfile(df) = &plan {
        Some(std::fs::read(&df.dockerfile).map_err(DcxError::from)?)
    } else {
        None
    };
    let compose_bytes: Vec<Vec<u8>> = if let ExecutionPlan::Compose(compose) = &plan {
        compose
            .files
            .iter()
            .map(|f| std::fs::read(f).map_err(DcxError::from))
            .collect::<Result<Vec<_>>>()?
    } else {
        Vec::new()
    };
    let feature_hash_inputs: Vec<FeatureHashInput> = ordered_features
        .iter()
        .map(|f| FeatureHashInput {
            id: f.id.clone(),
            resolved_digest: f.source.clone(),
            options: f
                .options
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::to_value(v).unwrap_or(serde_json::Value::Null)))
                .collect(),
        })
        .collect();

    let hashes = compute_hashes(&HashInputs {
        devcontainer_json: &devcontainer_json,
        dockerfile: dockerfile_bytes.as_deref(),
        compose_files: &compose_bytes,
        features: &feature_hash_inputs,
    })?;

    let should_update_uid = config.update_remote_user_uid.unwrap_or(true)
        && !matches!(plan, ExecutionPlan::Compose(_));

    let forward_ports = config
        .forward_ports
        .iter()
        .map(|v| match v {
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();

    Ok(ResolvedDevContainer {
        id: workspace_id,
        name: config.name.clone(),
        config_dir,
        local_root: local_root.to_path_buf(),
        config_path: config_path.to_path_buf(),
        workspace_folder: workspace_folder.clone(),
        workspace_mount: config.workspace_mount.clone(),
        plan,
        features: ordered_features,
        mounts,
        container_env: security.container_env.clone(),
        remote_env: config.remote_env.clone(),
        forward_ports,
        remote_user: config.remote_user.clone(),
        container_user: config.container_user.clone(),
        should_update_uid,
        host_uid,
        host_gid,
        cap_add: security.cap_add,
        security_opt: security.security_opt,
        privileged: security.privileged,
        init: security.init,
        runtime_secrets: HashMap::new(),
        hashes,
        override_command: config.override_command,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_override_command_defaults() {
        let base = ResolvedDevContainer {
            id: "ws".into(),
            name: None,
            config_dir: PathBuf::from("/cfg"),
            local_root: PathBuf::from("/root"),
            config_path: PathBuf::from("/cfg/devcontainer.json"),
            workspace_folder: "/workspaces/app".into(),
            workspace_mount: None,
            plan: ExecutionPlan::Image(ImagePlan { image: "ubuntu".into() }),
            features: vec![],
            mounts: vec![],
            container_env: HashMap::new(),
            remote_env: HashMap::new(),
            forward_ports: vec![],
            remote_user: None,
            container_user: None,
            should_update_uid: false,
            host_uid: 1000,
            host_gid: 1000,
            cap_add: vec![],
            security_opt: vec![],
            privileged: false,
            init: false,
            runtime_secrets: HashMap::new(),
            hashes: HashSet::default(),
            override_command: None,
        };
        assert!(base.effective_override_command());

        let mut compose = base.clone();
        compose.plan = ExecutionPlan::Compose(ComposePlan {
            files: vec![PathBuf::from("docker-compose.yml")],
            service: "app".into(),
            run_services: vec![],
        });
        assert!(!compose.effective_override_command());

        let mut explicit = base;
        explicit.override_command = Some(false);
        assert!(!explicit.effective_override_command());
    }

    #[test]
    fn test_workspace_bind_mount_defaults_to_local_root() {
        let config = DevContainerConfig::default();
        let mount = workspace_bind_mount(&config, Path::new("/host/ws"), "/workspaces/app").unwrap();
        assert_eq!(mount.mount_type, MountType::Bind);
        assert_eq!(mount.source.as_deref(), Some("/host/ws"));
        assert_eq!(mount.target, "/workspaces/app");
    }

    #[test]
    fn test_workspace_bind_mount_honors_explicit_workspace_mount() {
        let mut config = DevContainerConfig::default();
        config.workspace_mount = Some("source=/custom,target=/workspaces/custom,type=bind".to_string());
        let mount = workspace_bind_mount(&config, Path::new("/host/ws"), "/workspaces/app").unwrap();
        assert_eq!(mount.source.as_deref(), Some("/custom"));
        assert_eq!(mount.target, "/workspaces/custom");
    }

    #[test]
    fn test_resolve_synthesizes_workspace_bind_mount() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = tmp.path();
        let config_dir = workspace.join(".devcontainer");
        std::fs::create_dir_all(&config_dir).unwrap();
        let config_path = config_dir.join("devcontainer.json");
        std::fs::write(&config_path, r#"{"image": "alpine:3.19"}"#).unwrap();

        let resolved = resolve(&config_path, workspace, vec![], None, 1000, 1000).unwrap();
        assert_eq!(resolved.mounts.len(), 1);
        let mount = &resolved.mounts[0];
        assert_eq!(mount.mount_type, MountType::Bind);
        assert_eq!(mount.target, resolved.workspace_folder);
        assert_eq!(
            mount.source.as_deref(),
            Some(workspace.to_string_lossy().as_ref())
        );
    }
}
