//! Lifecycle executor: turns a `PlanAction` into runtime-adapter calls
//!
//! Single-container plans go straight through the build pipeline and
//! `container_create`/`container_start`. Compose plans build the derived image out-of-band
//! (`compose build`) and pin the primary service to it via a generated override file before
//! `compose up` — the same technique `compose.rs`'s
//! `ComposeProject::generate_injection_override` uses for mounts/env — so compose never
//! re-resolves the service's own `build:` stanza at `up` time.

use crate::action::PlanAction;
use crate::build_pipeline::{self, BuildFlags};
use crate::errors::{DcxError, Result};
use crate::labels::LabelBuilder;
use crate::mount::{MountMode, MountType};
use crate::plan::ExecutionPlan;
use crate::ports::parse_forward_ports;
use crate::resolved::ResolvedDevContainer;
use crate::runtime_adapter::{ContainerCreateOptions, RuntimeAdapter};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Who created the container, stamped into `created.by` for diagnostics.
const CREATED_BY: &str = "dcx";

/// Outcome of executing an action: the primary container id, if one now exists.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub container_id: Option<String>,
}

/// Write runtime secrets into `/run/secrets` inside the container via an in-container
/// write-then-chown-then-chmod-400 sequence, run as root, then owned by the configured
/// user. Exec'd after start since `docker create` can't write files into a tmpfs mount.
#[instrument(skip(adapter, resolved))]
async fn write_runtime_secrets(
    adapter: &dyn RuntimeAdapter,
    resolved: &ResolvedDevContainer,
    container_id: &str,
) -> Result<()> {
    if resolved.runtime_secrets.is_empty() {
        return Ok(());
    }
    let owner = resolved
        .container_user
        .as_deref()
        .or(resolved.remote_user.as_deref())
        .unwrap_or("root");

    for (key, value) in &resolved.runtime_secrets {
        let path = format!("/run/secrets/{key}");
        let script = format!(
            "umask 077 && cat > {path} <<'DCX_SECRET_EOF'\n{value}\nDCX_SECRET_EOF\nchown {owner} {path} && chmod 400 {path}"
        );
        let result = adapter
            .exec(
                container_id,
                &crate::runtime_adapter::ExecOptions {
                    command: vec!["/bin/sh".to_string(), "-c".to_string(), script],
                    user: Some("root".to_string()),
                    ..Default::default()
                },
            )
            .await?;
        if result.exit_code != 0 {
            return Err(DcxError::runtime(format!(
                "failed to write secret '{key}' into container: {}",
                String::from_utf8_lossy(&result.stderr)
            )));
        }
    }
    Ok(())
}

/// Quote and escape a scalar for inline YAML: newlines, colons, quotes, comment markers,
/// YAML directive characters, and leading/trailing whitespace all force quoting.
fn escape_yaml_value(value: &str) -> String {
    let needs_quoting = value.contains('\n')
        || value.contains(':')
        || value.contains('#')
        || value.contains('"')
        || value.contains('\'')
        || value.starts_with(' ')
        || value.ends_with(' ')
        || value.starts_with('!')
        || value.starts_with('&')
        || value.starts_with('*')
        || value.is_empty();

    if needs_quoting {
        let escaped = value
            .replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('\n', "\\n")
            .replace('\r', "\\r")
            .replace('\t', "\\t");
        format!("\"{escaped}\"")
    } else {
        format!("\"{value}\"")
    }
}

/// Render the compose override: pins the primary service to the pre-built derived image tag
/// and stamps the `dcx.*` label set onto it. Pinning `image:` this way — rather than passing
/// `--build` to `compose up` — keeps compose from re-resolving the service's own `build:`
/// stanza and clobbering the derived image at `up` time.
fn render_compose_override(service: &str, image_tag: &str, resolved: &ResolvedDevContainer, labels: &HashMap<String, String>) -> String {
    let mut sorted_labels: Vec<(&String, &String)> = labels.iter().collect();
    sorted_labels.sort_by_key(|(k, _)| k.as_str());

    let mut yaml = String::from("services:\n");
    yaml.push_str(&format!("  {service}:\n"));
    yaml.push_str(&format!("    image: \"{image_tag}\"\n"));
    yaml.push_str("    labels:\n");
    for (k, v) in sorted_labels {
        yaml.push_str(&format!("      {k}: \"{v}\"\n"));
    }

    if !resolved.container_env.is_empty() {
        let mut sorted_env: Vec<(&String, &String)> = resolved.container_env.iter().collect();
        sorted_env.sort_by_key(|(k, _)| k.as_str());
        yaml.push_str("    environment:\n");
        for (k, v) in sorted_env {
            yaml.push_str(&format!("      {k}: {}\n", escape_yaml_value(v)));
        }
    }

    let ports = parse_forward_ports(&resolved.forward_ports);
    if !ports.is_empty() {
        yaml.push_str("    ports:\n");
        for port in &ports {
            yaml.push_str(&format!("      - \"{port}\"\n"));
        }
    }

    let bind_and_volume_mounts: Vec<_> = resolved
        .mounts
        .iter()
        .filter(|m| matches!(m.mount_type, MountType::Bind | MountType::Volume))
        .filter(|m| m.source.is_some())
        .collect();
    if !bind_and_volume_mounts.is_empty() {
        yaml.push_str("    volumes:\n");
        for mount in bind_and_volume_mounts {
            let source = mount.source.as_deref().unwrap_or_default();
            let mut mount_str = format!("{source}:{}", mount.target);
            let mut options = Vec::new();
            if mount.mode == MountMode::ReadOnly {
                options.push("ro".to_string());
            }
            if let Some(ref consistency) = mount.consistency {
                options.push(consistency.to_string());
            }
            if !options.is_empty() {
                mount_str.push(':');
                mount_str.push_str(&options.join(","));
            }
            yaml.push_str(&format!("      - {mount_str}\n"));
        }
    }

    yaml
}

/// Execute a compose plan's create path: build the derived image out-of-band, write an
/// override pinning the primary service to it, `compose up -d` (never `--build` — see
/// DESIGN.md's build-stanza-clobbering decision), then look the resulting container back up
/// by label since compose itself doesn't hand back a container id.
#[instrument(skip(adapter, resolved))]
async fn create_compose_container(
    adapter: &dyn RuntimeAdapter,
    resolved: &ResolvedDevContainer,
) -> Result<String> {
    let compose = match &resolved.plan {
        ExecutionPlan::Compose(c) => c,
        _ => return Err(DcxError::internal("create_compose_container called with a non-compose plan")),
    };

    let image_tag = format!("dcx/{}:compose-{}", resolved.id, compose.service);

    let labels = LabelBuilder::new(&resolved.id, &resolved.local_root.to_string_lossy(), CREATED_BY)
        .with_hashes(&resolved.hashes)
        .with_workspace_name(resolved.name.as_deref())
        .with_config_path(&resolved.config_path.to_string_lossy())
        .with_build_metadata(Some(&image_tag), Some(&image_tag), resolved.plan.kind())
        .with_compose(&resolved.id, &compose.service)
        .with_primary(true)
        .with_lifecycle_state("created")
        .build();

    let override_dir = std::env::temp_dir().join(format!("dcx-compose-{}", resolved.id));
    std::fs::create_dir_all(&override_dir).map_err(DcxError::from)?;
    let override_path = override_dir.join("dcx-override.yml");
    std::fs::write(&override_path, render_compose_override(&compose.service, &image_tag, resolved, &labels))
        .map_err(DcxError::from)?;

    let mut base_args: Vec<String> = Vec::new();
    for file in &compose.files {
        base_args.push("-f".to_string());
        base_args.push(file.to_string_lossy().to_string());
    }
    base_args.push("-f".to_string());
    base_args.push(override_path.to_string_lossy().to_string());

    let cwd = resolved.config_dir.to_string_lossy().to_string();

    let mut build_args = base_args.clone();
    build_args.push("build".to_string());
    build_args.push(compose.service.clone());
    let status = adapter.compose_run(&build_args, &cwd).await?;
    if status != 0 {
        return Err(DcxError::build(format!("docker compose build exited with status {status}")));
    }

    let mut up_args = base_args;
    up_args.push("up".to_string());
    up_args.push("-d".to_string());
    up_args.push(compose.service.clone());
    up_args.extend(compose.run_services.iter().cloned());
    let status = adapter.compose_run(&up_args, &cwd).await?;
    if status != 0 {
        return Err(DcxError::runtime(format!("docker compose up exited with status {status}")));
    }

    let mut filter = HashMap::new();
    filter.insert("dcx.workspace.id".to_string(), resolved.id.clone());
    let containers = adapter.list_by_labels(&filter).await?;
    containers
        .into_iter()
        .find(|c| crate::labels::is_primary(&c.labels))
        .map(|c| c.id)
        .ok_or_else(|| DcxError::runtime("compose up succeeded but no primary container could be found by label"))
}

/// Execute a single-container (`Image`/`Dockerfile`) plan's create path end to end.
#[instrument(skip(adapter, resolved))]
async fn create_single_container(
    adapter: &dyn RuntimeAdapter,
    resolved: &ResolvedDevContainer,
    build_flags: BuildFlags,
) -> Result<String> {
    let outcome = build_pipeline::run(adapter, resolved, build_flags).await?;

    let mut labels = LabelBuilder::new(&resolved.id, &resolved.local_root.to_string_lossy(), CREATED_BY)
        .with_hashes(&resolved.hashes)
        .with_workspace_name(resolved.name.as_deref())
        .with_config_path(&resolved.config_path.to_string_lossy())
        .with_build_metadata(Some(&outcome.image_tag), Some(&outcome.image_tag), resolved.plan.kind())
        .with_primary(true)
        .with_lifecycle_state("created")
        .build();

    let feature_ids: Vec<String> = resolved.features.iter().map(|f| f.id.clone()).collect();
    if !feature_ids.is_empty() {
        labels.extend(
            LabelBuilder::new(&resolved.id, &resolved.local_root.to_string_lossy(), CREATED_BY)
                .with_features(&feature_ids, &serde_json::Value::Null)
                .build(),
        );
    }

    let mounts = resolved
        .mounts
        .iter()
        .flat_map(|m| m.to_docker_args())
        .collect::<Vec<_>>()
        .chunks(2)
        .filter_map(|chunk| chunk.get(1).cloned())
        .collect();

    let (entrypoint, cmd) = if resolved.effective_override_command() {
        (Some(vec!["sleep".to_string()]), Some(vec!["infinity".to_string()]))
    } else {
        (None, None)
    };

    let create_opts = ContainerCreateOptions {
        name: format!("dcx-{}", resolved.id),
        image: outcome.image_tag,
        labels,
        env: outcome.security.container_env,
        mounts,
        ports: parse_forward_ports(&resolved.forward_ports),
        cap_add: outcome.security.cap_add,
        security_opt: outcome.security.security_opt,
        privileged: outcome.security.privileged,
        init: outcome.security.init,
        entrypoint,
        cmd,
        run_args: vec![],
    };

    let container_id = adapter.container_create(&create_opts).await?;
    adapter.container_start(&container_id).await?;
    write_runtime_secrets(adapter, resolved, &container_id).await?;
    Ok(container_id)
}

/// Execute a `PlanAction` for the given resolved environment.
#[instrument(skip(adapter, resolved))]
pub async fn execute(
    adapter: &dyn RuntimeAdapter,
    resolved: &ResolvedDevContainer,
    action: PlanAction,
    primary_container_id: Option<&str>,
    build_flags: BuildFlags,
) -> Result<ExecutionOutcome> {
    match action {
        PlanAction::None => Ok(ExecutionOutcome {
            container_id: primary_container_id.map(String::from),
        }),

        PlanAction::Create => {
            let id = match &resolved.plan {
                ExecutionPlan::Compose(_) => create_compose_container(adapter, resolved).await?,
                _ => create_single_container(adapter, resolved, build_flags).await?,
            };
            info!(container_id = %id, "created container");
            Ok(ExecutionOutcome { container_id: Some(id) })
        }

        PlanAction::Start => {
            let id = primary_container_id
                .ok_or_else(|| DcxError::internal("start requested with no primary container"))?;
            adapter.container_start(id).await?;
            Ok(ExecutionOutcome { container_id: Some(id.to_string()) })
        }

        PlanAction::Stop => {
            let id = primary_container_id
                .ok_or_else(|| DcxError::internal("stop requested with no primary container"))?;
            adapter.container_stop(id).await?;
            Ok(ExecutionOutcome { container_id: Some(id.to_string()) })
        }

        PlanAction::BestEffortStop => {
            if let Some(id) = primary_container_id {
                if let Err(e) = adapter.container_stop(id).await {
                    warn!("best-effort stop failed, continuing: {e}");
                }
            }
            Ok(ExecutionOutcome { container_id: primary_container_id.map(String::from) })
        }

        PlanAction::Remove => {
            if let Some(id) = primary_container_id {
                adapter.container_remove(id, false).await?;
            }
            Ok(ExecutionOutcome::default())
        }

        PlanAction::StopAndRemove => {
            if let Some(id) = primary_container_id {
                let _ = adapter.container_stop(id).await;
                adapter.container_remove(id, true).await?;
            }
            Ok(ExecutionOutcome::default())
        }

        PlanAction::Rebuild | PlanAction::Recreate => {
            if let Some(id) = primary_container_id {
                let _ = adapter.container_stop(id).await;
                adapter.container_remove(id, true).await?;
            }
            let id = match &resolved.plan {
                ExecutionPlan::Compose(_) => create_compose_container(adapter, resolved).await?,
                _ => {
                    let force_rebuild = matches!(action, PlanAction::Rebuild | PlanAction::Recreate);
                    let outcome = build_pipeline::run(
                        adapter,
                        resolved,
                        BuildFlags { force_rebuild, pull: build_flags.pull },
                    )
                    .await?;
                    info!(image = %outcome.image_tag, "rebuilt image, recreating container");
                    create_single_container(adapter, resolved, BuildFlags::default()).await?
                }
            };
            Ok(ExecutionOutcome { container_id: Some(id) })
        }

        PlanAction::Exec | PlanAction::ExecWithWarning => {
            if matches!(action, PlanAction::ExecWithWarning) {
                warn!("environment is stale; exec'ing into it anyway");
            }
            Ok(ExecutionOutcome { container_id: primary_container_id.map(String::from) })
        }

        PlanAction::Error(message) => Err(DcxError::state("run command", "invalid", message)),
    }
}

/// Runs [`execute`], racing it against `token` so a caller (e.g. the CLI's Ctrl+C
/// handler) can stop waiting on a long `Create`/`Rebuild`/`Recreate` instead of
/// blocking until the underlying build or `compose up` subprocess exits on its own.
/// Cancellation does not kill the subprocess; it only abandons the wait, so the
/// build/compose process may keep running in the background after this returns.
pub async fn execute_cancellable(
    adapter: &dyn RuntimeAdapter,
    resolved: &ResolvedDevContainer,
    action: PlanAction,
    primary_container_id: Option<&str>,
    build_flags: BuildFlags,
    token: &CancellationToken,
) -> Result<ExecutionOutcome> {
    tokio::select! {
        result = execute(adapter, resolved, action, primary_container_id, build_flags) => result,
        _ = token.cancelled() => Err(DcxError::Cancelled),
    }
}
