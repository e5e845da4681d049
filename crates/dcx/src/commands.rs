use anyhow::{anyhow, Context, Result};
use dcx_core::action::{self, Command as EngineCommand, PlanAction, PlanFlags};
use dcx_core::build_pipeline::BuildFlags;
use dcx_core::config::ConfigLoader;
use dcx_core::detector::{self, ContainerState};
use dcx_core::executor;
use dcx_core::features::{self, LocalFeatureSource};
use dcx_core::labels;
use dcx_core::resolved::{self, ResolvedDevContainer};
use dcx_core::runtime_adapter::{CliRuntimeAdapter, RuntimeAdapter};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

fn discover_config_path(workspace_folder: &Path, explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let candidates = [
        workspace_folder.join(".devcontainer/devcontainer.json"),
        workspace_folder.join(".devcontainer.json"),
    ];
    candidates
        .into_iter()
        .find(|p| p.exists())
        .ok_or_else(|| anyhow!("no devcontainer.json found under {}", workspace_folder.display()))
}

/// The UID/GID to remap the container's effective user to. `nix` would give us the real
/// invoker ids on Linux; kept as an env override here since that dependency isn't otherwise
/// needed anywhere in this engine.
fn host_ids() -> (u32, u32) {
    let uid = std::env::var("DCX_HOST_UID").ok().and_then(|v| v.parse().ok()).unwrap_or(1000);
    let gid = std::env::var("DCX_HOST_GID").ok().and_then(|v| v.parse().ok()).unwrap_or(1000);
    (uid, gid)
}

async fn load_resolved(workspace_folder: &Path, config: Option<&Path>) -> Result<ResolvedDevContainer> {
    let config_path = discover_config_path(workspace_folder, config)?;
    let local_root = dcx_core::workspace::resolve_workspace_root(workspace_folder)
        .context("failed to resolve workspace root")?;
    let (host_uid, host_gid) = host_ids();

    // Feature fetching (OCI/HTTP) is out of scope; only local-path feature refs
    // resolve, via `LocalFeatureSource`. Parsing the raw config twice (here and again
    // inside `resolved::resolve`) is the cost of `resolve`'s existing contract, which
    // takes already-resolved features rather than raw JSON.
    let (raw_config, _report) = ConfigLoader::load_with_substitution(&config_path, &local_root)
        .map_err(anyhow::Error::from)?;
    let config_dir = config_path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let source = LocalFeatureSource::new(config_dir);
    let configured_features = features::resolve_configured_features(&raw_config.features, &source)
        .map_err(anyhow::Error::from)?;

    let resolved = resolved::resolve(&config_path, &local_root, configured_features, None, host_uid, host_gid)
        .map_err(anyhow::Error::from)?;
    Ok(resolved)
}

async fn detect(adapter: &dyn RuntimeAdapter, resolved: &ResolvedDevContainer) -> Result<detector::DetectionResult> {
    let mut filter = std::collections::HashMap::new();
    filter.insert(
        format!("{}.workspace.id", labels::NAMESPACE),
        resolved.id.clone(),
    );
    let containers = adapter
        .list_by_labels(&filter)
        .await
        .map_err(anyhow::Error::from)?;
    Ok(detector::detect_state(&resolved.id, &resolved.hashes.overall, &containers))
}

fn print_state(result: &detector::DetectionResult) {
    println!("state: {}", result.state);
    if let Some(primary) = &result.primary {
        println!("container: {}", primary.id);
    }
    if let Some(note) = &result.diagnostics.note {
        println!("note: {note}");
    }
}

async fn run_action(
    adapter: &dyn RuntimeAdapter,
    resolved: &ResolvedDevContainer,
    action: PlanAction,
    primary_id: Option<&str>,
    build_flags: BuildFlags,
    token: &CancellationToken,
) -> Result<()> {
    match action {
        PlanAction::Error(message) => Err(anyhow!("{message}")),
        action => {
            executor::execute_cancellable(adapter, resolved, action, primary_id, build_flags, token)
                .await
                .map_err(anyhow::Error::from)?;
            Ok(())
        }
    }
}

pub async fn up(
    workspace_folder: &Path,
    config: Option<&Path>,
    rebuild: bool,
    recreate: bool,
    build: bool,
    pull: bool,
    token: &CancellationToken,
) -> Result<()> {
    let resolved = load_resolved(workspace_folder, config).await?;
    let adapter = CliRuntimeAdapter::docker();
    let detection = detect(&adapter, &resolved).await?;

    let action = action::plan_action(detection.state, PlanFlags { rebuild, recreate });
    let build_flags = BuildFlags { force_rebuild: build, pull };
    run_action(
        &adapter,
        &resolved,
        action,
        detection.primary.as_ref().map(|p| p.id.as_str()),
        build_flags,
        token,
    )
    .await?;
    println!("up: {}", detection.state);
    Ok(())
}

pub async fn start(workspace_folder: &Path, config: Option<&Path>, token: &CancellationToken) -> Result<()> {
    let resolved = load_resolved(workspace_folder, config).await?;
    let adapter = CliRuntimeAdapter::docker();
    let detection = detect(&adapter, &resolved).await?;

    let action = action::plan_command(EngineCommand::Start, detection.state);
    run_action(
        &adapter,
        &resolved,
        action,
        detection.primary.as_ref().map(|p| p.id.as_str()),
        BuildFlags::default(),
        token,
    )
    .await
}

pub async fn stop(workspace_folder: &Path, config: Option<&Path>, token: &CancellationToken) -> Result<()> {
    let resolved = load_resolved(workspace_folder, config).await?;
    let adapter = CliRuntimeAdapter::docker();
    let detection = detect(&adapter, &resolved).await?;

    let action = action::plan_command(EngineCommand::Stop, detection.state);
    run_action(
        &adapter,
        &resolved,
        action,
        detection.primary.as_ref().map(|p| p.id.as_str()),
        BuildFlags::default(),
        token,
    )
    .await
}

pub async fn down(workspace_folder: &Path, config: Option<&Path>, token: &CancellationToken) -> Result<()> {
    let resolved = load_resolved(workspace_folder, config).await?;
    let adapter = CliRuntimeAdapter::docker();
    let detection = detect(&adapter, &resolved).await?;

    let action = action::plan_command(EngineCommand::Down, detection.state);
    run_action(
        &adapter,
        &resolved,
        action,
        detection.primary.as_ref().map(|p| p.id.as_str()),
        BuildFlags::default(),
        token,
    )
    .await
}

/// Parse a repeated `--env KEY=VAL` flag value. Entries missing `=` are rejected by clap's
/// value parser before they ever reach here (see `cli.rs`).
pub fn parse_env_pair(spec: &str) -> std::result::Result<(String, String), String> {
    spec.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("invalid --env entry '{spec}', expected KEY=VAL"))
}

#[allow(clippy::too_many_arguments)]
pub async fn exec(
    workspace_folder: &Path,
    config: Option<&Path>,
    command: Vec<String>,
    tty: bool,
    user: Option<String>,
    workdir: Option<String>,
    env: Vec<(String, String)>,
    token: &CancellationToken,
) -> Result<()> {
    let resolved = load_resolved(workspace_folder, config).await?;
    let adapter = CliRuntimeAdapter::docker();
    let detection = detect(&adapter, &resolved).await?;

    let action = action::plan_command(EngineCommand::Exec, detection.state);
    if let PlanAction::Error(message) = action {
        return Err(anyhow!("{message}"));
    }
    if matches!(action, PlanAction::ExecWithWarning) {
        eprintln!("warning: environment is stale, exec'ing into it anyway");
    }

    let container_id = detection
        .primary
        .as_ref()
        .ok_or_else(|| anyhow!("no running container to exec into"))?
        .id
        .clone();

    let request = dcx_core::exec_channel::ExecRequest {
        command,
        env: env.into_iter().collect(),
        working_dir: Some(workdir.unwrap_or_else(|| resolved.workspace_folder.clone())),
        user: user.or_else(|| resolved.remote_user.clone()),
        tty,
        stdin: dcx_core::exec_channel::StdinSource::None,
    };

    let outcome = dcx_core::exec_channel::run_exec_cancellable(&adapter, &container_id, request, token)
        .await
        .map_err(anyhow::Error::from)?;

    print!("{}", String::from_utf8_lossy(&outcome.stdout));
    eprint!("{}", String::from_utf8_lossy(&outcome.stderr));

    if outcome.exit_code != 0 {
        std::process::exit(outcome.exit_code);
    }
    Ok(())
}

pub async fn status(workspace_folder: &Path, config: Option<&Path>) -> Result<()> {
    let resolved = load_resolved(workspace_folder, config).await?;
    let adapter = CliRuntimeAdapter::docker();
    let detection = detect(&adapter, &resolved).await?;
    print_state(&detection);
    Ok(())
}
