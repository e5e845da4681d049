//! Runtime adapter: the capability surface the rest of the core is built against
//!
//! A single concrete implementation, [`CliRuntimeAdapter`], shells out to the `docker`
//! (or `podman`) CLI for every operation. The trait boundary exists so tests can swap in
//! [`FakeRuntimeAdapter`] instead of driving a real daemon.

use crate::errors::{DcxError, Result};
use crate::retry::{retry_async, RetryConfig, RetryDecision};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, instrument};

/// Daemon identity/capacity info used for diagnostics and resource-aware scheduling.
#[derive(Debug, Clone, Default)]
pub struct DaemonInfo {
    pub ncpu: u64,
    pub mem_total: u64,
    pub os_type: String,
    pub arch: String,
}

/// A container summary as returned by a label-filtered list.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub state: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
}

/// Full container inspection detail.
#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: String,
    pub mounts: Vec<String>,
    pub working_dir: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerCreateOptions {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub mounts: Vec<String>,
    pub ports: Vec<String>,
    pub cap_add: Vec<String>,
    pub security_opt: Vec<String>,
    pub privileged: bool,
    pub init: bool,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub run_args: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub context: String,
    pub dockerfile: String,
    pub tag: String,
    pub build_args: HashMap<String, String>,
    pub target: Option<String>,
    pub cache_from: Vec<String>,
    pub ssh_forward: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub tty: bool,
    pub stdin: Option<Vec<u8>>,
}

/// Result of a non-tty exec: exit code plus demultiplexed stdout/stderr.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// The capability surface the rest of the core is built against. Abstracts over the daemon's
/// native API and the CLI subprocess; `CliRuntimeAdapter` uses the CLI for everything since
/// that's the only interface guaranteed available across Docker and Podman alike.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    async fn ping(&self) -> Result<()>;
    async fn info(&self) -> Result<DaemonInfo>;
    async fn list_by_labels(&self, labels: &HashMap<String, String>) -> Result<Vec<ContainerSummary>>;
    async fn inspect(&self, id: &str) -> Result<ContainerDetails>;
    async fn image_exists(&self, reference: &str) -> Result<bool>;
    async fn image_pull(&self, reference: &str) -> Result<()>;
    async fn image_build(&self, opts: &BuildOptions) -> Result<String>;
    async fn container_create(&self, opts: &ContainerCreateOptions) -> Result<String>;
    async fn container_start(&self, id: &str) -> Result<()>;
    async fn container_stop(&self, id: &str) -> Result<()>;
    async fn container_remove(&self, id: &str, force: bool) -> Result<()>;
    async fn container_kill(&self, id: &str) -> Result<()>;
    async fn exec(&self, id: &str, cfg: &ExecOptions) -> Result<ExecResult>;
    async fn compose_run(&self, args: &[String], cwd: &str) -> Result<i32>;
}

/// Which CLI binary to drive. Docker and Podman share a CLI surface close enough that
/// only the program name differs for the operations this engine needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeBinary {
    Docker,
    Podman,
}

impl RuntimeBinary {
    fn program(&self) -> &'static str {
        match self {
            RuntimeBinary::Docker => "docker",
            RuntimeBinary::Podman => "podman",
        }
    }
}

/// A missing tag/manifest or a bad reference won't start succeeding on retry; only
/// transient registry/network failures are worth spending the backoff budget on.
fn classify_pull_error(error: &DcxError) -> RetryDecision {
    let message = error.to_string();
    if message.contains("manifest unknown")
        || message.contains("not found")
        || message.contains("denied")
        || message.contains("unauthorized")
    {
        RetryDecision::Stop
    } else {
        RetryDecision::Retry
    }
}

/// CLI-subprocess implementation of [`RuntimeAdapter`].
pub struct CliRuntimeAdapter {
    binary: RuntimeBinary,
}

impl CliRuntimeAdapter {
    pub fn new(binary: RuntimeBinary) -> Self {
        Self { binary }
    }

    pub fn docker() -> Self {
        Self::new(RuntimeBinary::Docker)
    }

    #[instrument(skip(self, args), fields(program = self.binary.program()))]
    async fn run_capturing(&self, args: &[&str]) -> Result<String> {
        debug!("running {} {:?}", self.binary.program(), args);
        let output = Command::new(self.binary.program())
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DcxError::runtime(format!("failed to execute {}: {e}", self.binary.program())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DcxError::runtime(format!(
                "{} {:?} failed: {}",
                self.binary.program(),
                args,
                stderr.trim()
            )));
        }

        String::from_utf8(output.stdout)
            .map_err(|e| DcxError::runtime(format!("non-utf8 output from {}: {e}", self.binary.program())))
    }
}

#[async_trait]
impl RuntimeAdapter for CliRuntimeAdapter {
    async fn ping(&self) -> Result<()> {
        self.run_capturing(&["info", "--format", "{{.ServerVersion}}"])
            .await
            .map(|_| ())
    }

    async fn info(&self) -> Result<DaemonInfo> {
        let raw = self
            .run_capturing(&[
                "info",
                "--format",
                "{{.NCPU}}|{{.MemTotal}}|{{.OSType}}|{{.Architecture}}",
            ])
            .await?;
        let parts: Vec<&str> = raw.trim().split('|').collect();
        if parts.len() != 4 {
            return Err(DcxError::runtime("unexpected `docker info` format output"));
        }
        Ok(DaemonInfo {
            ncpu: parts[0].parse().unwrap_or(0),
            mem_total: parts[1].parse().unwrap_or(0),
            os_type: parts[2].to_string(),
            arch: parts[3].to_string(),
        })
    }

    async fn list_by_labels(&self, labels: &HashMap<String, String>) -> Result<Vec<ContainerSummary>> {
        let mut args: Vec<String> = vec!["ps".into(), "-a".into(), "--format".into(), "{{json .}}".into()];
        for (k, v) in labels {
            args.push("--filter".into());
            args.push(format!("label={k}={v}"));
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run_capturing(&arg_refs).await?;

        let mut summaries = Vec::new();
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            let value: serde_json::Value = serde_json::from_str(line)
                .map_err(|e| DcxError::runtime(format!("failed to parse container listing: {e}")))?;
            let id = value["ID"].as_str().unwrap_or_default().to_string();
            let name = value["Names"].as_str().unwrap_or_default().to_string();
            let state = value["State"].as_str().unwrap_or_default().to_string();
            let running = state == "running";
            let details = self.inspect(&id).await?;
            summaries.push(ContainerSummary {
                id,
                name,
                state,
                running,
                labels: details.labels,
            });
        }
        Ok(summaries)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails> {
        let raw = self
            .run_capturing(&["inspect", id])
            .await
            .map_err(|_| DcxError::runtime(format!("container not found: {id}")))?;
        let parsed: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| DcxError::runtime(format!("failed to parse inspect output: {e}")))?;
        let entry = parsed
            .get(0)
            .ok_or_else(|| DcxError::runtime(format!("container not found: {id}")))?;

        let labels = entry["Config"]["Labels"]
            .as_object()
            .map(|m| {
                m.iter()
                    .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                    .collect()
            })
            .unwrap_or_default();
        let mounts = entry["Mounts"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["Destination"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        let working_dir = entry["Config"]["WorkingDir"].as_str().unwrap_or_default().to_string();
        let running = entry["State"]["Running"].as_bool().unwrap_or(false);

        Ok(ContainerDetails {
            id: id.to_string(),
            mounts,
            working_dir,
            labels,
            running,
        })
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        Ok(self.run_capturing(&["image", "inspect", reference]).await.is_ok())
    }

    async fn image_pull(&self, reference: &str) -> Result<()> {
        let config = RetryConfig::default();
        retry_async(
            &config,
            || async { self.run_capturing(&["pull", reference]).await.map(|_| ()) },
            classify_pull_error,
        )
        .await
    }

    async fn image_build(&self, opts: &BuildOptions) -> Result<String> {
        let mut args: Vec<String> = vec![
            "build".into(),
            "-t".into(),
            opts.tag.clone(),
            "-f".into(),
            opts.dockerfile.clone(),
        ];
        for (k, v) in &opts.build_args {
            args.push("--build-arg".into());
            args.push(format!("{k}={v}"));
        }
        if let Some(target) = &opts.target {
            args.push("--target".into());
            args.push(target.clone());
        }
        for cache in &opts.cache_from {
            args.push("--cache-from".into());
            args.push(cache.clone());
        }
        if opts.ssh_forward && std::env::var_os("SSH_AUTH_SOCK").is_some() {
            args.push("--ssh".into());
            args.push("default".into());
        }
        args.push(opts.context.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_capturing(&arg_refs)
            .await
            .map_err(|e| DcxError::build(e.to_string()))?;
        Ok(opts.tag.clone())
    }

    async fn container_create(&self, opts: &ContainerCreateOptions) -> Result<String> {
        let mut args: Vec<String> = vec!["create".into(), "--name".into(), opts.name.clone()];
        for (k, v) in &opts.labels {
            args.push("--label".into());
            args.push(format!("{k}={v}"));
        }
        for (k, v) in &opts.env {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        }
        for mount in &opts.mounts {
            args.push("--mount".into());
            args.push(mount.clone());
        }
        for port in &opts.ports {
            args.push("-p".into());
            args.push(port.clone());
        }
        for cap in &opts.cap_add {
            args.push("--cap-add".into());
            args.push(cap.clone());
        }
        for sec in &opts.security_opt {
            args.push("--security-opt".into());
            args.push(sec.clone());
        }
        if opts.privileged {
            args.push("--privileged".into());
        }
        if opts.init {
            args.push("--init".into());
        }
        if let Some(entrypoint) = &opts.entrypoint {
            args.push("--entrypoint".into());
            args.push(entrypoint.join(" "));
        }
        args.extend(opts.run_args.iter().cloned());
        args.push(opts.image.clone());
        if let Some(cmd) = &opts.cmd {
            args.extend(cmd.iter().cloned());
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run_capturing(&arg_refs).await.map_err(|e| {
            if e.to_string().contains("Conflict") || e.to_string().contains("already in use") {
                DcxError::runtime(format!("container name {} collides with an existing container", opts.name))
            } else {
                e
            }
        })?;
        Ok(output.trim().to_string())
    }

    async fn container_start(&self, id: &str) -> Result<()> {
        self.run_capturing(&["start", id]).await.map(|_| ())
    }

    async fn container_stop(&self, id: &str) -> Result<()> {
        self.run_capturing(&["stop", id]).await.map(|_| ())
    }

    async fn container_remove(&self, id: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(id);
        match self.run_capturing(&args).await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("No such container") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn container_kill(&self, id: &str) -> Result<()> {
        self.run_capturing(&["kill", id]).await.map(|_| ())
    }

    async fn exec(&self, id: &str, cfg: &ExecOptions) -> Result<ExecResult> {
        let mut args: Vec<String> = vec!["exec".into()];
        if cfg.tty {
            args.push("-it".into());
        } else {
            args.push("-i".into());
        }
        for (k, v) in &cfg.env {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        }
        if let Some(dir) = &cfg.working_dir {
            args.push("-w".into());
            args.push(dir.clone());
        }
        if let Some(user) = &cfg.user {
            args.push("-u".into());
            args.push(user.clone());
        }
        args.push(id.to_string());
        args.extend(cfg.command.iter().cloned());

        let mut command = Command::new(self.binary.program());
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| DcxError::runtime(format!("failed to spawn exec: {e}")))?;

        if let Some(input) = &cfg.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input)
                    .await
                    .map_err(|e| DcxError::runtime(format!("failed to write exec stdin: {e}")))?;
            }
        }
        drop(child.stdin.take());

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(mut out) = child.stdout.take() {
            out.read_to_end(&mut stdout)
                .await
                .map_err(|e| DcxError::runtime(format!("failed to read exec stdout: {e}")))?;
        }
        if let Some(mut err) = child.stderr.take() {
            err.read_to_end(&mut stderr)
                .await
                .map_err(|e| DcxError::runtime(format!("failed to read exec stderr: {e}")))?;
        }

        let status = child
            .wait()
            .await
            .map_err(|e| DcxError::runtime(format!("failed to wait on exec: {e}")))?;

        Ok(ExecResult {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    // Not retried: `compose_run` drives build/up/down/exec alike with inherited
    // stdio, and blindly re-running an `up` or `down` after a partial failure
    // risks duplicating side effects that a re-pull does not have.
    async fn compose_run(&self, args: &[String], cwd: &str) -> Result<i32> {
        let mut command = Command::new(self.binary.program());
        command
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let status = command
            .status()
            .await
            .map_err(|e| DcxError::runtime(format!("failed to invoke compose: {e}")))?;

        Ok(status.code().unwrap_or(-1))
    }
}

/// Deterministic in-memory adapter for unit and scenario tests.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct FakeContainer {
        pub id: String,
        pub name: String,
        pub image: String,
        pub labels: HashMap<String, String>,
        pub running: bool,
    }

    #[derive(Default)]
    pub struct FakeRuntimeAdapter {
        pub containers: Mutex<Vec<FakeContainer>>,
        pub images: Mutex<std::collections::HashSet<String>>,
        pub next_id: Mutex<u64>,
    }

    impl FakeRuntimeAdapter {
        pub fn new() -> Self {
            Self::default()
        }

        fn alloc_id(&self) -> String {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            format!("fake{}", *next)
        }
    }

    #[async_trait]
    impl RuntimeAdapter for FakeRuntimeAdapter {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn info(&self) -> Result<DaemonInfo> {
            Ok(DaemonInfo {
                ncpu: 4,
                mem_total: 8_000_000_000,
                os_type: "linux".into(),
                arch: "x86_64".into(),
            })
        }

        async fn list_by_labels(&self, labels: &HashMap<String, String>) -> Result<Vec<ContainerSummary>> {
            let containers = self.containers.lock().unwrap();
            Ok(containers
                .iter()
                .filter(|c| labels.iter().all(|(k, v)| c.labels.get(k) == Some(v)))
                .map(|c| ContainerSummary {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    state: if c.running { "running".into() } else { "exited".into() },
                    running: c.running,
                    labels: c.labels.clone(),
                })
                .collect())
        }

        async fn inspect(&self, id: &str) -> Result<ContainerDetails> {
            let containers = self.containers.lock().unwrap();
            let container = containers
                .iter()
                .find(|c| c.id == id)
                .ok_or_else(|| DcxError::runtime(format!("container not found: {id}")))?;
            Ok(ContainerDetails {
                id: container.id.clone(),
                mounts: vec![],
                working_dir: "/workspace".into(),
                labels: container.labels.clone(),
                running: container.running,
            })
        }

        async fn image_exists(&self, reference: &str) -> Result<bool> {
            Ok(self.images.lock().unwrap().contains(reference))
        }

        async fn image_pull(&self, reference: &str) -> Result<()> {
            self.images.lock().unwrap().insert(reference.to_string());
            Ok(())
        }

        async fn image_build(&self, opts: &BuildOptions) -> Result<String> {
            self.images.lock().unwrap().insert(opts.tag.clone());
            Ok(opts.tag.clone())
        }

        async fn container_create(&self, opts: &ContainerCreateOptions) -> Result<String> {
            let mut containers = self.containers.lock().unwrap();
            if containers.iter().any(|c| c.name == opts.name) {
                return Err(DcxError::runtime(format!(
                    "container name {} collides with an existing container",
                    opts.name
                )));
            }
            let id = self.alloc_id();
            containers.push(FakeContainer {
                id: id.clone(),
                name: opts.name.clone(),
                image: opts.image.clone(),
                labels: opts.labels.clone(),
                running: false,
            });
            Ok(id)
        }

        async fn container_start(&self, id: &str) -> Result<()> {
            let mut containers = self.containers.lock().unwrap();
            let container = containers
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| DcxError::runtime(format!("container not found: {id}")))?;
            container.running = true;
            Ok(())
        }

        async fn container_stop(&self, id: &str) -> Result<()> {
            let mut containers = self.containers.lock().unwrap();
            if let Some(container) = containers.iter_mut().find(|c| c.id == id) {
                container.running = false;
            }
            Ok(())
        }

        async fn container_remove(&self, id: &str, _force: bool) -> Result<()> {
            self.containers.lock().unwrap().retain(|c| c.id != id);
            Ok(())
        }

        async fn container_kill(&self, id: &str) -> Result<()> {
            self.container_stop(id).await
        }

        async fn exec(&self, id: &str, cfg: &ExecOptions) -> Result<ExecResult> {
            let containers = self.containers.lock().unwrap();
            let container = containers
                .iter()
                .find(|c| c.id == id)
                .ok_or_else(|| DcxError::runtime(format!("container not found: {id}")))?;
            if !container.running {
                return Err(DcxError::runtime("cannot exec into a non-running container"));
            }
            Ok(ExecResult {
                exit_code: 0,
                stdout: format!("ran: {}", cfg.command.join(" ")).into_bytes(),
                stderr: Vec::new(),
            })
        }

        async fn compose_run(&self, args: &[String], _cwd: &str) -> Result<i32> {
            // `compose build` only produces an image; only `compose up` actually starts a
            // service, so only simulate container creation for the latter.
            let Some(up_idx) = args.iter().position(|a| a == "up") else {
                return Ok(0);
            };

            // Simulate what `docker compose up <service> [run_services...]` would do: apply
            // the dcx-generated label override (passed as a `-f <path>`) to a container named
            // after the primary service, the first positional argument following `up`.
            let override_path = args
                .windows(2)
                .filter(|w| w[0] == "-f")
                .map(|w| w[1].clone())
                .last();
            let service = args[up_idx + 1..]
                .iter()
                .find(|a| !a.starts_with('-'))
                .cloned()
                .unwrap_or_default();

            if let Some(path) = override_path {
                if let Ok(contents) = std::fs::read_to_string(&path) {
                    let labels = parse_label_override(&contents);
                    let id = self.alloc_id();
                    let mut containers = self.containers.lock().unwrap();
                    if let Some(existing) = containers.iter_mut().find(|c| c.name == service) {
                        existing.labels = labels;
                        existing.running = true;
                    } else {
                        containers.push(FakeContainer {
                            id,
                            name: service,
                            image: String::new(),
                            labels,
                            running: true,
                        });
                    }
                }
            }
            Ok(0)
        }
    }

    /// Parses the `services.<name>.labels` block out of a generated label-override YAML file.
    /// Only understands the flat, single-service shape `executor::render_compose_override`
    /// produces — not a general YAML parser.
    fn parse_label_override(yaml: &str) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        let mut in_labels = false;
        for line in yaml.lines() {
            if line.trim() == "labels:" {
                in_labels = true;
                continue;
            }
            if in_labels {
                if !line.starts_with("      ") {
                    break;
                }
                if let Some((k, v)) = line.trim().split_once(": ") {
                    labels.insert(k.trim().to_string(), v.trim().trim_matches('"').to_string());
                }
            }
        }
        labels
    }
}
