//! Exec channel: the wire contract for running commands inside a container
//!
//! Two modes. TTY mode forwards raw bytes straight through to the terminal (used by
//! `shell`); non-tty mode demultiplexes stdout/stderr and propagates the real exit code
//! (used by `exec` when scripted or piped). Both are backed by the same CLI subprocess the
//! rest of the runtime adapter uses.

use crate::errors::{DcxError, Result};
use crate::runtime_adapter::{ExecOptions, ExecResult, RuntimeAdapter};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Where stdin comes from for a non-interactive exec.
#[derive(Debug, Clone)]
pub enum StdinSource {
    /// No input; stdin is closed immediately (EOF) after connecting.
    None,
    /// A fixed buffer, written then closed (EOF) — used for scripted/piped exec.
    Bytes(Vec<u8>),
}

/// A single exec invocation's parameters, independent of the runtime-adapter wire format.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub tty: bool,
    pub stdin: StdinSource,
}

/// Outcome of a completed exec: demultiplexed output (empty for tty mode, where the
/// adapter forwards bytes directly to the terminal instead of buffering them) and the
/// real process exit code. A non-zero exit code here is not itself a `DcxError` — only
/// adapter/daemon failures are; the caller decides what to do with the exit code (e.g.
/// the CLI process exits with it).
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Run an exec request against a running container. Returns `Err` only for runtime errors
/// distinct from the command's own exit status (daemon unreachable, container not found,
/// spawn failure) — a non-zero exit from the executed command surfaces as `Ok` with that
/// exit code set.
#[instrument(skip(adapter, request))]
pub async fn run_exec(
    adapter: &dyn RuntimeAdapter,
    container_id: &str,
    request: ExecRequest,
) -> Result<ExecOutcome> {
    if request.tty && matches!(request.stdin, StdinSource::Bytes(_)) {
        return Err(DcxError::internal(
            "tty exec does not accept a fixed stdin buffer; it forwards the terminal directly",
        ));
    }

    let stdin = match request.stdin {
        StdinSource::None => None,
        StdinSource::Bytes(bytes) => Some(bytes),
    };

    let cfg = ExecOptions {
        command: request.command,
        env: request.env,
        working_dir: request.working_dir,
        user: request.user,
        tty: request.tty,
        stdin,
    };

    let ExecResult { exit_code, stdout, stderr } = adapter.exec(container_id, &cfg).await?;

    Ok(ExecOutcome { exit_code, stdout, stderr })
}

/// Runs [`run_exec`], racing it against `token` so a caller can stop waiting on a
/// long-running exec (e.g. a `tail -f`-style command run non-interactively)
/// instead of blocking until it exits on its own.
pub async fn run_exec_cancellable(
    adapter: &dyn RuntimeAdapter,
    container_id: &str,
    request: ExecRequest,
    token: &CancellationToken,
) -> Result<ExecOutcome> {
    tokio::select! {
        result = run_exec(adapter, container_id, request) => result,
        _ = token.cancelled() => Err(DcxError::Cancelled),
    }
}
