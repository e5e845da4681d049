//! Error taxonomy for the lifecycle and state-reconciliation engine
//!
//! Kinds, not types: each variant below corresponds to one of the error
//! kinds in the design (configuration, state, runtime, build, broken,
//! cancellation, internal). State errors carry a recovery hint so the CLI
//! can print it without re-deriving it from the detected state.

use thiserror::Error;

/// Domain errors produced by the core engine.
#[derive(Error, Debug)]
pub enum DcxError {
    /// Unresolvable reference, missing compose service, invalid mount spec.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Operation disallowed in the current detected state (e.g. `start` while `STALE`).
    #[error("cannot {operation} while environment is {state}: {recovery_hint}")]
    State {
        operation: String,
        state: String,
        recovery_hint: String,
    },

    /// Daemon unreachable, image-pull failure, name collision, exec attach failure.
    #[error("runtime error: {message}")]
    Runtime { message: String },

    /// Non-zero exit from a Dockerfile build or a feature's install.sh.
    #[error("build failed: {message}")]
    Build { message: String },

    /// Zero or multiple primaries for a workspace id.
    #[error("environment is broken: {message}")]
    Broken { message: String },

    /// The operation's cancellation token was tripped.
    #[error("operation cancelled")]
    Cancelled,

    /// An invariant was violated; not a user error.
    #[error("internal error: {message}")]
    Internal { message: String },

    /// I/O failure reading configuration or workspace files.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl DcxError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn state(
        operation: impl Into<String>,
        state: impl Into<String>,
        recovery_hint: impl Into<String>,
    ) -> Self {
        Self::State {
            operation: operation.into(),
            state: state.into(),
            recovery_hint: recovery_hint.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    pub fn build(message: impl Into<String>) -> Self {
        Self::Build {
            message: message.into(),
        }
    }

    pub fn broken(message: impl Into<String>) -> Self {
        Self::Broken {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for the runtime errors the adapter boundary is allowed to retry once
    /// (transient, idempotent list calls only — see retry.rs).
    pub fn is_transient_runtime(&self) -> bool {
        matches!(self, Self::Runtime { .. })
    }
}

/// Convenience alias for Results with [`DcxError`].
pub type Result<T> = std::result::Result<T, DcxError>;
