use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::commands;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version,
    about = "Lifecycle and state-reconciliation engine for development containers",
    long_about = "Reconciles a workspace's devcontainer.json against whatever container state is\nalready running, entirely from labels on the containers themselves — no local\nstate files."
)]
pub struct Cli {
    /// Path to the workspace root; defaults to the current directory.
    #[arg(long, global = true)]
    pub workspace_folder: Option<PathBuf>,

    /// Path to devcontainer.json; defaults to `<workspace>/.devcontainer/devcontainer.json`.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bring the environment up: create it if absent, start it if stopped, recreate it if stale.
    Up {
        /// Force the image-build stage even if its tag already exists.
        #[arg(long)]
        build: bool,
        /// Force the features/UID layers to rebuild even if their tags already exist.
        #[arg(long)]
        rebuild: bool,
        /// Force the base image to be pulled even if present locally.
        #[arg(long)]
        pull: bool,
        /// Discard the existing container and recreate it from scratch.
        #[arg(long)]
        recreate: bool,
    },
    /// Start an existing, stopped environment. Errors if none exists or it's stale.
    Start,
    /// Stop the running environment without removing it.
    Stop,
    /// Stop and remove the environment.
    Down,
    /// Run a command inside the running container and propagate its exit code.
    Exec {
        /// User to run the command as; defaults to the configured remote user.
        #[arg(long)]
        user: Option<String>,
        /// Working directory for the command; defaults to the workspace folder.
        #[arg(long)]
        workdir: Option<String>,
        /// Additional environment variable, as KEY=VAL. May be repeated.
        #[arg(long = "env", value_parser = commands::parse_env_pair)]
        env: Vec<(String, String)>,
        /// Command and arguments to run.
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Open an interactive shell inside the running container.
    Shell {
        /// User to run the shell as; defaults to the configured remote user.
        #[arg(long)]
        user: Option<String>,
        /// Working directory for the shell; defaults to the workspace folder.
        #[arg(long)]
        workdir: Option<String>,
        /// Additional environment variable, as KEY=VAL. May be repeated.
        #[arg(long = "env", value_parser = commands::parse_env_pair)]
        env: Vec<(String, String)>,
    },
    /// Print the detected state of the environment without changing anything.
    Status,
}

impl Cli {
    pub async fn dispatch(self, token: &CancellationToken) -> Result<()> {
        let workspace_folder = self
            .workspace_folder
            .unwrap_or(std::env::current_dir()?);

        match self.command {
            Commands::Up { build, rebuild, pull, recreate } => {
                commands::up(&workspace_folder, self.config.as_deref(), rebuild, recreate, build, pull, token).await
            }
            Commands::Start => commands::start(&workspace_folder, self.config.as_deref(), token).await,
            Commands::Stop => commands::stop(&workspace_folder, self.config.as_deref(), token).await,
            Commands::Down => commands::down(&workspace_folder, self.config.as_deref(), token).await,
            Commands::Exec { user, workdir, env, command } => {
                commands::exec(&workspace_folder, self.config.as_deref(), command, false, user, workdir, env, token)
                    .await
            }
            Commands::Shell { user, workdir, env } => {
                commands::exec(
                    &workspace_folder,
                    self.config.as_deref(),
                    vec!["/bin/bash".to_string()],
                    true,
                    user,
                    workdir,
                    env,
                    token,
                )
                .await
            }
            Commands::Status => commands::status(&workspace_folder, self.config.as_deref()).await,
        }
    }
}
