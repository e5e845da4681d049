use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

mod cli;
mod commands;

#[tokio::main]
async fn main() -> Result<()> {
    dcx_core::logging::init()?;

    let token = CancellationToken::new();
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_token.cancel();
        }
    });

    let parsed = cli::Cli::parse();
    parsed.dispatch(&token).await
}
