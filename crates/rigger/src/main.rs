mod cli;
mod commands;
mod config;
mod node;

use crate::cli::Args;
use crate::config::load_config;
use clap::Parser;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    init_tracing()?;

    let (config, config_path) = load_config(args.config.as_deref())?;
    if let Some(path) = config_path.as_ref() {
        tracing::debug!(path = %path.display(), "loaded config");
    }
    let context = commands::Context::new(args.target, config, config_path);
    commands::dispatch(&context, args.command).await
}

/// Logs go to stderr so command output on stdout stays scriptable.
fn init_tracing() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))?;
    Ok(())
}
