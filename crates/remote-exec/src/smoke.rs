use std::path::Path;

use anyhow::Context;
use remote_client::RemoteClient;
use tracing::info;

use crate::engine::RemoteEngine;
use crate::options::{GitOptions, RunOptions};

const DRY_RUN_ENV: &str = "RIGGER_DRY_RUN=1\n";
/// TEST-NET-3 address and a token no cluster will accept.
const DRY_RUN_JOIN_ENV: &str = "RIGGER_DRY_RUN=1\nRIGGER_JOIN_SERVER=https://203.0.113.10:6443\nRIGGER_JOIN_TOKEN=K10smoke::server:dummy-token\n";

const STEPS: &[(&str, &str)] = &[
    ("doctor", DRY_RUN_ENV),
    ("init", DRY_RUN_ENV),
    ("join", DRY_RUN_JOIN_ENV),
    ("status", DRY_RUN_ENV),
];

pub(crate) async fn smoke(
    engine: &RemoteEngine,
    client: &dyn RemoteClient,
    project_root: &Path,
    git: &GitOptions,
) -> anyhow::Result<()> {
    engine.build_and_upload(client, project_root, git).await?;

    let scratch = tempfile::Builder::new()
        .prefix("rigger-smoke-")
        .tempdir()
        .context("failed to create smoke directory")?;
    for &(subcommand, env) in STEPS {
        let env_file = scratch.path().join(format!("{subcommand}.env"));
        std::fs::write(&env_file, env)
            .with_context(|| format!("failed to write {}", env_file.display()))?;
        let opts = RunOptions {
            env_file: Some(env_file),
            ..RunOptions::default()
        };
        info!(event = "remote.smoke.step", target = %client.target().destination(), subcommand, "smoke step");
        engine
            .run(client, &opts, subcommand)
            .await
            .with_context(|| format!("smoke step `{subcommand}` failed"))?;
    }
    info!(event = "remote.smoke.done", target = %client.target().destination(), "smoke passed");
    Ok(())
}
