use std::path::Path;

use system_utils::{CommandOutput, CommandSpec, ProcessLauncher};

use crate::identity::TunnelIdentity;

const SERVER_ALIVE_INTERVAL_SECS: u64 = 30;
const SERVER_ALIVE_COUNT_MAX: u32 = 3;

/// The connection-shared master that owns the `-L` forward.
pub(crate) fn master_command(
    identity: &TunnelIdentity,
    control_path: &Path,
    connection_options: &[String],
    forward: &str,
) -> CommandSpec {
    CommandSpec::new("ssh")
        .arg("-N")
        .arg("-M")
        .arg("-S")
        .arg(control_path.to_string_lossy().to_string())
        .args([
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-o".to_string(),
            format!("ServerAliveInterval={SERVER_ALIVE_INTERVAL_SECS}"),
            "-o".to_string(),
            format!("ServerAliveCountMax={SERVER_ALIVE_COUNT_MAX}"),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ])
        .args(connection_options.iter().cloned())
        .arg("-L")
        .arg(forward)
        .arg(identity.destination())
}

pub(crate) async fn check_master(
    launcher: &dyn ProcessLauncher,
    identity: &TunnelIdentity,
    control_path: &Path,
) -> anyhow::Result<CommandOutput> {
    launcher
        .output(&control_command("check", identity, control_path))
        .await
}

pub(crate) async fn exit_master(
    launcher: &dyn ProcessLauncher,
    identity: &TunnelIdentity,
    control_path: &Path,
) -> anyhow::Result<()> {
    let output = launcher
        .output(&control_command("exit", identity, control_path))
        .await?;
    if !output.is_success() {
        anyhow::bail!("ssh -O exit failed: {}", output.detail());
    }
    Ok(())
}

fn control_command(op: &str, identity: &TunnelIdentity, control_path: &Path) -> CommandSpec {
    CommandSpec::new("ssh")
        .arg("-S")
        .arg(control_path.to_string_lossy().to_string())
        .arg("-O")
        .arg(op)
        .arg(identity.destination())
}
