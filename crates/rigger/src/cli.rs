use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "rigger",
    version,
    about = "Bootstrap and operate a remote cluster over SSH"
)]
pub(crate) struct Args {
    #[command(flatten)]
    pub(crate) target: TargetArgs,
    /// Defaults to ~/.config/rigger/config.toml when present.
    #[arg(long, env = "RIGGER_CONFIG", global = true)]
    pub(crate) config: Option<PathBuf>,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(clap::Args, Debug, Default)]
pub(crate) struct TargetArgs {
    #[arg(long, env = "RIGGER_HOST", global = true)]
    pub(crate) host: Option<String>,
    #[arg(long, env = "RIGGER_USER", global = true)]
    pub(crate) user: Option<String>,
    /// Private key; ~/.ssh/id_ed25519 or ~/.ssh/id_rsa when omitted.
    #[arg(long, env = "RIGGER_IDENTITY", global = true)]
    pub(crate) identity: Option<String>,
    #[arg(long, global = true)]
    pub(crate) repo_url: Option<String>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Install your key, create the deploy user and clone the repository.
    Provision,
    #[command(subcommand)]
    Remote(RemoteCommand),
    #[command(subcommand)]
    Tunnel(TunnelCommand),
    #[command(subcommand)]
    PortForward(PortForwardCommand),
    /// On the node: bootstrap the first control-plane server.
    Init(NodeArgs),
    /// On the node: join an existing cluster.
    Join(JoinArgs),
    /// On the node: report cluster health.
    Status(NodeArgs),
    /// On the node: check prerequisites without changing anything.
    Doctor(NodeArgs),
    /// On the node: tear the cluster install down.
    Reset(NodeArgs),
    /// On the node: upgrade the installed cluster.
    Upgrade(NodeArgs),
}

/// Shared by the node commands. `RIGGER_DRY_RUN=1` works like `--dry-run`.
#[derive(clap::Args, Debug, Default)]
pub(crate) struct NodeArgs {
    #[arg(long)]
    pub(crate) dry_run: bool,
    /// Passed to the bootstrap script unchanged.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub(crate) args: Vec<String>,
}

#[derive(clap::Args, Debug, Default)]
pub(crate) struct JoinArgs {
    /// e.g. https://10.0.0.1:6443
    #[arg(long, env = "RIGGER_JOIN_SERVER")]
    pub(crate) server: Option<String>,
    #[arg(long, env = "RIGGER_JOIN_TOKEN", hide_env_values = true)]
    pub(crate) token: Option<String>,
    #[command(flatten)]
    pub(crate) node: NodeArgs,
}

#[derive(Subcommand, Debug)]
pub(crate) enum RemoteCommand {
    /// Cross-build the binary for the host and install it.
    Build(BuildArgs),
    /// Fetch and check out the requested revision in the remote repository.
    Sync(GitArgs),
    /// Run a subcommand of the installed binary as root.
    Run(RunArgs),
    /// Build, install and dry-run doctor/init/join/status.
    Smoke(BuildArgs),
}

#[derive(clap::Args, Debug, Default)]
pub(crate) struct GitArgs {
    #[arg(long)]
    pub(crate) branch: Option<String>,
    /// Commit or tag; wins over --branch.
    #[arg(long = "ref")]
    pub(crate) git_ref: Option<String>,
    #[arg(long, overrides_with = "no_pull")]
    pub(crate) pull: bool,
    #[arg(long, overrides_with = "pull")]
    pub(crate) no_pull: bool,
}

impl GitArgs {
    pub(crate) fn pull(&self) -> Option<bool> {
        match (self.pull, self.no_pull) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}

#[derive(clap::Args, Debug)]
pub(crate) struct BuildArgs {
    #[arg(long, default_value = ".")]
    pub(crate) project_root: PathBuf,
    #[command(flatten)]
    pub(crate) git: GitArgs,
}

#[derive(clap::Args, Debug)]
pub(crate) struct RunArgs {
    /// One of init, join, status, doctor, reset, upgrade.
    pub(crate) subcommand: String,
    #[arg(long)]
    pub(crate) tty: bool,
    #[arg(long)]
    pub(crate) env_file: Option<PathBuf>,
    #[command(flatten)]
    pub(crate) git: GitArgs,
    /// Passed to the remote subcommand unchanged.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub(crate) args: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum TunnelCommand {
    Start(TunnelArgs),
    Stop(TunnelArgs),
    /// Exits 1 when the tunnel is not running.
    Status(TunnelArgs),
}

#[derive(clap::Args, Debug)]
pub(crate) struct TunnelArgs {
    #[arg(long)]
    pub(crate) local_port: Option<u16>,
    #[arg(long)]
    pub(crate) remote_port: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum PortForwardCommand {
    Start(PortForwardStartArgs),
    Stop(PortForwardArgs),
    /// Exits 1 when the port-forward is not running.
    Status(PortForwardArgs),
    /// Wait until the local port accepts connections.
    Wait(PortForwardWaitArgs),
    Logs(PortForwardLogsArgs),
}

#[derive(clap::Args, Debug)]
pub(crate) struct PortForwardArgs {
    #[arg(long, short = 'n')]
    pub(crate) namespace: Option<String>,
    #[arg(long)]
    pub(crate) local_port: Option<u16>,
}

#[derive(clap::Args, Debug)]
pub(crate) struct PortForwardStartArgs {
    #[command(flatten)]
    pub(crate) forward: PortForwardArgs,
    /// e.g. svc/web
    #[arg(long)]
    pub(crate) resource: Option<String>,
    #[arg(long)]
    pub(crate) remote_port: Option<u16>,
    /// Also wait for the port to accept connections, e.g. `30s`.
    #[arg(long)]
    pub(crate) wait: Option<humantime::Duration>,
}

#[derive(clap::Args, Debug)]
pub(crate) struct PortForwardWaitArgs {
    #[command(flatten)]
    pub(crate) forward: PortForwardArgs,
    #[arg(long, default_value = "30s")]
    pub(crate) timeout: humantime::Duration,
}

#[derive(clap::Args, Debug)]
pub(crate) struct PortForwardLogsArgs {
    #[command(flatten)]
    pub(crate) forward: PortForwardArgs,
    #[arg(long, default_value_t = 50)]
    pub(crate) lines: usize,
}
