use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use port_forward::{
    PortForwardIdentity, PortForwardManager, PortForwardSpec, PortForwardStatus, StartOutcome as ForwardStart,
    StopOutcome as ForwardStop,
};
use remote_client::{RemoteClient, SshClient, Target};
use remote_exec::{BuildOutcome, GitOptions, RemoteEngine, RunOptions};
use system_utils::path::expand_tilde;
use system_utils::{ProcessLauncher, SystemLauncher};
use tracing::info;
use tunnel_manager::{
    StartOutcome as TunnelStart, StopOutcome as TunnelStop, TunnelIdentity, TunnelManager, TunnelSpec,
    TunnelStatus, DEFAULT_REMOTE_PORT,
};

use crate::cli::{
    BuildArgs, Command, GitArgs, JoinArgs, NodeArgs, PortForwardArgs, PortForwardCommand, RemoteCommand, RunArgs,
    TargetArgs, TunnelArgs, TunnelCommand,
};
use crate::config::RiggerConfig;
use crate::node::{self, JoinCredentials, NodeAction, NodeRequest};

const DEFAULT_NAMESPACE: &str = "default";

pub(crate) struct Context {
    target_args: TargetArgs,
    config: RiggerConfig,
    config_path: Option<PathBuf>,
    launcher: Arc<dyn ProcessLauncher>,
}

impl Context {
    pub(crate) fn new(target_args: TargetArgs, config: RiggerConfig, config_path: Option<PathBuf>) -> Self {
        Self {
            target_args,
            config,
            config_path,
            launcher: Arc::new(SystemLauncher::new()),
        }
    }

    fn target(&self) -> anyhow::Result<Target> {
        build_target(&self.target_args, &self.config, self.config_path.clone())
    }

    fn client(&self) -> anyhow::Result<SshClient> {
        Ok(SshClient::new(self.target()?, self.launcher.clone()))
    }

    fn engine(&self) -> RemoteEngine {
        RemoteEngine::new(self.launcher.clone())
    }
}

pub(crate) async fn dispatch(ctx: &Context, command: Command) -> anyhow::Result<ExitCode> {
    match command {
        Command::Provision => provision(ctx).await,
        Command::Remote(command) => remote(ctx, command).await,
        Command::Tunnel(command) => tunnel(ctx, command).await,
        Command::PortForward(command) => port_forward(ctx, command).await,
        Command::Init(args) => on_node(ctx, NodeAction::Init, args, JoinCredentials::default()).await,
        Command::Join(JoinArgs { server, token, node }) => {
            on_node(ctx, NodeAction::Join, node, JoinCredentials { server, token }).await
        }
        Command::Status(args) => on_node(ctx, NodeAction::Status, args, JoinCredentials::default()).await,
        Command::Doctor(args) => on_node(ctx, NodeAction::Doctor, args, JoinCredentials::default()).await,
        Command::Reset(args) => on_node(ctx, NodeAction::Reset, args, JoinCredentials::default()).await,
        Command::Upgrade(args) => on_node(ctx, NodeAction::Upgrade, args, JoinCredentials::default()).await,
    }
}

async fn on_node(
    ctx: &Context,
    action: NodeAction,
    args: NodeArgs,
    join: JoinCredentials,
) -> anyhow::Result<ExitCode> {
    let dry_run_env = std::env::var(node::DRY_RUN_ENV).ok();
    let request = NodeRequest {
        action,
        repo_dir: node::repo_dir(std::env::var(node::REPO_DIR_ENV).ok()),
        args: args.args,
        join,
        dry_run: node::dry_run_requested(args.dry_run, dry_run_env.as_deref()),
    };
    let code = node::execute(ctx.launcher.as_ref(), &request).await?;
    Ok(ExitCode::from(code))
}

/// Flags win, then the config file. The user from the config only applies
/// when `--user` was not given.
fn build_target(args: &TargetArgs, config: &RiggerConfig, config_path: Option<PathBuf>) -> anyhow::Result<Target> {
    let mut target = Target::new(args.host.clone().unwrap_or_default());
    if let Some(user) = args.user.as_ref() {
        target = target.with_user(user.clone());
    }
    if let Some(identity) = args.identity.as_ref() {
        target = target.with_identity_file(expand_tilde(identity));
    }
    if let Some(repo_url) = args.repo_url.as_ref() {
        target = target.with_repo_url(repo_url.clone());
    }
    target.config_path = config_path;
    target.apply_defaults(&config.target_defaults());
    target.validate()?;
    Ok(target)
}

fn git_options(args: &GitArgs) -> GitOptions {
    GitOptions {
        branch: args.branch.clone(),
        git_ref: args.git_ref.clone(),
        pull: args.pull(),
    }
}

async fn provision(ctx: &Context) -> anyhow::Result<ExitCode> {
    let target = ctx.target()?;
    let root = SshClient::new(target.as_root(), ctx.launcher.clone());
    ctx.engine().provision(&root, &target).await?;
    println!(
        "provisioned {} for {}; next: rigger remote build",
        target.host,
        target.user()
    );
    Ok(ExitCode::SUCCESS)
}

async fn remote(ctx: &Context, command: RemoteCommand) -> anyhow::Result<ExitCode> {
    let client = ctx.client()?;
    let engine = ctx.engine();
    match command {
        RemoteCommand::Build(BuildArgs { project_root, git }) => {
            match engine.build_and_upload(&client, &project_root, &git_options(&git)).await? {
                BuildOutcome::Uploaded { arch } => println!("installed {arch} binary on {}", client.target().host),
                BuildOutcome::UpToDate { arch } => {
                    println!("{arch} binary on {} is already up to date", client.target().host)
                }
            }
        }
        RemoteCommand::Sync(git) => {
            engine.git_sync(&client, &git_options(&git)).await?;
            println!("repository on {} synced", client.target().host);
        }
        RemoteCommand::Run(RunArgs {
            subcommand,
            tty,
            env_file,
            git,
            args,
        }) => {
            let opts = RunOptions {
                force_tty: tty,
                env_file,
                git: git_options(&git),
                args,
            };
            engine.run(&client, &opts, &subcommand).await?;
        }
        RemoteCommand::Smoke(BuildArgs { project_root, git }) => {
            engine.smoke(&client, &project_root, &git_options(&git)).await?;
            println!("smoke test passed on {}", client.target().host);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn tunnel_ports(args: &TunnelArgs, config: &RiggerConfig) -> (u16, u16) {
    let remote = args
        .remote_port
        .or(config.tunnel.remote_port)
        .unwrap_or(DEFAULT_REMOTE_PORT);
    let local = args.local_port.or(config.tunnel.local_port).unwrap_or(remote);
    (local, remote)
}

async fn tunnel(ctx: &Context, command: TunnelCommand) -> anyhow::Result<ExitCode> {
    let target = ctx.target()?;
    let manager = TunnelManager::with_runtime_dir(ctx.launcher.clone());
    match command {
        TunnelCommand::Start(args) => {
            let (local, remote) = tunnel_ports(&args, &ctx.config);
            let spec = TunnelSpec::from_target(&target, local, remote);
            match manager.start(&spec).await? {
                TunnelStart::Started { .. } => println!(
                    "tunnel up: 127.0.0.1:{local} -> {}:{remote}",
                    target.destination()
                ),
                TunnelStart::AlreadyRunning { .. } => {
                    println!("tunnel already running on 127.0.0.1:{local}")
                }
            }
        }
        TunnelCommand::Stop(args) => {
            let (local, _) = tunnel_ports(&args, &ctx.config);
            let identity = TunnelIdentity::new(target.user(), target.host.clone(), local);
            match manager.stop(&identity).await? {
                TunnelStop::Stopped => println!("tunnel on 127.0.0.1:{local} stopped"),
                TunnelStop::NotRunning => println!("tunnel on 127.0.0.1:{local} was not running"),
            }
        }
        TunnelCommand::Status(args) => {
            let (local, _) = tunnel_ports(&args, &ctx.config);
            let identity = TunnelIdentity::new(target.user(), target.host.clone(), local);
            match manager.status(&identity).await {
                TunnelStatus::Running { control_path } => {
                    println!("running (control socket {})", control_path.display());
                }
                TunnelStatus::NotRunning => {
                    println!("not running");
                    return Ok(ExitCode::from(1));
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn forward_identity(args: &PortForwardArgs, config: &RiggerConfig) -> anyhow::Result<PortForwardIdentity> {
    let namespace = args
        .namespace
        .clone()
        .or_else(|| config.port_forward.namespace.clone())
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    let Some(local_port) = args.local_port.or(config.port_forward.local_port) else {
        anyhow::bail!("--local-port is required (or set port_forward.local_port in the config)");
    };
    Ok(PortForwardIdentity::new(namespace, local_port))
}

async fn port_forward(ctx: &Context, command: PortForwardCommand) -> anyhow::Result<ExitCode> {
    let manager = PortForwardManager::with_runtime_dir(ctx.launcher.clone());
    let config = &ctx.config;
    match command {
        PortForwardCommand::Start(args) => {
            let identity = forward_identity(&args.forward, config)?;
            let Some(resource) = args.resource.or_else(|| config.port_forward.resource.clone()) else {
                anyhow::bail!("--resource is required (or set port_forward.resource in the config)");
            };
            let remote_port = args
                .remote_port
                .or(config.port_forward.remote_port)
                .unwrap_or(identity.local_port);
            let spec = PortForwardSpec {
                identity: identity.clone(),
                resource,
                remote_port,
            };
            match manager.start(&spec).await? {
                ForwardStart::Started { pid } => {
                    println!("port-forward {identity} started (pid {pid})")
                }
                ForwardStart::AlreadyRunning { pid } => {
                    println!("port-forward {identity} already running (pid {pid})")
                }
            }
            if let Some(timeout) = args.wait {
                manager.wait_ready(&identity, *timeout).await?;
                info!(event = "port_forward.ready", forward = %identity, "port accepts connections");
                println!("127.0.0.1:{} is ready", identity.local_port);
            }
        }
        PortForwardCommand::Stop(args) => {
            let identity = forward_identity(&args, config)?;
            match manager.stop(&identity)? {
                ForwardStop::Stopped { pid } => println!("port-forward {identity} stopped (pid {pid})"),
                ForwardStop::NotRunning => println!("port-forward {identity} was not running"),
            }
        }
        PortForwardCommand::Status(args) => {
            let identity = forward_identity(&args, config)?;
            match manager.status(&identity) {
                PortForwardStatus::Running { pid } => println!("running (pid {pid})"),
                PortForwardStatus::Stopped => {
                    println!("not running");
                    return Ok(ExitCode::from(1));
                }
            }
        }
        PortForwardCommand::Wait(args) => {
            let identity = forward_identity(&args.forward, config)?;
            manager.wait_ready(&identity, *args.timeout).await?;
            println!("127.0.0.1:{} is ready", identity.local_port);
        }
        PortForwardCommand::Logs(args) => {
            let identity = forward_identity(&args.forward, config)?;
            for line in manager.log_tail(&identity, args.lines) {
                println!("{line}");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
