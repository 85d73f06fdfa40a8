use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use remote_client::{RemoteClient, Target};
use system_utils::{CommandSpec, ProcessLauncher};
use tracing::{info, warn};

use crate::build::{
    cross_build, detect_arch, ensure_toolchain, install_binary, local_md5_hex, remote_md5_hex,
    BuildOutcome,
};
use crate::envfile;
use crate::git::remote_git_sync;
use crate::options::{GitOptions, RunOptions};
use crate::provision::{public_key_path, validate_public_key, ProvisionError, PROVISION_SCRIPT};
use crate::run::{check_subcommand, remote_env_path, wrapper_command, RunError};
use crate::{REMOTE_BIN_PATH, REMOTE_REPO_DIR};

/// Root password for the one-time key install. Read once, then removed
/// from the environment.
pub const ROOT_PASSWORD_ENV: &str = "RIGGER_ROOT_PASSWORD";

pub struct RemoteEngine {
    launcher: Arc<dyn ProcessLauncher>,
    password_env: String,
}

impl RemoteEngine {
    pub fn new(launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            launcher,
            password_env: ROOT_PASSWORD_ENV.to_string(),
        }
    }

    /// Reads the root password from `name` instead of [`ROOT_PASSWORD_ENV`].
    pub fn with_password_env(mut self, name: impl Into<String>) -> Self {
        self.password_env = name.into();
        self
    }

    pub fn launcher(&self) -> &Arc<dyn ProcessLauncher> {
        &self.launcher
    }

    /// Prepares a fresh host as root: installs the local public key for root
    /// (falling back to a password once), then creates the sudo-enabled
    /// user and clones the repository.
    pub async fn provision(&self, root: &dyn RemoteClient, user: &Target) -> anyhow::Result<()> {
        let identity = root.identity_file().ok_or(ProvisionError::NoIdentity)?;
        let pub_path = public_key_path(identity);
        let public_key = validate_public_key(&pub_path)?;
        let script = PROVISION_SCRIPT.render(&[("USER", user.user()), ("REPO_DIR", REMOTE_REPO_DIR)])?;
        let host = root.target().host.clone();

        if let Err(err) = root.test_connection().await {
            info!(event = "remote.provision.password_fallback", target = %root.target().destination(), error = %err, "key login refused; installing key with password");
            self.install_root_key(root.target(), &pub_path).await?;
            root.test_connection()
                .await
                .map_err(|_| ProvisionError::RootUnreachable { host: host.clone() })?;
        }

        let repo_url = user.repo_url.as_deref().unwrap_or("");
        if repo_url.is_empty() {
            warn!(event = "remote.provision.no_repo", target = %host, "no repo_url configured; the repository will not be cloned");
        }
        info!(event = "remote.provision.start", target = %host, user = %user.user(), "running provisioning script");
        root.execute_script(&script, &[public_key.as_str(), repo_url])
            .await
            .with_context(|| format!("provisioning {host} failed"))?;
        info!(event = "remote.provision.done", target = %host, user = %user.user(), "host provisioned");
        Ok(())
    }

    async fn install_root_key(&self, root: &Target, pub_path: &Path) -> anyhow::Result<()> {
        for tool in ["sshpass", "ssh-copy-id"] {
            if self.launcher.lookup(tool).is_none() {
                return Err(ProvisionError::PasswordToolMissing(tool).into());
            }
        }
        let Some(password) = std::env::var(&self.password_env).ok().filter(|pw| !pw.is_empty()) else {
            return Err(ProvisionError::NoPassword {
                host: root.host.clone(),
                env: self.password_env.clone(),
            }
            .into());
        };
        std::env::remove_var(&self.password_env);

        // sshpass -e reads SSHPASS, keeping the password out of argv.
        let spec = CommandSpec::new("sshpass")
            .arg("-e")
            .arg("ssh-copy-id")
            .arg("-i")
            .arg(pub_path.to_string_lossy().to_string())
            .args([
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "LogLevel=ERROR",
            ])
            .arg(root.destination())
            .env("SSHPASS", password);
        let output = self.launcher.run(&spec).await?;
        if !output.is_success() {
            return Err(ProvisionError::KeyInstallFailed {
                host: root.host.clone(),
                env: self.password_env.clone(),
            }
            .into());
        }
        Ok(())
    }

    pub async fn git_sync(&self, client: &dyn RemoteClient, opts: &GitOptions) -> anyhow::Result<()> {
        remote_git_sync(client, REMOTE_REPO_DIR, opts).await
    }

    /// Cross-compiles the binary for the host's architecture and installs
    /// it, skipping the upload when the remote copy already matches.
    pub async fn build_and_upload(
        &self,
        client: &dyn RemoteClient,
        project_root: &Path,
        git: &GitOptions,
    ) -> anyhow::Result<BuildOutcome> {
        let cargo = ensure_toolchain(self.launcher.as_ref())?;
        info!(event = "remote.build.toolchain", cargo = %cargo.display(), "local toolchain found");
        if git.is_requested() {
            self.git_sync(client, git).await?;
        }
        let arch = detect_arch(client).await?;
        let destination = client.target().destination();
        info!(event = "remote.build.arch", target = %destination, %arch, "remote architecture detected");

        let scratch = tempfile::Builder::new()
            .prefix("rigger-build-")
            .tempdir()
            .context("failed to create build directory")?;
        let artifact = cross_build(self.launcher.as_ref(), project_root, scratch.path(), arch).await?;

        let local_md5 = local_md5_hex(&artifact)?;
        if remote_md5_hex(client, REMOTE_BIN_PATH).await.as_deref() == Some(local_md5.as_str()) {
            info!(event = "remote.build.skip", target = %destination, md5 = %local_md5, "remote binary up to date, skipping upload");
            return Ok(BuildOutcome::UpToDate { arch });
        }
        install_binary(client, &artifact, REMOTE_BIN_PATH)
            .await
            .with_context(|| format!("failed to install binary on {destination}"))?;
        info!(event = "remote.build.installed", target = %destination, md5 = %local_md5, "remote binary installed");
        Ok(BuildOutcome::Uploaded { arch })
    }

    /// Runs an allow-listed subcommand of the remote binary as root.
    pub async fn run(
        &self,
        client: &dyn RemoteClient,
        opts: &RunOptions,
        subcommand: &str,
    ) -> anyhow::Result<()> {
        check_subcommand(subcommand)?;
        let env_vars = match opts.env_file.as_deref() {
            Some(path) => Some(envfile::load(path)?),
            None => None,
        };
        self.preflight(client).await?;
        if opts.git.is_requested() {
            self.git_sync(client, &opts.git).await?;
        }

        let Some(env_vars) = env_vars else {
            return self.invoke(client, opts, subcommand, None).await;
        };
        let local = tempfile::Builder::new()
            .prefix("rigger-run-")
            .suffix(".env")
            .tempfile()
            .context("failed to create local env file")?;
        std::fs::write(local.path(), envfile::render(&env_vars))
            .context("failed to write local env file")?;
        let remote_env = remote_env_path();
        let result = async {
            client.upload(local.path(), &remote_env).await?;
            client.execute("chmod", &["600", remote_env.as_str()], false).await?;
            self.invoke(client, opts, subcommand, Some(&remote_env)).await
        }
        .await;
        if let Err(err) = client.execute("rm", &["-f", remote_env.as_str()], false).await {
            warn!(event = "remote.run.cleanup_failed", target = %client.target().destination(), path = %remote_env, error = %err, "failed to remove remote env file");
        }
        result
    }

    async fn preflight(&self, client: &dyn RemoteClient) -> anyhow::Result<()> {
        let destination = client.target().destination();
        if let Err(err) = client.test_connection().await {
            return Err(RunError::Unreachable {
                destination,
                detail: err.to_string(),
            }
            .into());
        }
        let repo_git = format!("{REMOTE_REPO_DIR}/.git");
        if client.execute("test", &["-d", repo_git.as_str()], false).await.is_err() {
            return Err(RunError::RepoMissing {
                destination,
                repo_dir: REMOTE_REPO_DIR.to_string(),
            }
            .into());
        }
        if client.execute("test", &["-x", REMOTE_BIN_PATH], false).await.is_err() {
            return Err(RunError::BinaryMissing {
                destination,
                bin_path: REMOTE_BIN_PATH.to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn invoke(
        &self,
        client: &dyn RemoteClient,
        opts: &RunOptions,
        subcommand: &str,
        env_path: Option<&str>,
    ) -> anyhow::Result<()> {
        let line = wrapper_command(env_path, REMOTE_BIN_PATH, subcommand, &opts.args);
        info!(
            event = "remote.run",
            target = %client.target().destination(),
            subcommand,
            args = opts.args.len(),
            env_file = env_path.is_some(),
            "running remote subcommand"
        );
        client
            .run_command_string(&line, opts.force_tty)
            .await
            .with_context(|| format!("remote `{subcommand}` failed"))
    }

    /// Builds and installs the binary, then drives a dry-run pass through
    /// doctor, init, join and status.
    pub async fn smoke(
        &self,
        client: &dyn RemoteClient,
        project_root: &Path,
        git: &GitOptions,
    ) -> anyhow::Result<()> {
        crate::smoke::smoke(self, client, project_root, git).await
    }
}
