use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use system_utils::path::home_dir;
use system_utils::shell::{build_env_prefix, join_escaped};
use system_utils::{CommandOutput, CommandSpec, ProcessLauncher};
use tracing::{debug, info};

use crate::error::RemoteError;
use crate::target::Target;

const SSH_CONNECT_TIMEOUT_SECS: u64 = 10;
const CHECK_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Remote operations against one [`Target`].
///
/// Arguments are quoted one by one before they are joined into the remote
/// command line; callers never build shell strings from untrusted input.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    fn target(&self) -> &Target;

    /// Private key used for this connection, if any.
    fn identity_file(&self) -> Option<&Path>;

    async fn execute(&self, cmd: &str, args: &[&str], force_tty: bool) -> anyhow::Result<()>;

    /// Like [`RemoteClient::execute`] with `KEY=value` assignments in front,
    /// so the values reach the command without server-side `AcceptEnv`.
    async fn execute_with_env(
        &self,
        cmd: &str,
        args: &[&str],
        env: &[(&str, &str)],
        force_tty: bool,
    ) -> anyhow::Result<()>;

    /// Pipes `script` into a remote `bash -s` with `args` as `$1..$n`.
    async fn execute_script(&self, script: &str, args: &[&str]) -> anyhow::Result<()>;

    async fn upload(&self, local: &Path, remote: &str) -> anyhow::Result<()>;

    /// Silent non-interactive reachability check.
    async fn test_connection(&self) -> anyhow::Result<()>;

    /// Runs a command line that is already quoted. Only for strings built
    /// inside rigger, never for raw external input.
    async fn run_command_string(&self, raw: &str, force_tty: bool) -> anyhow::Result<()>;

    /// Runs a command and returns its trimmed stdout.
    async fn output_command(&self, cmd: &str, args: &[&str]) -> anyhow::Result<String>;
}

/// Picks the private key to authenticate with. An explicit path wins;
/// otherwise ed25519 is preferred over rsa. `None` leaves it to ssh.
pub fn select_identity(explicit: Option<&Path>, home: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let ssh_dir = home?.join(".ssh");
    ["id_ed25519", "id_rsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Options every rigger ssh/scp invocation carries. Host keys are not
/// checked so first contact with a fresh machine needs no prompt.
pub fn connection_options(identity: Option<&Path>) -> Vec<String> {
    let mut options = vec![
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        "LogLevel=ERROR".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={SSH_CONNECT_TIMEOUT_SECS}"),
    ];
    if let Some(identity) = identity {
        options.push("-i".to_string());
        options.push(identity.to_string_lossy().to_string());
    }
    options
}

/// [`RemoteClient`] backed by the `ssh` and `scp` binaries.
pub struct SshClient {
    target: Target,
    identity: Option<PathBuf>,
    launcher: Arc<dyn ProcessLauncher>,
}

impl SshClient {
    pub fn new(target: Target, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let identity = select_identity(target.identity_file.as_deref(), home_dir().as_deref());
        if let Some(identity) = identity.as_ref() {
            debug!(event = "ssh.identity.selected", target = %target.destination(), identity = %identity.display(), "selected ssh identity");
        }
        Self {
            target,
            identity,
            launcher,
        }
    }

    pub fn launcher(&self) -> &Arc<dyn ProcessLauncher> {
        &self.launcher
    }

    /// Connection options shared by ssh and scp.
    pub fn connection_options(&self) -> Vec<String> {
        connection_options(self.identity.as_deref())
    }

    fn ssh_command(&self, force_tty: bool, remote_cmd: &str) -> CommandSpec {
        CommandSpec::new("ssh")
            .arg(if force_tty { "-t" } else { "-T" })
            .args(self.connection_options())
            .arg(self.target.destination())
            .arg(remote_cmd)
    }

    async fn run_remote(&self, label: &str, spec: CommandSpec) -> anyhow::Result<()> {
        let output = self.launcher.run(&spec).await?;
        check_status(label, &output)?;
        Ok(())
    }
}

fn remote_command_line(cmd: &str, args: &[&str]) -> String {
    join_escaped(std::iter::once(cmd).chain(args.iter().copied()))
}

fn check_status(label: &str, output: &CommandOutput) -> Result<(), RemoteError> {
    if output.is_success() {
        return Ok(());
    }
    Err(RemoteError::CommandFailed {
        label: label.to_string(),
        code: output.status,
        detail: output.detail(),
    })
}

#[async_trait]
impl RemoteClient for SshClient {
    fn target(&self) -> &Target {
        &self.target
    }

    fn identity_file(&self) -> Option<&Path> {
        self.identity.as_deref()
    }

    async fn execute(&self, cmd: &str, args: &[&str], force_tty: bool) -> anyhow::Result<()> {
        let line = remote_command_line(cmd, args);
        debug!(event = "remote.exec", target = %self.target.destination(), command = %line, "remote execute");
        let spec = self.ssh_command(force_tty, &line);
        self.run_remote(&format!("remote {cmd}"), spec).await
    }

    async fn execute_with_env(
        &self,
        cmd: &str,
        args: &[&str],
        env: &[(&str, &str)],
        force_tty: bool,
    ) -> anyhow::Result<()> {
        let prefix = build_env_prefix(env.iter().copied())?;
        let command = remote_command_line(cmd, args);
        let line = if prefix.is_empty() {
            command
        } else {
            format!("{prefix} {command}")
        };
        debug!(
            event = "remote.exec_env",
            target = %self.target.destination(),
            command = %cmd,
            env_count = env.len(),
            "remote execute with env"
        );
        let spec = self.ssh_command(force_tty, &line);
        self.run_remote(&format!("remote {cmd}"), spec).await
    }

    async fn execute_script(&self, script: &str, args: &[&str]) -> anyhow::Result<()> {
        let line = format!("bash -s -- {}", join_escaped(args.iter().copied()));
        let spec = self
            .ssh_command(false, line.trim_end())
            .stdin(script.as_bytes().to_vec());
        self.run_remote("remote script", spec).await
    }

    async fn upload(&self, local: &Path, remote: &str) -> anyhow::Result<()> {
        if !local.is_file() {
            anyhow::bail!("upload source {} is not a file", local.display());
        }
        info!(
            event = "remote.upload",
            target = %self.target.destination(),
            local = %local.display(),
            remote = %remote,
            "uploading file"
        );
        let spec = CommandSpec::new("scp")
            .arg("-q")
            .args(self.connection_options())
            .arg(local.to_string_lossy().to_string())
            .arg(format!("{}:{}", self.target.destination(), remote));
        let output = self.launcher.output(&spec).await?;
        check_status("scp", &output)?;
        Ok(())
    }

    async fn test_connection(&self) -> anyhow::Result<()> {
        // ssh keeps the first value it sees for an option, so the check's
        // tighter settings go before the shared ones.
        let spec = CommandSpec::new("ssh")
            .arg("-T")
            .args([
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                format!("ConnectTimeout={CHECK_CONNECT_TIMEOUT_SECS}"),
            ])
            .args(self.connection_options())
            .arg(self.target.destination())
            .arg("true");
        let output = self.launcher.output(&spec).await?;
        if !output.is_success() {
            return Err(RemoteError::Unreachable {
                destination: self.target.destination(),
                detail: output.detail(),
            }
            .into());
        }
        Ok(())
    }

    async fn run_command_string(&self, raw: &str, force_tty: bool) -> anyhow::Result<()> {
        debug!(event = "remote.command", target = %self.target.destination(), command = %raw, "remote command string");
        let spec = self.ssh_command(force_tty, raw);
        self.run_remote("remote command", spec).await
    }

    async fn output_command(&self, cmd: &str, args: &[&str]) -> anyhow::Result<String> {
        let line = remote_command_line(cmd, args);
        let spec = self.ssh_command(false, &line);
        let output = self.launcher.output(&spec).await?;
        check_status(&format!("remote {cmd}"), &output)?;
        Ok(output.stdout_lossy().trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use system_utils::testing::FakeLauncher;

    fn client_with(launcher: Arc<FakeLauncher>) -> SshClient {
        let target = Target::new("node1")
            .with_user("ops")
            .with_identity_file("/keys/id_ed25519");
        SshClient::new(target, launcher)
    }

    #[test]
    fn explicit_identity_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chosen = select_identity(Some(Path::new("/keys/custom")), Some(dir.path()));
        assert_eq!(chosen, Some(PathBuf::from("/keys/custom")));
    }

    #[test]
    fn ed25519_is_preferred_over_rsa() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ssh = dir.path().join(".ssh");
        std::fs::create_dir_all(&ssh).expect("mkdir");
        std::fs::write(ssh.join("id_rsa"), "rsa").expect("write");
        assert_eq!(select_identity(None, Some(dir.path())), Some(ssh.join("id_rsa")));
        std::fs::write(ssh.join("id_ed25519"), "ed").expect("write");
        assert_eq!(
            select_identity(None, Some(dir.path())),
            Some(ssh.join("id_ed25519"))
        );
    }

    #[test]
    fn no_keys_means_ssh_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(select_identity(None, Some(dir.path())), None);
        assert_eq!(select_identity(None, None), None);
    }

    #[tokio::test]
    async fn execute_quotes_every_argument() {
        let launcher = Arc::new(FakeLauncher::new());
        let client = client_with(Arc::clone(&launcher));
        client
            .execute("echo", &["a b", "it's", "; rm -rf /"], false)
            .await
            .expect("execute");
        let calls = launcher.calls_to("ssh");
        assert_eq!(calls.len(), 1);
        let spec = &calls[0];
        assert_eq!(spec.args.first().map(String::as_str), Some("-T"));
        assert!(spec.has_arg("StrictHostKeyChecking=no"));
        assert!(spec.has_arg("/keys/id_ed25519"));
        let n = spec.args.len();
        assert_eq!(spec.args[n - 2], "ops@node1");
        assert_eq!(spec.args[n - 1], "'echo' 'a b' 'it'\\''s' '; rm -rf /'");
    }

    #[tokio::test]
    async fn forced_tty_uses_dash_t() {
        let launcher = Arc::new(FakeLauncher::new());
        let client = client_with(Arc::clone(&launcher));
        client.execute("top", &[], true).await.expect("execute");
        let spec = &launcher.calls_to("ssh")[0];
        assert_eq!(spec.args.first().map(String::as_str), Some("-t"));
    }

    #[tokio::test]
    async fn execute_with_env_prefixes_assignments() {
        let launcher = Arc::new(FakeLauncher::new());
        let client = client_with(Arc::clone(&launcher));
        client
            .execute_with_env("env", &[], &[("TOKEN", "a'b")], false)
            .await
            .expect("execute");
        let spec = &launcher.calls_to("ssh")[0];
        assert_eq!(spec.args.last().map(String::as_str), Some("TOKEN='a'\\''b' 'env'"));
    }

    #[tokio::test]
    async fn execute_with_env_rejects_bad_keys() {
        let launcher = Arc::new(FakeLauncher::new());
        let client = client_with(Arc::clone(&launcher));
        let result = client
            .execute_with_env("env", &[], &[("BAD;KEY", "1")], false)
            .await;
        assert!(result.is_err());
        assert!(launcher.calls().is_empty());
    }

    #[tokio::test]
    async fn execute_script_pipes_stdin() {
        let launcher = Arc::new(FakeLauncher::new());
        let client = client_with(Arc::clone(&launcher));
        client
            .execute_script("echo \"$1\"\n", &["x y"])
            .await
            .expect("script");
        let spec = &launcher.calls_to("ssh")[0];
        assert_eq!(spec.args.last().map(String::as_str), Some("bash -s -- 'x y'"));
        assert_eq!(spec.stdin.as_deref(), Some("echo \"$1\"\n".as_bytes()));
    }

    #[tokio::test]
    async fn non_zero_exit_is_command_failed() {
        let launcher = Arc::new(FakeLauncher::with_responder(|_| {
            CommandOutput::failure(2, "boom")
        }));
        let client = client_with(Arc::clone(&launcher));
        let err = client
            .output_command("uname", &["-m"])
            .await
            .expect_err("should fail");
        let remote = err.downcast_ref::<RemoteError>().expect("remote error");
        assert!(matches!(remote, RemoteError::CommandFailed { code: Some(2), .. }));
    }

    #[tokio::test]
    async fn execute_failure_carries_stderr_and_hint() {
        let launcher = Arc::new(FakeLauncher::with_responder(|_| {
            CommandOutput::failure(255, "ops@node1: Permission denied (publickey).")
        }));
        let client = client_with(Arc::clone(&launcher));
        let err = client
            .execute("true", &[], false)
            .await
            .expect_err("auth failure");
        let remote = err.downcast_ref::<RemoteError>().expect("remote error");
        assert!(remote.is_auth_failure());
        assert!(remote.to_string().contains("Permission denied"));
    }

    #[tokio::test]
    async fn output_command_trims_stdout() {
        let launcher = Arc::new(FakeLauncher::with_responder(|_| {
            CommandOutput::success().with_stdout("x86_64\n")
        }));
        let client = client_with(Arc::clone(&launcher));
        let out = client.output_command("uname", &["-m"]).await.expect("output");
        assert_eq!(out, "x86_64");
    }

    #[tokio::test]
    async fn test_connection_reports_unreachable() {
        let launcher = Arc::new(FakeLauncher::with_responder(|_| {
            CommandOutput::failure(255, "ssh: connect to host node1 port 22: Connection refused")
        }));
        let client = client_with(Arc::clone(&launcher));
        let err = client.test_connection().await.expect_err("unreachable");
        let remote = err.downcast_ref::<RemoteError>().expect("remote error");
        assert!(matches!(remote, RemoteError::Unreachable { .. }));
        let spec = &launcher.calls_to("ssh")[0];
        assert!(spec.has_arg("BatchMode=yes"));
        assert_eq!(spec.args.last().map(String::as_str), Some("true"));
    }

    #[tokio::test]
    async fn upload_uses_scp_with_connection_options() {
        let dir = tempfile::tempdir().expect("tempdir");
        let local = dir.path().join("bin");
        std::fs::write(&local, "binary").expect("write");
        let launcher = Arc::new(FakeLauncher::new());
        let client = client_with(Arc::clone(&launcher));
        client.upload(&local, ".local/bin/rigger").await.expect("upload");
        let spec = &launcher.calls_to("scp")[0];
        assert!(spec.has_arg("StrictHostKeyChecking=no"));
        assert_eq!(
            spec.args.last().map(String::as_str),
            Some("ops@node1:.local/bin/rigger")
        );
    }
}
