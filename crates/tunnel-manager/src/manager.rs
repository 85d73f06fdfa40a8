use std::io;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use remote_client::{connection_options, looks_like_auth_failure, select_identity, Target};
use system_utils::path::{ensure_private_dir, home_dir, runtime_dir};
use system_utils::ProcessLauncher;
use thiserror::Error;
use tracing::{info, warn};

use crate::identity::TunnelIdentity;
use crate::ssh::{check_master, exit_master, master_command};

/// The cluster API server port.
pub const DEFAULT_REMOTE_PORT: u16 = 6443;

const CONTROL_SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(15);

/// `sun_path` holds 108 bytes on Linux and 104 elsewhere, NUL included.
#[cfg(target_os = "linux")]
const SUN_PATH_BYTES: usize = 108;
#[cfg(not(target_os = "linux"))]
const SUN_PATH_BYTES: usize = 104;
/// ssh binds `<ControlPath>.<16 random chars>` first and renames it.
const SSH_TEMP_SUFFIX_BYTES: usize = 17;
pub const MAX_CONTROL_PATH_BYTES: usize = SUN_PATH_BYTES - 1 - SSH_TEMP_SUFFIX_BYTES;
const CONTROL_SOCKET_WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// What to forward: `127.0.0.1:<local_port>` here to
/// `<remote_host>:<remote_port>` as seen from the target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelSpec {
    pub identity: TunnelIdentity,
    pub remote_host: String,
    pub remote_port: u16,
    pub identity_file: Option<PathBuf>,
}

impl TunnelSpec {
    pub fn from_target(target: &Target, local_port: u16, remote_port: u16) -> Self {
        Self {
            identity: TunnelIdentity::new(target.user(), target.host.clone(), local_port),
            remote_host: "127.0.0.1".to_string(),
            remote_port,
            identity_file: select_identity(target.identity_file.as_deref(), home_dir().as_deref()),
        }
    }

    fn forward_arg(&self) -> String {
        format!(
            "127.0.0.1:{}:{}:{}",
            self.identity.local_port, self.remote_host, self.remote_port
        )
    }
}

#[derive(Debug, Error)]
pub enum TunnelError {
    /// Something other than our tunnel holds the port.
    #[error("local port {port} is already in use by another process; choose another with --local-port")]
    PortInUse {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("ssh authentication to {destination} failed: {detail}\nrun `rigger provision` to install your key, or pass --identity")]
    AuthFailed { destination: String, detail: String },

    #[error("ssh tunnel to {destination} exited during startup: {detail}")]
    ExitedEarly { destination: String, detail: String },

    #[error(
        "control socket path {} is {len} bytes, ssh allows at most {max}; use a shorter host alias or set XDG_RUNTIME_DIR to a shorter directory",
        .path.display()
    )]
    ControlPathTooLong { path: PathBuf, len: usize, max: usize },

    #[error("ssh control socket {} not ready after {}s", .path.display(), .timeout.as_secs())]
    StartTimeout { path: PathBuf, timeout: Duration },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started { control_path: PathBuf },
    AlreadyRunning { control_path: PathBuf },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TunnelStatus {
    Running { control_path: PathBuf },
    NotRunning,
}

impl TunnelStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, TunnelStatus::Running { .. })
    }
}

pub struct TunnelManager {
    launcher: Arc<dyn ProcessLauncher>,
    control_dir: PathBuf,
    socket_wait: Duration,
}

impl TunnelManager {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, control_dir: PathBuf) -> Self {
        Self {
            launcher,
            control_dir,
            socket_wait: CONTROL_SOCKET_WAIT_TIMEOUT,
        }
    }

    /// Uses the per-user runtime directory for control sockets.
    pub fn with_runtime_dir(launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self::new(launcher, runtime_dir())
    }

    pub fn with_socket_wait(mut self, timeout: Duration) -> Self {
        self.socket_wait = timeout;
        self
    }

    pub fn control_path(&self, identity: &TunnelIdentity) -> PathBuf {
        identity.control_path(&self.control_dir)
    }

    pub async fn is_running(&self, identity: &TunnelIdentity) -> bool {
        let control_path = self.control_path(identity);
        if !control_path.exists() {
            return false;
        }
        match check_master(self.launcher.as_ref(), identity, &control_path).await {
            Ok(output) => output.is_success(),
            Err(err) => {
                warn!(event = "tunnel.check.failed", tunnel = %identity, error = %err, "ssh -O check could not run");
                false
            }
        }
    }

    pub async fn status(&self, identity: &TunnelIdentity) -> TunnelStatus {
        if self.is_running(identity).await {
            TunnelStatus::Running {
                control_path: self.control_path(identity),
            }
        } else {
            TunnelStatus::NotRunning
        }
    }

    /// Starts the tunnel unless ours is already up. Two concurrent callers
    /// can both pass the running check; the loser fails on the port bind.
    pub async fn start(&self, spec: &TunnelSpec) -> anyhow::Result<StartOutcome> {
        let identity = &spec.identity;
        let control_path = self.control_path(identity);
        if self.is_running(identity).await {
            info!(event = "tunnel.start.skip", tunnel = %identity, "tunnel already running");
            return Ok(StartOutcome::AlreadyRunning { control_path });
        }

        ensure_short_enough(&control_path)?;
        ensure_port_free(identity.local_port)?;
        ensure_private_dir(&self.control_dir)?;
        remove_if_exists(&control_path);
        let log_path = control_path.with_extension("log");
        remove_if_exists(&log_path);

        let options = connection_options(spec.identity_file.as_deref());
        let command = master_command(identity, &control_path, &options, &spec.forward_arg());
        let pid = self.launcher.spawn_detached(&command, &log_path)?;
        info!(
            event = "tunnel.spawned",
            tunnel = %identity,
            pid,
            forward = %spec.forward_arg(),
            "ssh tunnel master spawned"
        );

        self.wait_for_master(identity, &control_path, &log_path, pid)
            .await?;
        info!(event = "tunnel.ready", tunnel = %identity, control_path = %control_path.display(), "tunnel running");
        Ok(StartOutcome::Started { control_path })
    }

    /// Tears the tunnel down through its control socket. Stopping a tunnel
    /// that is not running succeeds.
    pub async fn stop(&self, identity: &TunnelIdentity) -> anyhow::Result<StopOutcome> {
        let control_path = self.control_path(identity);
        if !self.is_running(identity).await {
            remove_if_exists(&control_path);
            return Ok(StopOutcome::NotRunning);
        }
        exit_master(self.launcher.as_ref(), identity, &control_path).await?;
        remove_if_exists(&control_path);
        info!(event = "tunnel.stop", tunnel = %identity, "tunnel stopped");
        Ok(StopOutcome::Stopped)
    }

    async fn wait_for_master(
        &self,
        identity: &TunnelIdentity,
        control_path: &Path,
        log_path: &Path,
        pid: u32,
    ) -> anyhow::Result<()> {
        let start = std::time::Instant::now();
        loop {
            if control_path.exists() && self.is_running(identity).await {
                return Ok(());
            }
            // With ControlPersist the spawned ssh forks and exits once the
            // socket exists, so a dead pid alone is not a failure.
            if !self.launcher.is_alive(pid) && !control_path.exists() {
                let detail = read_log(log_path);
                if looks_like_auth_failure(&detail) {
                    return Err(TunnelError::AuthFailed {
                        destination: identity.destination(),
                        detail,
                    }
                    .into());
                }
                return Err(TunnelError::ExitedEarly {
                    destination: identity.destination(),
                    detail,
                }
                .into());
            }
            if start.elapsed() >= self.socket_wait {
                if let Err(err) = self.launcher.terminate(pid) {
                    warn!(event = "tunnel.timeout.kill_failed", pid, error = %err, "failed to stop ssh master after timeout");
                }
                return Err(TunnelError::StartTimeout {
                    path: control_path.to_path_buf(),
                    timeout: self.socket_wait,
                }
                .into());
            }
            tokio::time::sleep(CONTROL_SOCKET_WAIT_INTERVAL).await;
        }
    }
}

fn ensure_short_enough(control_path: &Path) -> Result<(), TunnelError> {
    let len = control_path.as_os_str().len();
    if len > MAX_CONTROL_PATH_BYTES {
        return Err(TunnelError::ControlPathTooLong {
            path: control_path.to_path_buf(),
            len,
            max: MAX_CONTROL_PATH_BYTES,
        });
    }
    Ok(())
}

fn ensure_port_free(port: u16) -> Result<(), TunnelError> {
    match TcpListener::bind(("127.0.0.1", port)) {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(source) => Err(TunnelError::PortInUse { port, source }),
    }
}

fn read_log(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(contents) if !contents.trim().is_empty() => contents.trim().to_string(),
        _ => "no output from ssh".to_string(),
    }
}

fn remove_if_exists(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(event = "tunnel.cleanup.failed", path = %path.display(), error = %err, "failed to remove stale file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use system_utils::testing::FakeLauncher;
    use system_utils::{CommandOutput, CommandSpec};

    fn socket_arg(spec: &CommandSpec) -> Option<PathBuf> {
        let index = spec.arg_position("-S")?;
        spec.args.get(index + 1).map(PathBuf::from)
    }

    /// Behaves like ssh's control channel: `check` succeeds while the socket
    /// file exists, `exit` removes it, and spawning a master creates it.
    fn ssh_like_launcher() -> Arc<FakeLauncher> {
        let launcher = FakeLauncher::with_responder(|spec| {
            let Some(socket) = socket_arg(spec) else {
                return CommandOutput::failure(255, "unexpected command");
            };
            if spec.has_arg("check") {
                if socket.exists() {
                    CommandOutput::success().with_stdout("Master running (pid=1)")
                } else {
                    CommandOutput::failure(255, "Control socket connect: No such file or directory")
                }
            } else if spec.has_arg("exit") {
                let _ = std::fs::remove_file(&socket);
                CommandOutput::success()
            } else {
                CommandOutput::failure(255, "unexpected command")
            }
        })
        .with_spawn_hook(|spec, _log| {
            if let Some(socket) = socket_arg(spec) {
                std::fs::write(socket, "").expect("create socket stand-in");
            }
        });
        Arc::new(launcher)
    }

    fn free_port() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        listener.local_addr().expect("addr").port()
    }

    fn spec(port: u16) -> TunnelSpec {
        TunnelSpec {
            identity: TunnelIdentity::new("ops", "node1", port),
            remote_host: "127.0.0.1".to_string(),
            remote_port: DEFAULT_REMOTE_PORT,
            identity_file: Some(PathBuf::from("/keys/id_ed25519")),
        }
    }

    #[tokio::test]
    async fn start_twice_spawns_one_master() {
        let dir = tempfile::tempdir().expect("tempdir");
        let launcher = ssh_like_launcher();
        let manager = TunnelManager::new(launcher.clone(), dir.path().join("ctl"));
        let spec = spec(free_port());

        let first = manager.start(&spec).await.expect("first start");
        assert!(matches!(first, StartOutcome::Started { .. }));
        let second = manager.start(&spec).await.expect("second start");
        assert!(matches!(second, StartOutcome::AlreadyRunning { .. }));
        assert_eq!(launcher.spawned().len(), 1);

        let (command, _, _) = &launcher.spawned()[0];
        assert!(command.has_arg("ExitOnForwardFailure=yes"));
        assert!(command.has_arg("ControlPersist=yes"));
        assert!(command.has_arg(&format!("127.0.0.1:{}:127.0.0.1:6443", spec.identity.local_port)));
        assert_eq!(command.args.last().map(String::as_str), Some("ops@node1"));
    }

    #[tokio::test]
    async fn start_on_busy_port_is_port_in_use() {
        let dir = tempfile::tempdir().expect("tempdir");
        let launcher = ssh_like_launcher();
        let manager = TunnelManager::new(launcher.clone(), dir.path().to_path_buf());
        let holder = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let port = holder.local_addr().expect("addr").port();

        let err = manager.start(&spec(port)).await.expect_err("port busy");
        assert!(matches!(
            err.downcast_ref::<TunnelError>(),
            Some(TunnelError::PortInUse { .. })
        ));
        assert!(launcher.spawned().is_empty());
    }

    #[tokio::test]
    async fn overlong_control_path_is_rejected_before_spawning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let launcher = ssh_like_launcher();
        let manager = TunnelManager::new(launcher.clone(), dir.path().to_path_buf());
        let mut spec = spec(free_port());
        spec.identity.host = format!("{}.compute.internal", "worker-".repeat(12));

        let err = manager.start(&spec).await.expect_err("path too long");
        match err.downcast_ref::<TunnelError>() {
            Some(TunnelError::ControlPathTooLong { len, max, .. }) => {
                assert!(len > max);
                assert_eq!(*max, MAX_CONTROL_PATH_BYTES);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(launcher.spawned().is_empty());
    }

    #[tokio::test]
    async fn auth_failure_is_distinct() {
        let dir = tempfile::tempdir().expect("tempdir");
        let launcher = FakeLauncher::with_responder(|_| CommandOutput::failure(255, ""))
            .with_spawn_hook(|_spec, log| {
                std::fs::write(log, "ops@node1: Permission denied (publickey).\n").expect("log");
            });
        let launcher = Arc::new(launcher);
        let manager = TunnelManager::new(launcher.clone(), dir.path().to_path_buf());
        let spec = spec(free_port());
        let pid_killer = launcher.clone();
        let waiter = tokio::spawn(async move { manager.start(&spec).await });
        // The fake pid stays alive until we kill it, like an ssh that just
        // failed authentication and exited.
        while pid_killer.spawned().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for (_, _, pid) in pid_killer.spawned() {
            pid_killer.kill_out_of_band(pid);
        }
        let err = waiter.await.expect("join").expect_err("auth failure");
        assert!(matches!(
            err.downcast_ref::<TunnelError>(),
            Some(TunnelError::AuthFailed { .. })
        ));
    }

    #[tokio::test]
    async fn start_times_out_when_socket_never_appears() {
        let dir = tempfile::tempdir().expect("tempdir");
        let launcher = Arc::new(FakeLauncher::with_responder(|_| {
            CommandOutput::failure(255, "")
        }));
        let manager = TunnelManager::new(launcher.clone(), dir.path().to_path_buf())
            .with_socket_wait(Duration::from_millis(200));
        let err = manager.start(&spec(free_port())).await.expect_err("timeout");
        assert!(matches!(
            err.downcast_ref::<TunnelError>(),
            Some(TunnelError::StartTimeout { .. })
        ));
        assert_eq!(launcher.terminated().len(), 1);
    }

    #[tokio::test]
    async fn stop_when_stopped_is_ok() {
        let dir = tempfile::tempdir().expect("tempdir");
        let launcher = ssh_like_launcher();
        let manager = TunnelManager::new(launcher.clone(), dir.path().to_path_buf());
        let identity = TunnelIdentity::new("ops", "node1", 16443);
        let outcome = manager.stop(&identity).await.expect("stop");
        assert_eq!(outcome, StopOutcome::NotRunning);
        assert!(launcher.calls().is_empty());
    }

    #[tokio::test]
    async fn stop_tears_down_running_tunnel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let launcher = ssh_like_launcher();
        let manager = TunnelManager::new(launcher.clone(), dir.path().to_path_buf());
        let spec = spec(free_port());
        manager.start(&spec).await.expect("start");
        assert!(manager.status(&spec.identity).await.is_running());

        assert_eq!(manager.stop(&spec.identity).await.expect("stop"), StopOutcome::Stopped);
        assert_eq!(manager.status(&spec.identity).await, TunnelStatus::NotRunning);
        assert_eq!(
            manager.stop(&spec.identity).await.expect("stop again"),
            StopOutcome::NotRunning
        );
    }

    #[tokio::test]
    async fn stale_socket_reads_as_not_running_and_is_cleared_on_stop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let launcher = Arc::new(FakeLauncher::with_responder(|_| {
            CommandOutput::failure(255, "Control socket connect: Connection refused")
        }));
        let manager = TunnelManager::new(launcher.clone(), dir.path().to_path_buf());
        let identity = TunnelIdentity::new("ops", "node1", 16444);
        let socket = manager.control_path(&identity);
        std::fs::write(&socket, "").expect("stale socket");

        assert_eq!(manager.status(&identity).await, TunnelStatus::NotRunning);
        assert_eq!(manager.stop(&identity).await.expect("stop"), StopOutcome::NotRunning);
        assert!(!socket.exists());
    }
}
