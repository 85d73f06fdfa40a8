use std::io;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use system_utils::path::{ensure_private_dir, runtime_dir};
use system_utils::{CommandSpec, ProcessLauncher};
use thiserror::Error;
use tracing::{info, warn};

use crate::identity::PortForwardIdentity;
use crate::pidfile::{read_pid_file, remove_pid_file, write_pid_file};

const SETTLE_WINDOW: Duration = Duration::from_secs(2);
const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const EARLY_EXIT_LOG_LINES: usize = 20;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortForwardSpec {
    pub identity: PortForwardIdentity,
    /// `svc/<name>`, `pod/<name>` or anything else kubectl accepts.
    pub resource: String,
    pub remote_port: u16,
}

impl PortForwardSpec {
    fn command(&self) -> CommandSpec {
        CommandSpec::new("kubectl")
            .arg("port-forward")
            .arg("-n")
            .arg(&self.identity.namespace)
            .arg(&self.resource)
            .arg(format!("{}:{}", self.identity.local_port, self.remote_port))
            .arg("--address")
            .arg("127.0.0.1")
    }
}

#[derive(Debug, Error)]
pub enum PortForwardError {
    #[error("kubectl not found on PATH; install it or use `rigger tunnel start` to reach the API server")]
    KubectlMissing,

    /// Held by something other than a forward we track.
    #[error("local port {port} is already in use by another process; pick another --local-port")]
    PortInUse {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("kubectl port-forward for {identity} exited right after starting:\n{log_tail}")]
    ExitedEarly {
        identity: PortForwardIdentity,
        log_tail: String,
    },

    #[error("nothing accepted connections on 127.0.0.1:{port} within {}s", .timeout.as_secs_f32())]
    NotReady { port: u16, timeout: Duration },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyRunning { pid: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped { pid: u32 },
    NotRunning,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortForwardStatus {
    Running { pid: u32 },
    Stopped,
}

impl PortForwardStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, PortForwardStatus::Running { .. })
    }
}

pub struct PortForwardManager {
    launcher: Arc<dyn ProcessLauncher>,
    state_dir: PathBuf,
    settle: Duration,
}

impl PortForwardManager {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, state_dir: PathBuf) -> Self {
        Self {
            launcher,
            state_dir,
            settle: SETTLE_WINDOW,
        }
    }

    pub fn with_runtime_dir(launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self::new(launcher, runtime_dir())
    }

    /// How long a fresh kubectl must survive before start reports success.
    pub fn with_settle_window(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn pid_path(&self, identity: &PortForwardIdentity) -> PathBuf {
        identity.pid_path(&self.state_dir)
    }

    pub fn log_path(&self, identity: &PortForwardIdentity) -> PathBuf {
        identity.log_path(&self.state_dir)
    }

    /// Reads the pid file. Anything that does not name a live process reads
    /// as stopped and the pid file is removed.
    pub fn status(&self, identity: &PortForwardIdentity) -> PortForwardStatus {
        let pid_path = self.pid_path(identity);
        let pid = match read_pid_file(&pid_path) {
            Ok(Some(pid)) => pid,
            Ok(None) => return PortForwardStatus::Stopped,
            Err(err) => {
                warn!(event = "port_forward.pidfile.invalid", forward = %identity, error = %err, "discarding unreadable pid file");
                self.clear(&pid_path);
                return PortForwardStatus::Stopped;
            }
        };
        if self.launcher.is_alive(pid) {
            PortForwardStatus::Running { pid }
        } else {
            info!(event = "port_forward.stale", forward = %identity, pid, "tracked kubectl is gone");
            self.clear(&pid_path);
            PortForwardStatus::Stopped
        }
    }

    pub async fn start(&self, spec: &PortForwardSpec) -> anyhow::Result<StartOutcome> {
        let identity = &spec.identity;
        if let PortForwardStatus::Running { pid } = self.status(identity) {
            info!(event = "port_forward.start.skip", forward = %identity, pid, "port-forward already running");
            return Ok(StartOutcome::AlreadyRunning { pid });
        }
        if self.launcher.lookup("kubectl").is_none() {
            return Err(PortForwardError::KubectlMissing.into());
        }
        ensure_port_free(identity.local_port)?;

        ensure_private_dir(&self.state_dir)?;
        let pid_path = self.pid_path(identity);
        let log_path = self.log_path(identity);
        let pid = self
            .launcher
            .spawn_detached(&spec.command(), &log_path)
            .with_context(|| format!("failed to start kubectl port-forward for {identity}"))?;
        write_pid_file(&pid_path, pid)
            .with_context(|| format!("failed to write {}", pid_path.display()))?;
        info!(
            event = "port_forward.spawned",
            forward = %identity,
            pid,
            resource = %spec.resource,
            remote_port = spec.remote_port,
            "kubectl port-forward spawned"
        );

        let started = Instant::now();
        while started.elapsed() < self.settle {
            if !self.launcher.is_alive(pid) {
                self.clear(&pid_path);
                return Err(PortForwardError::ExitedEarly {
                    identity: identity.clone(),
                    log_tail: tail_lines(&log_path, EARLY_EXIT_LOG_LINES).join("\n"),
                }
                .into());
            }
            tokio::time::sleep(SETTLE_POLL_INTERVAL).await;
        }
        Ok(StartOutcome::Started { pid })
    }

    pub fn stop(&self, identity: &PortForwardIdentity) -> anyhow::Result<StopOutcome> {
        let PortForwardStatus::Running { pid } = self.status(identity) else {
            return Ok(StopOutcome::NotRunning);
        };
        self.launcher
            .terminate(pid)
            .with_context(|| format!("failed to stop kubectl port-forward {identity} (pid {pid})"))?;
        self.clear(&self.pid_path(identity));
        info!(event = "port_forward.stop", forward = %identity, pid, "port-forward stopped");
        Ok(StopOutcome::Stopped { pid })
    }

    pub async fn wait_ready(
        &self,
        identity: &PortForwardIdentity,
        timeout: Duration,
    ) -> Result<(), PortForwardError> {
        crate::ready::wait_ready(identity.local_port, timeout).await
    }

    /// The last `lines` lines of the forward's log, oldest first.
    pub fn log_tail(&self, identity: &PortForwardIdentity, lines: usize) -> Vec<String> {
        tail_lines(&self.log_path(identity), lines)
    }

    fn clear(&self, pid_path: &Path) {
        if let Err(err) = remove_pid_file(pid_path) {
            warn!(event = "port_forward.pidfile.remove_failed", path = %pid_path.display(), error = %err, "failed to remove pid file");
        }
    }
}

fn ensure_port_free(port: u16) -> Result<(), PortForwardError> {
    TcpListener::bind(("127.0.0.1", port))
        .map(drop)
        .map_err(|source| PortForwardError::PortInUse { port, source })
}

fn tail_lines(path: &Path, lines: usize) -> Vec<String> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            warn!(event = "port_forward.log.read_failed", path = %path.display(), error = %err, "failed to read log");
            return Vec::new();
        }
    };
    let all: Vec<&str> = contents.lines().collect();
    let skip = all.len().saturating_sub(lines);
    all[skip..].iter().map(|line| line.to_string()).collect()
}
