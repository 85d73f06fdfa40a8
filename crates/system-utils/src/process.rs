use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, Command};
use tracing::debug;

const STDERR_TAIL_BYTES: usize = 8 * 1024;

/// A fully described external command. Launchers never see a shell string
/// for local commands; arguments are passed to the OS verbatim.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    pub stdin: Option<Vec<u8>>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Position of `value` in the argument list, if present.
    pub fn arg_position(&self, value: &str) -> Option<usize> {
        self.args.iter().position(|arg| arg == value)
    }

    pub fn has_arg(&self, value: &str) -> bool {
        self.arg_position(value).is_some()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Exit code plus whatever output was captured. After `run`, stdout is
/// empty and stderr holds the tail of what was also shown on the terminal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success() -> Self {
        Self {
            status: Some(0),
            ..Self::default()
        }
    }

    pub fn failure(code: i32, stderr: &str) -> Self {
        Self {
            status: Some(code),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    pub fn with_stdout(mut self, stdout: &str) -> Self {
        self.stdout = stdout.as_bytes().to_vec();
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// Captured stdout and stderr joined and trimmed, for error messages.
    pub fn detail(&self) -> String {
        format!("{}{}", self.stdout_lossy(), self.stderr_lossy())
            .trim()
            .to_string()
    }
}

/// Everything rigger needs from the operating system's process table.
///
/// Managers and clients receive an implementation in their constructor so
/// tests can substitute a recording fake and never touch the network.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Runs to completion with stdout inherited from this process. Stderr is
    /// passed through to ours and its tail kept in the returned output.
    /// Stdin is inherited unless `stdin` holds bytes to pipe in.
    async fn run(&self, spec: &CommandSpec) -> anyhow::Result<CommandOutput>;

    /// Runs to completion with stdout/stderr captured.
    async fn output(&self, spec: &CommandSpec) -> anyhow::Result<CommandOutput>;

    /// Starts a process in its own process group with stdout/stderr appended
    /// to `log`, and returns its pid without waiting for it.
    fn spawn_detached(&self, spec: &CommandSpec, log: &Path) -> anyhow::Result<u32>;

    /// Resolves a program name against `PATH`.
    fn lookup(&self, program: &str) -> Option<PathBuf>;

    fn is_alive(&self, pid: u32) -> bool;

    /// Sends SIGTERM. A pid that no longer exists is not an error.
    fn terminate(&self, pid: u32) -> anyhow::Result<()>;
}

/// The real launcher backed by tokio and the OS.
#[derive(Default)]
pub struct SystemLauncher {
    // Children spawned by this process must be reaped here, otherwise they
    // linger as zombies and still answer kill(pid, 0).
    detached: Mutex<HashMap<u32, std::process::Child>>,
}

impl SystemLauncher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessLauncher for SystemLauncher {
    async fn run(&self, spec: &CommandSpec) -> anyhow::Result<CommandOutput> {
        debug!(command = %spec, "running command");
        let mut cmd = build_command(spec);
        cmd.stdout(Stdio::inherit()).stderr(Stdio::piped());
        if spec.stdin.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::inherit());
        }
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to start {}", spec.program))?;
        if let (Some(input), Some(mut pipe)) = (spec.stdin.as_ref(), child.stdin.take()) {
            pipe.write_all(input)
                .await
                .with_context(|| format!("failed to write stdin of {}", spec.program))?;
            drop(pipe);
        }
        let stderr = child.stderr.take();
        let (status, stderr) = tokio::join!(child.wait(), tee_stderr(stderr));
        let status = status.with_context(|| format!("{} failed", spec.program))?;
        Ok(CommandOutput {
            status: status.code(),
            stdout: Vec::new(),
            stderr,
        })
    }

    async fn output(&self, spec: &CommandSpec) -> anyhow::Result<CommandOutput> {
        debug!(command = %spec, "capturing command output");
        let mut cmd = build_command(spec);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        if spec.stdin.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to start {}", spec.program))?;
        if let (Some(input), Some(mut pipe)) = (spec.stdin.as_ref(), child.stdin.take()) {
            pipe.write_all(input)
                .await
                .with_context(|| format!("failed to write stdin of {}", spec.program))?;
            drop(pipe);
        }
        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("{} failed", spec.program))?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn spawn_detached(&self, spec: &CommandSpec, log: &Path) -> anyhow::Result<u32> {
        if let Some(parent) = log.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)
            .with_context(|| format!("failed to open {}", log.display()))?;
        let err_file = log_file
            .try_clone()
            .with_context(|| format!("failed to open {}", log.display()))?;

        let mut cmd = std::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(err_file));
        if let Some(dir) = spec.current_dir.as_ref() {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to start {}", spec.program))?;
        let pid = child.id();
        debug!(command = %spec, pid, log = %log.display(), "spawned detached process");
        if let Ok(mut detached) = self.detached.lock() {
            detached.insert(pid, child);
        }
        Ok(pid)
    }

    fn lookup(&self, program: &str) -> Option<PathBuf> {
        find_in_path(program, std::env::var_os("PATH").as_deref())
    }

    fn is_alive(&self, pid: u32) -> bool {
        if let Ok(mut detached) = self.detached.lock() {
            if let Some(child) = detached.get_mut(&pid) {
                match child.try_wait() {
                    Ok(None) => return true,
                    Ok(Some(_)) | Err(_) => {
                        detached.remove(&pid);
                        return false;
                    }
                }
            }
        }
        pid_alive(pid)
    }

    fn terminate(&self, pid: u32) -> anyhow::Result<()> {
        signal_terminate(pid)?;
        if let Ok(mut detached) = self.detached.lock() {
            if let Some(mut child) = detached.remove(&pid) {
                let _ = child.wait();
            }
        }
        Ok(())
    }
}

/// Copies a child's stderr to ours as it arrives and returns the last
/// [`STDERR_TAIL_BYTES`] of it.
async fn tee_stderr(pipe: Option<ChildStderr>) -> Vec<u8> {
    let Some(mut pipe) = pipe else {
        return Vec::new();
    };
    let mut out = tokio::io::stderr();
    let mut tail = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let read = match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                debug!(error = %err, "stopped reading child stderr");
                break;
            }
        };
        let _ = out.write_all(&chunk[..read]).await;
        let _ = out.flush().await;
        tail.extend_from_slice(&chunk[..read]);
        if tail.len() > STDERR_TAIL_BYTES {
            tail.drain(..tail.len() - STDERR_TAIL_BYTES);
        }
    }
    tail
}

fn build_command(spec: &CommandSpec) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);
    for (key, value) in &spec.envs {
        cmd.env(key, value);
    }
    if let Some(dir) = spec.current_dir.as_ref() {
        cmd.current_dir(dir);
    }
    cmd
}

/// Searches each `PATH` entry for an executable regular file named
/// `program`. Names containing a slash are checked as-is.
pub fn find_in_path(program: &str, path_var: Option<&std::ffi::OsStr>) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }
    let path_var = path_var?;
    std::env::split_paths(path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // EPERM means the process exists but belongs to someone else.
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn signal_terminate(pid: u32) -> anyhow::Result<()> {
    let raw = libc::pid_t::try_from(pid).with_context(|| format!("invalid pid {pid}"))?;
    if raw <= 0 {
        anyhow::bail!("invalid pid {pid}");
    }
    let result = unsafe { libc::kill(raw, libc::SIGTERM) };
    if result == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(anyhow::anyhow!(err).context(format!("failed to signal pid {pid}")))
}

#[cfg(not(unix))]
fn signal_terminate(pid: u32) -> anyhow::Result<()> {
    anyhow::bail!("terminating pid {pid} is only supported on unix")
}
