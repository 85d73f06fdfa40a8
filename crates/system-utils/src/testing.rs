//! A recording [`ProcessLauncher`] for tests that must not spawn anything.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::process::{CommandOutput, CommandSpec, ProcessLauncher};

type Responder = Box<dyn Fn(&CommandSpec) -> CommandOutput + Send + Sync>;
type SpawnHook = Box<dyn Fn(&CommandSpec, &Path) + Send + Sync>;

/// Records every command and answers from a caller-supplied responder.
/// Programs are "installed" only when listed with [`FakeLauncher::with_programs`].
pub struct FakeLauncher {
    responder: Responder,
    spawn_hook: Option<SpawnHook>,
    programs: HashSet<String>,
    calls: Mutex<Vec<CommandSpec>>,
    spawned: Mutex<Vec<(CommandSpec, PathBuf, u32)>>,
    alive: Mutex<HashSet<u32>>,
    terminated: Mutex<Vec<u32>>,
    next_pid: AtomicU32,
}

impl FakeLauncher {
    /// Every command succeeds with empty output.
    pub fn new() -> Self {
        Self::with_responder(|_| CommandOutput::success())
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&CommandSpec) -> CommandOutput + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            spawn_hook: None,
            programs: HashSet::new(),
            calls: Mutex::new(Vec::new()),
            spawned: Mutex::new(Vec::new()),
            alive: Mutex::new(HashSet::new()),
            terminated: Mutex::new(Vec::new()),
            next_pid: AtomicU32::new(40_000),
        }
    }

    pub fn with_programs<I, S>(mut self, programs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.programs.extend(programs.into_iter().map(Into::into));
        self
    }

    /// Called for every detached spawn, e.g. to create the files a real
    /// process would.
    pub fn with_spawn_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&CommandSpec, &Path) + Send + Sync + 'static,
    {
        self.spawn_hook = Some(Box::new(hook));
        self
    }

    /// Commands passed to `run` and `output`, in order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|spec| spec.program == program)
            .collect()
    }

    pub fn spawned(&self) -> Vec<(CommandSpec, PathBuf, u32)> {
        self.spawned.lock().expect("spawned lock").clone()
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().expect("terminated lock").clone()
    }

    pub fn set_alive(&self, pid: u32) {
        self.alive.lock().expect("alive lock").insert(pid);
    }

    /// Simulates a process dying without the manager's involvement.
    pub fn kill_out_of_band(&self, pid: u32) {
        self.alive.lock().expect("alive lock").remove(&pid);
    }

    fn record(&self, spec: &CommandSpec) -> CommandOutput {
        self.calls.lock().expect("calls lock").push(spec.clone());
        (self.responder)(spec)
    }
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn run(&self, spec: &CommandSpec) -> anyhow::Result<CommandOutput> {
        // Like the real launcher: stdout went to the terminal, stderr is kept.
        let mut output = self.record(spec);
        output.stdout.clear();
        Ok(output)
    }

    async fn output(&self, spec: &CommandSpec) -> anyhow::Result<CommandOutput> {
        Ok(self.record(spec))
    }

    fn spawn_detached(&self, spec: &CommandSpec, log: &Path) -> anyhow::Result<u32> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.spawned
            .lock()
            .expect("spawned lock")
            .push((spec.clone(), log.to_path_buf(), pid));
        self.set_alive(pid);
        if let Some(hook) = self.spawn_hook.as_ref() {
            hook(spec, log);
        }
        Ok(pid)
    }

    fn lookup(&self, program: &str) -> Option<PathBuf> {
        self.programs
            .contains(program)
            .then(|| PathBuf::from("/usr/bin").join(program))
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().expect("alive lock").contains(&pid)
    }

    fn terminate(&self, pid: u32) -> anyhow::Result<()> {
        self.terminated.lock().expect("terminated lock").push(pid);
        self.kill_out_of_band(pid);
        Ok(())
    }
}
