//! A recording [`RemoteClient`] for engine tests.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::client::RemoteClient;
use crate::target::Target;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteCall {
    Execute {
        cmd: String,
        args: Vec<String>,
        env: Vec<(String, String)>,
        force_tty: bool,
    },
    Script {
        script: String,
        args: Vec<String>,
    },
    Upload {
        local: PathBuf,
        remote: String,
    },
    TestConnection,
    Raw {
        command: String,
        force_tty: bool,
    },
    Output {
        cmd: String,
        args: Vec<String>,
    },
}

impl RemoteCall {
    pub fn is_upload(&self) -> bool {
        matches!(self, RemoteCall::Upload { .. })
    }

    /// `cmd` for execute/output calls, `None` otherwise.
    pub fn command(&self) -> Option<&str> {
        match self {
            RemoteCall::Execute { cmd, .. } | RemoteCall::Output { cmd, .. } => Some(cmd),
            _ => None,
        }
    }
}

type Responder = Box<dyn Fn(&RemoteCall) -> anyhow::Result<String> + Send + Sync>;

pub struct FakeClient {
    target: Target,
    identity: Option<PathBuf>,
    responder: Responder,
    calls: Mutex<Vec<RemoteCall>>,
}

impl FakeClient {
    /// Every call succeeds; `output_command` returns an empty string.
    pub fn new(target: Target) -> Self {
        Self::with_responder(target, |_| Ok(String::new()))
    }

    pub fn with_responder<F>(target: Target, responder: F) -> Self
    where
        F: Fn(&RemoteCall) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        let identity = target.identity_file.clone();
        Self {
            target,
            identity,
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn record(&self, call: RemoteCall) -> anyhow::Result<String> {
        let result = (self.responder)(&call);
        self.calls.lock().expect("calls lock").push(call);
        result
    }
}

fn owned(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[async_trait]
impl RemoteClient for FakeClient {
    fn target(&self) -> &Target {
        &self.target
    }

    fn identity_file(&self) -> Option<&Path> {
        self.identity.as_deref()
    }

    async fn execute(&self, cmd: &str, args: &[&str], force_tty: bool) -> anyhow::Result<()> {
        self.record(RemoteCall::Execute {
            cmd: cmd.to_string(),
            args: owned(args),
            env: Vec::new(),
            force_tty,
        })
        .map(|_| ())
    }

    async fn execute_with_env(
        &self,
        cmd: &str,
        args: &[&str],
        env: &[(&str, &str)],
        force_tty: bool,
    ) -> anyhow::Result<()> {
        self.record(RemoteCall::Execute {
            cmd: cmd.to_string(),
            args: owned(args),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            force_tty,
        })
        .map(|_| ())
    }

    async fn execute_script(&self, script: &str, args: &[&str]) -> anyhow::Result<()> {
        self.record(RemoteCall::Script {
            script: script.to_string(),
            args: owned(args),
        })
        .map(|_| ())
    }

    async fn upload(&self, local: &Path, remote: &str) -> anyhow::Result<()> {
        self.record(RemoteCall::Upload {
            local: local.to_path_buf(),
            remote: remote.to_string(),
        })
        .map(|_| ())
    }

    async fn test_connection(&self) -> anyhow::Result<()> {
        self.record(RemoteCall::TestConnection).map(|_| ())
    }

    async fn run_command_string(&self, raw: &str, force_tty: bool) -> anyhow::Result<()> {
        self.record(RemoteCall::Raw {
            command: raw.to_string(),
            force_tty,
        })
        .map(|_| ())
    }

    async fn output_command(&self, cmd: &str, args: &[&str]) -> anyhow::Result<String> {
        self.record(RemoteCall::Output {
            cmd: cmd.to_string(),
            args: owned(args),
        })
    }
}
