//! Commands that run on the target itself, started there by
//! `rigger remote run`. Each one hands off to `scripts/<name>.sh` in the
//! synced repository; with `RIGGER_DRY_RUN` set it only prints the plan.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use system_utils::shell::join_escaped;
use system_utils::{CommandSpec, ProcessLauncher};
use tracing::info;

pub(crate) const DRY_RUN_ENV: &str = "RIGGER_DRY_RUN";
/// Overrides where the repository checkout is looked up.
pub(crate) const REPO_DIR_ENV: &str = "RIGGER_REPO_DIR";
pub(crate) const JOIN_SERVER_ENV: &str = "RIGGER_JOIN_SERVER";
pub(crate) const JOIN_TOKEN_ENV: &str = "RIGGER_JOIN_TOKEN";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NodeAction {
    Init,
    Join,
    Status,
    Doctor,
    Reset,
    Upgrade,
}

impl NodeAction {
    pub(crate) fn name(self) -> &'static str {
        match self {
            NodeAction::Init => "init",
            NodeAction::Join => "join",
            NodeAction::Status => "status",
            NodeAction::Doctor => "doctor",
            NodeAction::Reset => "reset",
            NodeAction::Upgrade => "upgrade",
        }
    }

    fn script(self) -> PathBuf {
        Path::new("scripts").join(format!("{}.sh", self.name()))
    }
}

impl fmt::Display for NodeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct JoinCredentials {
    pub(crate) server: Option<String>,
    pub(crate) token: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct NodeRequest {
    pub(crate) action: NodeAction,
    pub(crate) repo_dir: PathBuf,
    pub(crate) args: Vec<String>,
    pub(crate) join: JoinCredentials,
    pub(crate) dry_run: bool,
}

/// `1`, `true`, `yes` and `on` turn dry-run on; anything else leaves it to
/// the `--dry-run` flag.
pub(crate) fn dry_run_requested(flag: bool, env_value: Option<&str>) -> bool {
    flag || env_value.is_some_and(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

pub(crate) fn repo_dir(env_value: Option<String>) -> PathBuf {
    env_value
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(remote_exec::REMOTE_REPO_DIR))
}

/// Extra environment the script receives. Join needs both credentials and
/// an https server URL.
fn script_env(request: &NodeRequest) -> anyhow::Result<Vec<(String, String)>> {
    if request.action != NodeAction::Join {
        return Ok(Vec::new());
    }
    let server = request.join.server.as_deref().filter(|value| !value.is_empty());
    let token = request.join.token.as_deref().filter(|value| !value.is_empty());
    let (Some(server), Some(token)) = (server, token) else {
        anyhow::bail!(
            "join needs --server/{JOIN_SERVER_ENV} and --token/{JOIN_TOKEN_ENV}"
        );
    };
    if !server.starts_with("https://") {
        anyhow::bail!("join server must be an https:// URL, got {server:?}");
    }
    Ok(vec![
        (JOIN_SERVER_ENV.to_string(), server.to_string()),
        (JOIN_TOKEN_ENV.to_string(), token.to_string()),
    ])
}

/// Runs the bootstrap script for `request` and returns the exit status to
/// report. A dry run validates the request, prints the plan and returns 0.
pub(crate) async fn execute(launcher: &dyn ProcessLauncher, request: &NodeRequest) -> anyhow::Result<u8> {
    let env = script_env(request)?;
    let script = request.repo_dir.join(request.action.script());
    let script_arg = script.to_string_lossy().to_string();
    let command_line = join_escaped(
        ["bash", script_arg.as_str()]
            .into_iter()
            .chain(request.args.iter().map(String::as_str)),
    );

    if request.dry_run {
        let presence = if script.is_file() { "" } else { " (script not present yet)" };
        let env_keys: Vec<&str> = env.iter().map(|(key, _)| key.as_str()).collect();
        println!("dry run: {} would execute {command_line}{presence}", request.action);
        if !env_keys.is_empty() {
            println!("dry run: with {}", env_keys.join(", "));
        }
        info!(event = "node.dry_run", action = %request.action, "nothing executed");
        return Ok(0);
    }

    if !script.is_file() {
        anyhow::bail!(
            "no bootstrap script at {}; sync the repository with `rigger remote sync` from your workstation",
            script.display()
        );
    }
    let mut spec = CommandSpec::new("bash")
        .arg(script_arg)
        .args(request.args.iter().cloned());
    for (key, value) in env {
        spec = spec.env(key, value);
    }
    info!(event = "node.run", action = %request.action, command = %command_line, "starting bootstrap script");
    let output = launcher
        .run(&spec)
        .await
        .with_context(|| format!("failed to start {}", script.display()))?;
    match output.status {
        Some(0) => Ok(0),
        Some(code) => Ok(u8::try_from(code).unwrap_or(1).max(1)),
        None => Ok(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use system_utils::testing::FakeLauncher;
    use system_utils::CommandOutput;

    fn request(action: NodeAction, repo_dir: &Path) -> NodeRequest {
        NodeRequest {
            action,
            repo_dir: repo_dir.to_path_buf(),
            args: Vec::new(),
            join: JoinCredentials::default(),
            dry_run: false,
        }
    }

    fn with_script(dir: &Path, action: NodeAction) {
        let scripts = dir.join("scripts");
        std::fs::create_dir_all(&scripts).expect("mkdir");
        std::fs::write(scripts.join(format!("{action}.sh")), "exit 0\n").expect("write");
    }

    #[test]
    fn dry_run_values() {
        assert!(dry_run_requested(true, None));
        assert!(dry_run_requested(false, Some("1")));
        assert!(dry_run_requested(false, Some(" TRUE ")));
        assert!(!dry_run_requested(false, Some("0")));
        assert!(!dry_run_requested(false, Some("")));
        assert!(!dry_run_requested(false, None));
    }

    #[test]
    fn repo_dir_defaults_to_the_checkout_name() {
        assert_eq!(repo_dir(None), PathBuf::from("rigger"));
        assert_eq!(repo_dir(Some(" ".to_string())), PathBuf::from("rigger"));
        assert_eq!(repo_dir(Some("/srv/rigger".to_string())), PathBuf::from("/srv/rigger"));
    }

    #[tokio::test]
    async fn dry_run_launches_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let launcher = FakeLauncher::new();
        let mut req = request(NodeAction::Init, dir.path());
        req.dry_run = true;
        assert_eq!(execute(&launcher, &req).await.expect("dry run"), 0);
        assert!(launcher.calls().is_empty());
    }

    #[tokio::test]
    async fn join_dry_run_still_checks_credentials() {
        let dir = tempfile::tempdir().expect("tempdir");
        let launcher = FakeLauncher::new();
        let mut req = request(NodeAction::Join, dir.path());
        req.dry_run = true;
        let err = execute(&launcher, &req).await.expect_err("no credentials");
        assert!(err.to_string().contains(JOIN_SERVER_ENV));

        req.join = JoinCredentials {
            server: Some("https://203.0.113.10:6443".to_string()),
            token: Some("K10smoke::server:dummy-token".to_string()),
        };
        assert_eq!(execute(&launcher, &req).await.expect("dry run"), 0);

        req.join.server = Some("203.0.113.10:6443".to_string());
        let err = execute(&launcher, &req).await.expect_err("not https");
        assert!(err.to_string().contains("https://"));
        assert!(launcher.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_script_points_at_sync() {
        let dir = tempfile::tempdir().expect("tempdir");
        let launcher = FakeLauncher::new();
        let err = execute(&launcher, &request(NodeAction::Upgrade, dir.path()))
            .await
            .expect_err("no script");
        assert!(err.to_string().contains("rigger remote sync"));
        assert!(launcher.calls().is_empty());
    }

    #[tokio::test]
    async fn script_receives_args_and_join_env() {
        let dir = tempfile::tempdir().expect("tempdir");
        with_script(dir.path(), NodeAction::Join);
        let launcher = FakeLauncher::new();
        let mut req = request(NodeAction::Join, dir.path());
        req.args = vec!["--node-name".to_string(), "worker 1".to_string()];
        req.join = JoinCredentials {
            server: Some("https://10.0.0.1:6443".to_string()),
            token: Some("secret".to_string()),
        };
        assert_eq!(execute(&launcher, &req).await.expect("join"), 0);

        let calls = launcher.calls_to("bash");
        assert_eq!(calls.len(), 1);
        let script = dir.path().join("scripts/join.sh").to_string_lossy().to_string();
        assert_eq!(calls[0].args, vec![script.as_str(), "--node-name", "worker 1"]);
        assert_eq!(
            calls[0].envs,
            vec![
                (JOIN_SERVER_ENV.to_string(), "https://10.0.0.1:6443".to_string()),
                (JOIN_TOKEN_ENV.to_string(), "secret".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn script_failure_becomes_the_exit_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        with_script(dir.path(), NodeAction::Reset);
        let launcher = FakeLauncher::with_responder(|_| CommandOutput::failure(3, "boom"));
        let status = execute(&launcher, &request(NodeAction::Reset, dir.path()))
            .await
            .expect("ran");
        assert_eq!(status, 3);
    }
}
