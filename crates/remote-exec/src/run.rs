use system_utils::shell::{join_escaped, shell_escape};
use thiserror::Error;

/// Subcommands the remote binary may be asked to run.
pub const ALLOWED_SUBCOMMANDS: &[&str] = &["init", "join", "status", "doctor", "reset", "upgrade"];

/// `$1` is the env file or empty, the rest is the command to exec.
const RUN_WRAPPER: &str =
    r#"set -e; env_file=$1; shift; if [ -n "$env_file" ]; then set -a; . "$env_file"; set +a; fi; exec "$@""#;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("unsupported subcommand {0:?}; expected one of: {}", ALLOWED_SUBCOMMANDS.join(", "))]
    UnsupportedSubcommand(String),

    #[error("{detail}\ncannot reach {destination} as the deploy user; run `rigger provision` first")]
    Unreachable { destination: String, detail: String },

    #[error("repository ~/{repo_dir} is missing on {destination}; run `rigger provision` (with repo_url set)")]
    RepoMissing { destination: String, repo_dir: String },

    #[error("binary ~/{bin_path} is missing on {destination}; run `rigger remote build`")]
    BinaryMissing { destination: String, bin_path: String },
}

pub(crate) fn check_subcommand(subcommand: &str) -> Result<(), RunError> {
    if ALLOWED_SUBCOMMANDS.contains(&subcommand) {
        Ok(())
    } else {
        Err(RunError::UnsupportedSubcommand(subcommand.to_string()))
    }
}

/// The escaped remote command line: a root shell that loads `env_path`
/// (when given) and then execs `bin subcommand args...` unchanged.
pub(crate) fn wrapper_command(
    env_path: Option<&str>,
    bin_path: &str,
    subcommand: &str,
    args: &[String],
) -> String {
    let mut positional = vec![env_path.unwrap_or(""), bin_path, subcommand];
    positional.extend(args.iter().map(String::as_str));
    format!(
        "sudo -E bash -c {} rigger-run {}",
        shell_escape(RUN_WRAPPER),
        join_escaped(positional)
    )
}

/// Env files get a fresh name per run so concurrent runs never share one.
pub(crate) fn remote_env_path() -> String {
    format!("./.rigger-run-{}.env", uuid::Uuid::new_v4().simple())
}
