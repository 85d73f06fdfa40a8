use anyhow::Context;
use remote_client::RemoteClient;
use tracing::{info, warn};

use crate::options::GitOptions;

/// Stands in for "not requested" so the script can tell it apart from an
/// empty string.
pub const UNSET: &str = "__NONE__";

const GIT_SYNC_SCRIPT: &str = r#"set -eu
repo_dir=$1
branch=$2
ref=$3
pull=$4

if [ ! -d "$repo_dir/.git" ]; then
  echo "rigger: no repository at ~/$repo_dir; run 'rigger provision' first" >&2
  exit 3
fi
cd -- "$repo_dir"
git fetch --all --prune

if [ "$ref" != "__NONE__" ]; then
  git checkout --detach "$ref"
elif [ "$branch" != "__NONE__" ]; then
  if git show-ref --verify --quiet "refs/heads/$branch"; then
    git checkout "$branch"
  else
    git checkout -b "$branch" --track "origin/$branch"
  fi
  if [ "$pull" = "true" ]; then
    git pull --ff-only
  fi
elif [ "$pull" = "true" ]; then
  echo "rigger: no branch requested; skipping pull" >&2
fi
"#;

/// Positional parameters for the sync script:
/// `(repo_dir, branch|__NONE__, ref|__NONE__, "true"|"false")`.
pub fn git_sync_args(repo_dir: &str, opts: &GitOptions) -> [String; 4] {
    let branch = opts.branch().unwrap_or(UNSET);
    let git_ref = opts.git_ref().unwrap_or(UNSET);
    let pull = match opts.git_ref() {
        Some(_) => false,
        None => opts.pull.unwrap_or(opts.branch().is_some()),
    };
    [
        repo_dir.to_string(),
        branch.to_string(),
        git_ref.to_string(),
        pull.to_string(),
    ]
}

/// Fetches, then checks out the requested ref or branch. Only a requested
/// branch is fast-forwarded.
pub async fn remote_git_sync(
    client: &dyn RemoteClient,
    repo_dir: &str,
    opts: &GitOptions,
) -> anyhow::Result<()> {
    if opts.git_ref().is_none() && opts.branch().is_none() && opts.pull == Some(true) {
        warn!(event = "remote.git.pull_ignored", "pull has no effect without --branch; skipping");
    }
    if opts.git_ref().is_some() {
        if opts.branch().is_some() {
            warn!(event = "remote.git.ref_overrides_branch", git_ref = ?opts.git_ref(), branch = ?opts.branch(), "ref overrides branch");
        }
        if opts.pull == Some(true) {
            warn!(event = "remote.git.pull_ignored", git_ref = ?opts.git_ref(), "pull has no effect on a detached ref; skipping");
        }
    }
    let args = git_sync_args(repo_dir, opts);
    info!(
        event = "remote.git.sync",
        target = %client.target().destination(),
        repo_dir,
        branch = %args[1],
        git_ref = %args[2],
        pull = %args[3],
        "syncing remote repository"
    );
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    client
        .execute_script(GIT_SYNC_SCRIPT, &args)
        .await
        .with_context(|| format!("git sync on {} failed", client.target().destination()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote_client::testing::{FakeClient, RemoteCall};
    use remote_client::Target;
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::process::{Command, Stdio};

    fn opts(branch: &str, git_ref: &str, pull: Option<bool>) -> GitOptions {
        GitOptions {
            branch: Some(branch.to_string()),
            git_ref: Some(git_ref.to_string()),
            pull,
        }
    }

    #[test]
    fn nothing_requested_but_pull() {
        assert_eq!(
            git_sync_args("rigger", &opts("", "", Some(true))),
            ["rigger", "__NONE__", "__NONE__", "true"]
        );
    }

    #[test]
    fn ref_overrides_branch_and_disables_pull() {
        assert_eq!(
            git_sync_args("rigger", &opts("main", "v1.2.0", Some(true))),
            ["rigger", "main", "v1.2.0", "false"]
        );
    }

    #[test]
    fn branch_pulls_unless_told_otherwise() {
        assert_eq!(
            git_sync_args("rigger", &opts("main", "", None)),
            ["rigger", "main", "__NONE__", "true"]
        );
        assert_eq!(
            git_sync_args("rigger", &opts("main", "", Some(false))),
            ["rigger", "main", "__NONE__", "false"]
        );
        assert_eq!(
            git_sync_args("rigger", &GitOptions::default()),
            ["rigger", "__NONE__", "__NONE__", "false"]
        );
    }

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(["-c", "user.name=rigger", "-c", "user.email=rigger@example.com"])
            .args(args)
            .current_dir(dir)
            .output()
            .expect("git");
        assert!(output.status.success(), "git {args:?}: {}", String::from_utf8_lossy(&output.stderr));
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Runs the sync script the way `bash -s` on the host would.
    fn run_script(cwd: &Path, args: [String; 4]) {
        let mut child = Command::new("bash")
            .arg("-s")
            .arg("--")
            .args(&args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .expect("bash");
        child
            .stdin
            .take()
            .expect("stdin")
            .write_all(GIT_SYNC_SCRIPT.as_bytes())
            .expect("write script");
        assert!(child.wait().expect("wait").success());
    }

    /// An upstream with one commit the clone at `<dir>/rigger` has not seen.
    fn clone_behind_upstream(dir: &Path) -> (PathBuf, String) {
        let upstream = dir.join("upstream");
        std::fs::create_dir(&upstream).expect("mkdir");
        git(&upstream, &["init", "-q"]);
        git(&upstream, &["commit", "-q", "--allow-empty", "-m", "first"]);
        git(dir, &["clone", "-q", "upstream", "rigger"]);
        git(&upstream, &["commit", "-q", "--allow-empty", "-m", "second"]);
        let upstream_head = git(&upstream, &["rev-parse", "HEAD"]);
        (dir.join("rigger"), upstream_head)
    }

    fn has_git() -> bool {
        system_utils::process::find_in_path("git", std::env::var_os("PATH").as_deref()).is_some()
    }

    #[test]
    fn bare_pull_leaves_the_checkout_alone() {
        if !has_git() {
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let (clone, _) = clone_behind_upstream(dir.path());
        let before = git(&clone, &["rev-parse", "HEAD"]);

        let args = git_sync_args(
            "rigger",
            &GitOptions {
                pull: Some(true),
                ..GitOptions::default()
            },
        );
        assert_eq!(args, ["rigger", "__NONE__", "__NONE__", "true"]);
        run_script(dir.path(), args);
        assert_eq!(git(&clone, &["rev-parse", "HEAD"]), before);
    }

    #[test]
    fn requested_branch_is_fast_forwarded() {
        if !has_git() {
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let (clone, upstream_head) = clone_behind_upstream(dir.path());
        let branch = git(&clone, &["symbolic-ref", "--short", "HEAD"]);

        let args = git_sync_args(
            "rigger",
            &GitOptions {
                branch: Some(branch),
                ..GitOptions::default()
            },
        );
        run_script(dir.path(), args);
        assert_eq!(git(&clone, &["rev-parse", "HEAD"]), upstream_head);
    }

    #[tokio::test]
    async fn sync_sends_one_script_with_positional_args() {
        let client = FakeClient::new(Target::new("node1"));
        remote_git_sync(&client, "rigger", &opts("feature/x", "", None))
            .await
            .expect("sync");
        let calls = client.calls();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            RemoteCall::Script { script, args } => {
                assert!(script.contains("git fetch --all --prune"));
                assert_eq!(args, &["rigger", "feature/x", "__NONE__", "true"]);
            }
            other => panic!("unexpected call {other:?}"),
        }
    }
}
