//! Multi-step operations against a remote host: provisioning, syncing the
//! repository, cross-building and uploading the binary, and running it.
//!
//! Every step talks to the host through a [`remote_client::RemoteClient`]
//! and to the local machine through a [`system_utils::ProcessLauncher`].
//! Nothing is retried; a failed precondition names the command that fixes it.

mod build;
mod engine;
pub mod envfile;
mod git;
mod options;
mod provision;
mod run;
mod script;
mod smoke;

pub use build::{map_arch, Arch, BuildError, BuildOutcome};
pub use engine::{RemoteEngine, ROOT_PASSWORD_ENV};
pub use envfile::EnvFileError;
pub use git::{git_sync_args, remote_git_sync, UNSET};
pub use options::{GitOptions, RunOptions};
pub use provision::{validate_public_key, ProvisionError};
pub use run::{RunError, ALLOWED_SUBCOMMANDS};
pub use script::{ScriptError, ScriptTemplate};

/// Repository checkout, relative to the remote login directory.
pub const REMOTE_REPO_DIR: &str = "rigger";
/// Installed binary, relative to the remote login directory.
pub const REMOTE_BIN_PATH: &str = ".local/bin/rigger";
/// Name of the binary target built for the remote host.
pub const BINARY_NAME: &str = "rigger";
