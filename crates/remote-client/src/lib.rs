//! The single point of contact with a remote host.
//!
//! Every remote interaction goes through [`RemoteClient`]. The production
//! implementation, [`SshClient`], shells out to `ssh`/`scp` through an
//! injected [`system_utils::ProcessLauncher`], quoting every argument so the
//! remote shell never word-splits or globs caller data.

mod client;
mod error;
mod target;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{connection_options, select_identity, RemoteClient, SshClient};
pub use error::{looks_like_auth_failure, RemoteError};
pub use target::{Target, TargetDefaults, DEFAULT_USER};
