//! Shared plumbing for every rigger crate: the process launcher capability,
//! POSIX shell quoting and local path helpers.

pub mod path;
pub mod process;
pub mod shell;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use process::{CommandOutput, CommandSpec, ProcessLauncher, SystemLauncher};
