use std::path::PathBuf;

/// Which revision the remote checkout should be on.
///
/// `git_ref` wins over `branch`. `pull` only matters while a branch is
/// checked out; `None` means the caller did not ask either way.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GitOptions {
    pub branch: Option<String>,
    pub git_ref: Option<String>,
    pub pull: Option<bool>,
}

impl GitOptions {
    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref().filter(|value| !value.is_empty())
    }

    pub fn git_ref(&self) -> Option<&str> {
        self.git_ref.as_deref().filter(|value| !value.is_empty())
    }

    /// Whether a checkout was asked for. A bare `pull` is not one: without
    /// a branch there is nothing to fast-forward.
    pub fn is_requested(&self) -> bool {
        self.branch().is_some() || self.git_ref().is_some()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub force_tty: bool,
    pub env_file: Option<PathBuf>,
    pub git: GitOptions,
    /// Passed to the remote subcommand verbatim.
    pub args: Vec<String>,
}
