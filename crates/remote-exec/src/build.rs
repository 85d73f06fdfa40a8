use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use remote_client::RemoteClient;
use system_utils::{CommandSpec, ProcessLauncher};
use thiserror::Error;
use tracing::info;

use crate::BINARY_NAME;

/// CPU architectures a remote host may report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    Amd64,
    Arm64,
}

impl Arch {
    /// Static musl target, so the host needs no libc match and no toolchain.
    pub fn rust_target(self) -> &'static str {
        match self {
            Arch::Amd64 => "x86_64-unknown-linux-musl",
            Arch::Arm64 => "aarch64-unknown-linux-musl",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::Amd64 => f.write_str("amd64"),
            Arch::Arm64 => f.write_str("arm64"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("cargo not found on PATH; install Rust from https://rustup.rs and run `rustup target add x86_64-unknown-linux-musl aarch64-unknown-linux-musl`")]
    ToolchainMissing,

    #[error("unsupported remote architecture {0:?}; only amd64 (x86_64) and arm64 (aarch64) are supported")]
    UnsupportedArch(String),

    #[error("cargo build for {target} failed{detail}; if the target is missing run `rustup target add {target}`")]
    CompileFailed { target: &'static str, detail: String },

    #[error("cargo build succeeded but {} does not exist", .0.display())]
    ArtifactMissing(PathBuf),
}

/// Maps `uname -m` output to an [`Arch`].
pub fn map_arch(uname: &str) -> Result<Arch, BuildError> {
    match uname.trim() {
        "x86_64" | "amd64" => Ok(Arch::Amd64),
        "aarch64" | "arm64" => Ok(Arch::Arm64),
        other => Err(BuildError::UnsupportedArch(other.to_string())),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    Uploaded { arch: Arch },
    UpToDate { arch: Arch },
}

pub(crate) fn ensure_toolchain(launcher: &dyn ProcessLauncher) -> Result<PathBuf, BuildError> {
    launcher.lookup("cargo").ok_or(BuildError::ToolchainMissing)
}

pub(crate) async fn detect_arch(client: &dyn RemoteClient) -> anyhow::Result<Arch> {
    let uname = client
        .output_command("uname", &["-m"])
        .await
        .context("failed to detect remote architecture")?;
    Ok(map_arch(&uname)?)
}

/// Builds the release binary for `arch` under `target_dir` and returns its path.
pub(crate) async fn cross_build(
    launcher: &dyn ProcessLauncher,
    project_root: &Path,
    target_dir: &Path,
    arch: Arch,
) -> anyhow::Result<PathBuf> {
    let target = arch.rust_target();
    let spec = CommandSpec::new("cargo")
        .args(["build", "--release", "--target", target, "--bin", BINARY_NAME])
        .env("CARGO_TARGET_DIR", target_dir.to_string_lossy().to_string())
        .current_dir(project_root);
    info!(event = "remote.build.compile", %arch, target, project_root = %project_root.display(), "building remote binary");
    let output = launcher.run(&spec).await?;
    if !output.is_success() {
        let detail = match output.status {
            Some(code) => format!(" (exit {code})"),
            None => " (terminated by signal)".to_string(),
        };
        return Err(BuildError::CompileFailed { target, detail }.into());
    }
    let artifact = target_dir.join(target).join("release").join(BINARY_NAME);
    if !artifact.is_file() {
        return Err(BuildError::ArtifactMissing(artifact).into());
    }
    Ok(artifact)
}

/// Digest of the freshly built artifact, compared with the installed copy.
pub(crate) fn local_md5_hex(artifact: &Path) -> anyhow::Result<String> {
    let mut file = std::fs::File::open(artifact)
        .with_context(|| format!("cannot open build artifact {}", artifact.display()))?;
    let mut digest = md5::Context::new();
    std::io::copy(&mut file, &mut digest)
        .with_context(|| format!("cannot checksum build artifact {}", artifact.display()))?;
    Ok(format!("{:x}", digest.compute()))
}

/// `None` when the file is absent, md5sum is missing or the remote check fails.
pub(crate) async fn remote_md5_hex(client: &dyn RemoteClient, remote_path: &str) -> Option<String> {
    let md5_script = "if command -v md5sum >/dev/null 2>&1 && [ -f \"$1\" ]; then md5sum \"$1\"; fi; true";
    let output = client
        .output_command("sh", &["-c", md5_script, "rigger-md5", remote_path])
        .await
        .ok()?;
    output
        .split_whitespace()
        .next()
        .filter(|hash| !hash.is_empty())
        .map(str::to_string)
}

/// Uploads to a sibling temp path and renames it into place, so a running
/// binary is never overwritten half-written.
pub(crate) async fn install_binary(
    client: &dyn RemoteClient,
    local: &Path,
    remote_path: &str,
) -> anyhow::Result<()> {
    let remote_dir = remote_path
        .rsplit_once('/')
        .map(|(dir, _)| dir)
        .unwrap_or(".");
    let remote_tmp = format!("{remote_path}.tmp");
    client.execute("mkdir", &["-p", remote_dir], false).await?;
    client.upload(local, &remote_tmp).await?;
    client
        .execute("mv", &["-f", remote_tmp.as_str(), remote_path], false)
        .await?;
    client.execute("chmod", &["+x", remote_path], false).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_architectures_map() {
        assert_eq!(map_arch("x86_64").expect("amd64"), Arch::Amd64);
        assert_eq!(map_arch("aarch64\n").expect("arm64"), Arch::Arm64);
        assert_eq!(map_arch("arm64").expect("arm64"), Arch::Arm64);
        assert_eq!(Arch::Amd64.to_string(), "amd64");
        assert_eq!(Arch::Arm64.rust_target(), "aarch64-unknown-linux-musl");
    }

    #[test]
    fn anything_else_is_unsupported() {
        for uname in ["armv7l", "riscv64", "i686", ""] {
            assert!(matches!(map_arch(uname), Err(BuildError::UnsupportedArch(_))));
        }
    }

    #[test]
    fn md5_matches_reference() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bin");
        std::fs::write(&path, b"hello").expect("write");
        assert_eq!(
            local_md5_hex(&path).expect("md5"),
            "5d41402abc4b2a76b9719d911017c592"
        );
    }

    #[test]
    fn md5_of_missing_artifact_names_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = local_md5_hex(&dir.path().join("rigger")).expect_err("missing");
        assert!(err.to_string().starts_with("cannot open build artifact"));
    }
}
