use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::script::ScriptTemplate;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("no ssh identity to install; create one with `ssh-keygen -t ed25519` or pass --identity")]
    NoIdentity,

    #[error("failed to read public key {}", .path.display())]
    KeyUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("public key {} is empty; regenerate it with `ssh-keygen -y -f <private key>`", .path.display())]
    EmptyKey { path: PathBuf },

    #[error("public key {} has multiple lines; it must hold exactly one key", .path.display())]
    MultiLineKey { path: PathBuf },

    #[error("root@{host} refuses key login and {env} is not set; export it with the root password or install the key manually")]
    NoPassword { host: String, env: String },

    #[error("password login needs `{0}` on PATH; install it (e.g. `apt install sshpass openssh-client`)")]
    PasswordToolMissing(&'static str),

    #[error("installing the key for root@{host} failed; check the password in {env}")]
    KeyInstallFailed { host: String, env: String },

    #[error("root@{host} is still unreachable with the installed key")]
    RootUnreachable { host: String },
}

/// Runs as root. Positional parameters: `$1` public key, `$2` repo URL
/// (may be empty).
pub(crate) const PROVISION_SCRIPT: ScriptTemplate = ScriptTemplate::new(
    "provision",
    r#"set -euo pipefail
user='{{USER}}'
repo_dir='{{REPO_DIR}}'
pubkey=$1
repo_url=${2:-}

if command -v apt-get >/dev/null 2>&1; then
  export DEBIAN_FRONTEND=noninteractive
  apt-get update -y
  apt-get install -y git curl sudo ca-certificates
elif command -v dnf >/dev/null 2>&1; then
  dnf install -y git curl sudo ca-certificates
elif command -v yum >/dev/null 2>&1; then
  yum install -y git curl sudo ca-certificates
else
  echo "rigger: no supported package manager found" >&2
  exit 1
fi

if ! id -u "$user" >/dev/null 2>&1; then
  useradd --create-home --shell /bin/bash "$user"
fi
home_dir=$(getent passwd "$user" | cut -d: -f6)

install -d -m 700 -o "$user" "$home_dir/.ssh"
auth_keys="$home_dir/.ssh/authorized_keys"
touch "$auth_keys"
if ! grep -qxF -- "$pubkey" "$auth_keys"; then
  printf '%s\n' "$pubkey" >> "$auth_keys"
fi
chown "$user" "$auth_keys"
chmod 600 "$auth_keys"

sudoers="/etc/sudoers.d/90-rigger-$user"
printf '%s ALL=(ALL) NOPASSWD:ALL\n' "$user" > "$sudoers"
chmod 440 "$sudoers"

if [ -n "$repo_url" ]; then
  if [ -d "$home_dir/$repo_dir/.git" ]; then
    sudo -u "$user" -H git -C "$home_dir/$repo_dir" fetch --all --prune
  else
    sudo -u "$user" -H git clone "$repo_url" "$home_dir/$repo_dir"
  fi
fi
"#,
);

/// `<identity>.pub`, e.g. `~/.ssh/id_ed25519.pub`.
pub(crate) fn public_key_path(identity: &Path) -> PathBuf {
    let mut path = identity.as_os_str().to_owned();
    path.push(".pub");
    PathBuf::from(path)
}

/// Reads the public key and checks it is exactly one non-empty line.
pub fn validate_public_key(path: &Path) -> Result<String, ProvisionError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ProvisionError::KeyUnreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let key = contents.trim();
    if key.is_empty() {
        return Err(ProvisionError::EmptyKey {
            path: path.to_path_buf(),
        });
    }
    if key.lines().count() != 1 {
        return Err(ProvisionError::MultiLineKey {
            path: path.to_path_buf(),
        });
    }
    Ok(key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_file(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("id_ed25519.pub");
        std::fs::write(&path, contents).expect("write");
        (dir, path)
    }

    #[test]
    fn public_key_sits_next_to_identity() {
        assert_eq!(
            public_key_path(Path::new("/home/ops/.ssh/id_ed25519")),
            PathBuf::from("/home/ops/.ssh/id_ed25519.pub")
        );
    }

    #[test]
    fn single_line_key_is_trimmed() {
        let (_dir, path) = key_file("ssh-ed25519 AAAA ops@laptop\n\n");
        assert_eq!(
            validate_public_key(&path).expect("valid"),
            "ssh-ed25519 AAAA ops@laptop"
        );
    }

    #[test]
    fn blank_key_is_empty() {
        let (_dir, path) = key_file(" \n\t\n");
        assert!(matches!(
            validate_public_key(&path),
            Err(ProvisionError::EmptyKey { .. })
        ));
    }

    #[test]
    fn two_keys_are_rejected() {
        let (_dir, path) = key_file("ssh-ed25519 AAAA a\nssh-rsa BBBB b\n");
        assert!(matches!(
            validate_public_key(&path),
            Err(ProvisionError::MultiLineKey { .. })
        ));
    }

    #[test]
    fn script_renders_with_user_and_repo_dir() {
        let script = PROVISION_SCRIPT
            .render(&[("USER", "ops"), ("REPO_DIR", "rigger")])
            .expect("render");
        assert!(script.contains("user='ops'"));
        assert!(script.contains("repo_dir='rigger'"));
        assert!(script.contains("grep -qxF -- \"$pubkey\""));
    }
}
