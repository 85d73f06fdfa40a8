use std::fmt;
use std::path::{Path, PathBuf};

use system_utils::path::escape_component;

/// The tuple that names one tunnel. Two identities map to the same control
/// socket only if they are equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TunnelIdentity {
    pub user: String,
    pub host: String,
    pub local_port: u16,
}

impl TunnelIdentity {
    pub fn new(user: impl Into<String>, host: impl Into<String>, local_port: u16) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            local_port,
        }
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// `<dir>/tunnel-<user>@<host>-<port>.sock` with user and host
    /// percent-escaped. `@` and `%` are always escaped and the port is
    /// digits only, so the file name parses back to exactly one identity.
    pub fn control_path(&self, dir: &Path) -> PathBuf {
        dir.join(self.socket_name())
    }

    fn socket_name(&self) -> String {
        format!(
            "tunnel-{}@{}-{}.sock",
            escape_component(&self.user),
            escape_component(&self.host),
            self.local_port
        )
    }
}

impl fmt::Display for TunnelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.local_port)
    }
}
