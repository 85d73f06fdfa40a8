use std::fmt;
use std::path::{Path, PathBuf};

use system_utils::path::escape_component;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PortForwardIdentity {
    pub namespace: String,
    pub local_port: u16,
}

impl PortForwardIdentity {
    pub fn new(namespace: impl Into<String>, local_port: u16) -> Self {
        Self {
            namespace: namespace.into(),
            local_port,
        }
    }

    pub fn pid_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.pid", self.stem()))
    }

    pub fn log_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.log", self.stem()))
    }

    fn stem(&self) -> String {
        format!(
            "port-forward-{}-{}",
            escape_component(&self.namespace),
            self.local_port
        )
    }
}

impl fmt::Display for PortForwardIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.local_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_share_a_stem() {
        let id = PortForwardIdentity::new("apps", 8080);
        let dir = Path::new("/run/rigger");
        assert_eq!(
            id.pid_path(dir),
            PathBuf::from("/run/rigger/port-forward-apps-8080.pid")
        );
        assert_eq!(
            id.log_path(dir),
            PathBuf::from("/run/rigger/port-forward-apps-8080.log")
        );
    }

    #[test]
    fn namespace_cannot_escape_the_directory() {
        let id = PortForwardIdentity::new("../etc", 1);
        let path = id.pid_path(Path::new("/run/rigger"));
        assert_eq!(path.parent(), Some(Path::new("/run/rigger")));
    }
}
