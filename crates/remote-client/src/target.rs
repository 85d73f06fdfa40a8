use std::path::PathBuf;

pub const DEFAULT_USER: &str = "rigger";

/// One remote host and how to log into it. Built per invocation from flags
/// and config; never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    user: String,
    user_explicit: bool,
    pub identity_file: Option<PathBuf>,
    pub repo_url: Option<String>,
    pub config_path: Option<PathBuf>,
}

/// Values loaded from a config file. They only fill gaps in a [`Target`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetDefaults {
    pub host: Option<String>,
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub repo_url: Option<String>,
}

impl Target {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: DEFAULT_USER.to_string(),
            user_explicit: false,
            identity_file: None,
            repo_url: None,
            config_path: None,
        }
    }

    /// Sets the login user as explicitly requested; config files can no
    /// longer replace it.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self.user_explicit = true;
        self
    }

    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    pub fn with_repo_url(mut self, url: impl Into<String>) -> Self {
        self.repo_url = Some(url.into());
        self
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn user_is_explicit(&self) -> bool {
        self.user_explicit
    }

    /// `user@host` as ssh expects it.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// The same host reached as root, used by provisioning.
    pub fn as_root(&self) -> Self {
        let mut root = self.clone();
        root.user = "root".to_string();
        root.user_explicit = true;
        root
    }

    pub fn apply_defaults(&mut self, defaults: &TargetDefaults) {
        if self.host.trim().is_empty() {
            if let Some(host) = defaults.host.as_ref() {
                self.host = host.clone();
            }
        }
        if !self.user_explicit {
            if let Some(user) = defaults.user.as_ref() {
                self.user = user.clone();
            }
        }
        if self.identity_file.is_none() {
            self.identity_file = defaults.identity_file.clone();
        }
        if self.repo_url.is_none() {
            self.repo_url = defaults.repo_url.clone();
        }
    }

    /// Rejects values that ssh would read as options or that contain
    /// whitespace or control characters.
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_word("host", &self.host)?;
        validate_word("user", &self.user)?;
        if self.host.contains('@') {
            anyhow::bail!("host must not contain '@': {}", self.host);
        }
        Ok(())
    }
}

fn validate_word(label: &str, value: &str) -> anyhow::Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{label} is required");
    }
    if value.starts_with('-') {
        anyhow::bail!("{label} must not start with '-': {value}");
    }
    if value
        .chars()
        .any(|ch| ch.is_whitespace() || ch.is_control() || ch == '\'' || ch == '"')
    {
        anyhow::bail!("{label} contains invalid characters: {value:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_never_override_explicit_user() {
        let mut target = Target::new("10.0.0.5").with_user("alice");
        target.apply_defaults(&TargetDefaults {
            user: Some("bob".to_string()),
            ..TargetDefaults::default()
        });
        assert_eq!(target.user(), "alice");
    }

    #[test]
    fn defaults_replace_default_user_and_fill_gaps() {
        let mut target = Target::new("");
        target.apply_defaults(&TargetDefaults {
            host: Some("node1.example.com".to_string()),
            user: Some("bob".to_string()),
            identity_file: Some(PathBuf::from("/keys/id")),
            repo_url: Some("https://example.com/repo.git".to_string()),
        });
        assert_eq!(target.host, "node1.example.com");
        assert_eq!(target.user(), "bob");
        assert!(!target.user_is_explicit());
        assert_eq!(target.identity_file, Some(PathBuf::from("/keys/id")));
        assert_eq!(target.destination(), "bob@node1.example.com");
    }

    #[test]
    fn as_root_keeps_host_and_identity() {
        let target = Target::new("h").with_identity_file("/k");
        let root = target.as_root();
        assert_eq!(root.destination(), "root@h");
        assert_eq!(root.identity_file, Some(PathBuf::from("/k")));
    }

    #[test]
    fn validate_rejects_option_like_host() {
        assert!(Target::new("-oProxyCommand=x").validate().is_err());
        assert!(Target::new("a b").validate().is_err());
        assert!(Target::new("").validate().is_err());
        assert!(Target::new("u@h").validate().is_err());
        assert!(Target::new("host.example").validate().is_ok());
    }
}
