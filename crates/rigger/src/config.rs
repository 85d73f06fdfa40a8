use anyhow::Context;
use remote_client::TargetDefaults;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use system_utils::path::{expand_tilde, home_dir};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct RiggerConfig {
    pub(crate) host: Option<String>,
    pub(crate) user: Option<String>,
    pub(crate) identity_file: Option<String>,
    pub(crate) repo_url: Option<String>,
    pub(crate) tunnel: TunnelConfig,
    pub(crate) port_forward: PortForwardConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct TunnelConfig {
    pub(crate) local_port: Option<u16>,
    pub(crate) remote_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct PortForwardConfig {
    pub(crate) namespace: Option<String>,
    pub(crate) resource: Option<String>,
    pub(crate) local_port: Option<u16>,
    pub(crate) remote_port: Option<u16>,
}

impl RiggerConfig {
    pub(crate) fn target_defaults(&self) -> TargetDefaults {
        TargetDefaults {
            host: self.host.clone(),
            user: self.user.clone(),
            identity_file: self.identity_file.as_deref().map(expand_tilde),
            repo_url: self.repo_url.clone(),
        }
    }
}

pub(crate) fn default_config_path() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".config").join("rigger").join("config.toml"))
}

/// An explicit path must exist; the default one may be absent.
pub(crate) fn load_config(explicit: Option<&Path>) -> anyhow::Result<(RiggerConfig, Option<PathBuf>)> {
    let (path, required) = match explicit {
        Some(path) => (expand_tilde(&path.to_string_lossy()), true),
        None => match default_config_path() {
            Some(path) => (path, false),
            None => return Ok((RiggerConfig::default(), None)),
        },
    };
    if !required && !path.exists() {
        return Ok((RiggerConfig::default(), None));
    }
    let config = parse_config_file(&path)?;
    Ok((config, Some(path)))
}

fn parse_config_file(path: &Path) -> anyhow::Result<RiggerConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: RiggerConfig =
        toml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))?;
    Ok(config)
}
