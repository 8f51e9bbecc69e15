// ABOUTME: Configuration types and parsing for burrow.yml.
// ABOUTME: Optional file holding the jump host connection, server settings and tunnels.

mod host;

pub use host::{DEFAULT_SSH_PORT, HostSpec};

use crate::error::{Error, Result};
use crate::server::ServerConfig;
use crate::ssh::ClientConfig;
use crate::tunnel::TunnelConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILENAME: &str = "burrow.yml";
pub const CONFIG_FILENAME_ALT: &str = "burrow.yaml";
pub const CONFIG_FILENAME_DIR: &str = ".burrow/config.yml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Jump host used by client commands.
    #[serde(default)]
    pub connection: Option<ConnectionConfig>,

    #[serde(default)]
    pub server: Option<ServerConfig>,

    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    pub host: HostSpec,

    #[serde(default)]
    pub key: Option<PathBuf>,

    #[serde(default)]
    pub known_hosts: Option<PathBuf>,

    #[serde(default)]
    pub trust_first_connection: bool,

    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,

    #[serde(default = "default_keepalive", with = "humantime_serde")]
    pub keepalive: Option<Duration>,
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_keepalive() -> Option<Duration> {
    Some(Duration::from_secs(15))
}

impl ConnectionConfig {
    pub fn new(host: HostSpec) -> Self {
        Self {
            host,
            key: None,
            known_hosts: None,
            trust_first_connection: false,
            command_timeout: default_command_timeout(),
            keepalive: default_keepalive(),
        }
    }

    /// Client settings; the login user falls back to `$USER`.
    pub fn client_config(&self) -> Result<ClientConfig> {
        let user = match &self.host.user {
            Some(user) => user.clone(),
            None => std::env::var("USER").map_err(|_| {
                Error::InvalidConfig(format!(
                    "no user given for {} and USER is not set",
                    self.host.host
                ))
            })?,
        };

        let mut config = ClientConfig::new(self.host.host.clone(), user)
            .port(self.host.port)
            .trust_on_first_use(self.trust_first_connection)
            .command_timeout(self.command_timeout)
            .keepalive_interval(self.keepalive);
        if let Some(key) = &self.key {
            config = config.key_path(expand_home(key));
        }
        if let Some(known_hosts) = &self.known_hosts {
            config = config.known_hosts_path(expand_home(known_hosts));
        }
        Ok(config)
    }
}

/// Expand a leading `~/` using `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Ok(home) = std::env::var("HOME")
    {
        return Path::new(&home).join(rest);
    }
    path.to_path_buf()
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml).map_err(Error::from)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn discover(dir: &Path) -> Result<Self> {
        let candidates = [
            dir.join(CONFIG_FILENAME),
            dir.join(CONFIG_FILENAME_ALT),
            dir.join(CONFIG_FILENAME_DIR),
        ];

        for path in &candidates {
            if path.exists() {
                return Self::load(path);
            }
        }

        Err(Error::ConfigNotFound(dir.to_path_buf()))
    }

    /// An explicit path must exist; otherwise look in `dir` and fall back to
    /// an empty configuration.
    pub fn resolve(explicit: Option<&Path>, dir: &Path) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => match Self::discover(dir) {
                Err(Error::ConfigNotFound(_)) => Ok(Self::default()),
                other => other,
            },
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(server) = &self.server
            && server.max_channels == 0
        {
            return Err(Error::InvalidConfig(
                "server.max_channels must be at least 1".to_string(),
            ));
        }
        for tunnel in &self.tunnels {
            if tunnel.max_connections == 0 {
                return Err(Error::InvalidConfig(format!(
                    "tunnel to {}:{} needs max_connections of at least 1",
                    tunnel.remote_host, tunnel.remote_port
                )));
            }
        }
        Ok(())
    }
}
