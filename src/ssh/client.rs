// ABOUTME: SSH client connection to the jump host using russh.
// ABOUTME: Handles host key verification, authentication, command capture and session opening.

use super::error::{Error, Result};
use super::session::RemoteSession;
use super::transport::Transport;
use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::keys::agent::client::AgentClient;
use russh::keys::known_hosts::{
    check_known_hosts, check_known_hosts_path, learn_known_hosts, learn_known_hosts_path,
};
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key, ssh_key};
use russh::{ChannelMsg, Disconnect};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;

/// Configuration for connecting to an SSH server.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Remote host to connect to.
    pub host: String,
    /// SSH port (default: 22).
    pub port: u16,
    /// Username for authentication.
    pub user: String,
    /// Optional path to private key file.
    /// If None, tries the SSH agent then the default key locations.
    pub key_path: Option<PathBuf>,
    /// Whether to accept and record unknown host keys (Trust On First Use).
    pub trust_on_first_use: bool,
    /// Optional known_hosts file. Defaults to ~/.ssh/known_hosts.
    pub known_hosts_path: Option<PathBuf>,
    /// Timeout for captured command execution (default: 5 minutes).
    pub command_timeout: Duration,
    /// Interval between keepalive messages; None disables them.
    pub keepalive_interval: Option<Duration>,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            key_path: None,
            trust_on_first_use: false,
            known_hosts_path: None,
            command_timeout: Duration::from_secs(300),
            keepalive_interval: Some(Duration::from_secs(15)),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    pub fn trust_on_first_use(mut self, tofu: bool) -> Self {
        self.trust_on_first_use = tofu;
        self
    }

    pub fn known_hosts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.keepalive_interval = interval;
        self
    }
}

/// Captured result of a remote command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: u32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// russh client handler: verifies the server key against known_hosts.
pub(crate) struct SshHandler {
    host: String,
    port: u16,
    trust_on_first_use: bool,
    known_hosts_path: Option<PathBuf>,
}

impl SshHandler {
    fn learn(&self, key: &ssh_key::PublicKey) {
        let learned = match &self.known_hosts_path {
            Some(path) => learn_known_hosts_path(&self.host, self.port, key, path),
            None => learn_known_hosts(&self.host, self.port, key),
        };
        if let Err(e) = learned {
            tracing::warn!("Failed to save host key to known_hosts: {}", e);
        }
    }
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let known = match &self.known_hosts_path {
            Some(path) => check_known_hosts_path(&self.host, self.port, server_public_key, path),
            None => check_known_hosts(&self.host, self.port, server_public_key),
        };

        match known {
            Ok(true) => Ok(true),
            Err(russh::keys::Error::KeyChanged { .. }) => {
                tracing::error!(
                    "Host key for {}:{} does not match known_hosts",
                    self.host,
                    self.port
                );
                Ok(false)
            }
            Ok(false) | Err(_) if self.trust_on_first_use => {
                tracing::warn!(
                    "Trust-On-First-Use: accepting unknown host key for {}:{}",
                    self.host,
                    self.port
                );
                self.learn(server_public_key);
                Ok(true)
            }
            Ok(false) | Err(_) => Ok(false),
        }
    }
}

/// What the client proves its identity with.
enum Credentials {
    Agent(AgentClient<UnixStream>),
    Key(Arc<ssh_key::PrivateKey>),
}

/// Keys tried under `~/.ssh` when no key is configured and no agent answers.
const DEFAULT_KEYS: [&str; 3] = ["id_ed25519", "id_ecdsa", "id_rsa"];

/// An explicit key wins; then the agent; then the usual files in `~/.ssh`.
async fn credentials(config: &ClientConfig) -> Result<Credentials> {
    if let Some(path) = &config.key_path {
        return load_secret_key(path, None)
            .map(|key| Credentials::Key(Arc::new(key)))
            .map_err(|e| Error::KeyLoadFailed {
                path: path.clone(),
                reason: e.to_string(),
            });
    }

    match AgentClient::connect_env().await {
        Ok(agent) => return Ok(Credentials::Agent(agent)),
        Err(e) => tracing::debug!("No SSH agent: {}", e),
    }

    let Some(home) = std::env::var_os("HOME") else {
        return Err(Error::AgentUnavailable(
            "no agent, no key configured and HOME is not set".to_string(),
        ));
    };
    let ssh_dir = PathBuf::from(home).join(".ssh");
    DEFAULT_KEYS
        .iter()
        .find_map(|name| load_secret_key(ssh_dir.join(name), None).ok())
        .map(|key| Credentials::Key(Arc::new(key)))
        .ok_or_else(|| {
            Error::AgentUnavailable(format!(
                "no agent, no key configured and no usable key in {}",
                ssh_dir.display()
            ))
        })
}

/// An authenticated SSH connection.
///
/// Cheap to share behind an `Arc`: sessions are opened concurrently from any task.
pub struct Client {
    config: ClientConfig,
    handle: Handle<SshHandler>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("user", &self.config.user)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connect and authenticate.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let credentials = credentials(&config).await?;

        let russh_config = Arc::new(Config {
            inactivity_timeout: None,
            keepalive_interval: config.keepalive_interval,
            ..Default::default()
        });
        let handler = SshHandler {
            host: config.host.clone(),
            port: config.port,
            trust_on_first_use: config.trust_on_first_use,
            known_hosts_path: config.known_hosts_path.clone(),
        };

        let addr = (config.host.as_str(), config.port);
        let mut handle = client::connect(russh_config, addr, handler)
            .await
            .map_err(|e| Error::Connection(format!("{}:{}: {}", config.host, config.port, e)))?;

        if !Self::authenticate(&mut handle, &config.user, credentials).await? {
            return Err(Error::AuthenticationFailed);
        }

        tracing::info!(
            host = %config.host,
            port = config.port,
            user = %config.user,
            "Connected to jump host"
        );
        Ok(Self { config, handle })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn authenticate(
        handle: &mut Handle<SshHandler>,
        user: &str,
        credentials: Credentials,
    ) -> Result<bool> {
        match credentials {
            Credentials::Key(key) => {
                let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
                let result = handle
                    .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key, hash_alg))
                    .await?;
                Ok(result.success())
            }
            Credentials::Agent(mut agent) => {
                let identities = agent
                    .request_identities()
                    .await
                    .map_err(|e| Error::AgentUnavailable(format!("agent refused to list keys: {}", e)))?;
                if identities.is_empty() {
                    return Err(Error::AgentUnavailable("agent holds no keys".to_string()));
                }

                for identity in identities {
                    let accepted = handle
                        .authenticate_publickey_with(user, identity, None, &mut agent)
                        .await
                        .is_ok_and(|result| result.success());
                    if accepted {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Open a new, not yet started, session.
    pub async fn open_session(&self) -> Result<RemoteSession> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::SessionOpen(e.to_string()))?;
        Ok(RemoteSession::new(channel))
    }

    /// Run a command and capture its output, bounded by the configured timeout.
    pub async fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.exec_with_timeout(command, self.config.command_timeout)
            .await
    }

    pub async fn exec_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        tokio::time::timeout(timeout, self.capture(command))
            .await
            .unwrap_or(Err(Error::CommandTimeout(timeout)))
    }

    async fn capture(&self, command: &str) -> Result<CommandOutput> {
        tracing::debug!(command, "Running remote command");
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::SessionOpen(e.to_string()))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::CommandFailed(format!("{}: {}", command, e)))?;

        let mut output = CommandOutput::default();
        let mut exit_status = None;
        let mut eof = false;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => output.stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => output.stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                ChannelMsg::Eof => eof = true,
                ChannelMsg::Close => break,
                _ => {}
            }
            if eof && exit_status.is_some() {
                break;
            }
        }

        // A channel that dies before reporting a status (network loss, killed sshd).
        output.exit_code = exit_status.ok_or(Error::ChannelClosed)?;
        Ok(output)
    }

    /// Disconnect from the server.
    pub async fn disconnect(self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for Client {
    type Session = RemoteSession;

    async fn open_session(&self) -> Result<RemoteSession> {
        Client::open_session(self).await
    }
}
