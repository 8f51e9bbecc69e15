// ABOUTME: SSH shell server: accepts connections and serves PTY-backed shell channels.
// ABOUTME: Owns the listener, host key, auth policy and the per-server channel ceiling.

mod auth;
mod channel;
mod handler;
mod request;

pub use auth::{AuthPolicy, USER_PLACEHOLDER, load_authorized_keys};
pub use channel::{Reply, ShellChannel, ShellSettings};
pub use request::{
    ChannelRequest, RequestError, SESSION_CHANNEL, check_channel_type, encode_pty_req,
    encode_string, encode_window_change,
};

use crate::pty::{NativePtySystem, PtySystem, ShellCommand};
use handler::{ConnectionHandler, Shared};
use russh::keys::PrivateKey;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:2222";
pub const DEFAULT_HOST_KEY: &str = "/etc/ssh/burrow_host_key";

/// Fatal server setup errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ServeError {
    #[snafu(display("failed to load host key from {}: {source}", path.display()))]
    HostKey {
        path: PathBuf,
        source: russh::keys::Error,
    },

    #[snafu(display("failed to write host key to {}: {source}", path.display()))]
    HostKeyWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to generate host key: {source}"))]
    HostKeyGenerate { source: russh::keys::ssh_key::Error },

    #[snafu(display("failed to bind {addr}: {source}"))]
    Bind { addr: String, source: std::io::Error },

    #[snafu(display("failed to read listener address: {source}"))]
    LocalAddr { source: std::io::Error },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_host_key")]
    pub host_key: PathBuf,

    /// Create an Ed25519 host key at `host_key` if the file is missing.
    #[serde(default)]
    pub generate_host_key: bool,

    #[serde(default)]
    pub auth: AuthPolicy,

    /// Shell program; `$SHELL` or bash when unset.
    #[serde(default)]
    pub shell: Option<String>,

    #[serde(default = "default_max_channels")]
    pub max_channels: usize,

    #[serde(default = "default_hangup_grace", with = "humantime_serde")]
    pub hangup_grace: Duration,

    #[serde(default = "default_auth_rejection_time", with = "humantime_serde")]
    pub auth_rejection_time: Duration,
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_host_key() -> PathBuf {
    PathBuf::from(DEFAULT_HOST_KEY)
}

fn default_max_channels() -> usize {
    64
}

fn default_hangup_grace() -> Duration {
    Duration::from_secs(2)
}

fn default_auth_rejection_time() -> Duration {
    Duration::from_secs(1)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            host_key: default_host_key(),
            generate_host_key: false,
            auth: AuthPolicy::default(),
            shell: None,
            max_channels: default_max_channels(),
            hangup_grace: default_hangup_grace(),
            auth_rejection_time: default_auth_rejection_time(),
        }
    }
}

impl ServerConfig {
    pub fn listen(mut self, addr: impl Into<String>) -> Self {
        self.listen = addr.into();
        self
    }

    pub fn host_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_key = path.into();
        self
    }

    pub fn generate_host_key(mut self, generate: bool) -> Self {
        self.generate_host_key = generate;
        self
    }

    pub fn auth(mut self, auth: AuthPolicy) -> Self {
        self.auth = auth;
        self
    }

    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    pub fn max_channels(mut self, max: usize) -> Self {
        self.max_channels = max;
        self
    }

    pub fn hangup_grace(mut self, grace: Duration) -> Self {
        self.hangup_grace = grace;
        self
    }

    fn shell_command(&self) -> ShellCommand {
        match &self.shell {
            Some(program) => ShellCommand::new(program.clone()),
            None => ShellCommand::from_env(),
        }
    }
}

/// Load the host key, creating it first when allowed.
pub async fn load_host_key(path: &Path, generate: bool) -> Result<PrivateKey, ServeError> {
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, LineEnding};

    if generate && !path.exists() {
        tracing::info!("Generating new Ed25519 host key at {}", path.display());
        let key =
            PrivateKey::random(&mut OsRng, Algorithm::Ed25519).context(HostKeyGenerateSnafu)?;
        let encoded = key.to_openssh(LineEnding::LF).context(HostKeyGenerateSnafu)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(HostKeyWriteSnafu { path })?;
        }
        tokio::fs::write(path, encoded.as_bytes())
            .await
            .context(HostKeyWriteSnafu { path })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .context(HostKeyWriteSnafu { path })?;
        }
        return Ok(key);
    }

    russh::keys::load_secret_key(path, None).context(HostKeySnafu { path })
}

/// A bound shell server.
pub struct Server {
    listener: TcpListener,
    russh_config: Arc<russh::server::Config>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("auth", &self.shared.auth)
            .finish()
    }
}

impl Server {
    /// Load the host key and bind the listener. Shells run on native PTYs.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServeError> {
        Self::bind_with_pty(config, Arc::new(NativePtySystem)).await
    }

    /// Like [`Server::bind`] with a custom PTY backend.
    pub async fn bind_with_pty(
        config: ServerConfig,
        pty: Arc<dyn PtySystem>,
    ) -> Result<Self, ServeError> {
        let key = load_host_key(&config.host_key, config.generate_host_key).await?;
        Self::bind_with_key(config, key, pty).await
    }

    /// Bind with an already loaded host key.
    pub async fn bind_with_key(
        config: ServerConfig,
        key: PrivateKey,
        pty: Arc<dyn PtySystem>,
    ) -> Result<Self, ServeError> {
        let listener = TcpListener::bind(&config.listen).await.context(BindSnafu {
            addr: config.listen.clone(),
        })?;

        let russh_config = Arc::new(russh::server::Config {
            auth_rejection_time: config.auth_rejection_time,
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: vec![key],
            methods: config.auth.methods(),
            ..Default::default()
        });

        let shared = Arc::new(Shared {
            settings: ShellSettings {
                shell: config.shell_command(),
                hangup_grace: config.hangup_grace,
            },
            auth: config.auth,
            pty,
            channels: Arc::new(Semaphore::new(config.max_channels)),
            shutdown: CancellationToken::new(),
        });

        Ok(Self {
            listener,
            russh_config,
            shared,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServeError> {
        self.listener.local_addr().context(LocalAddrSnafu)
    }

    /// Token that stops the accept loop and every open shell channel.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Accept connections until shut down. Accept errors are logged and skipped.
    pub async fn run(self) {
        let shutdown = self.shared.shutdown.clone();
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!("SSH server listening on {}", addr);
        }

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!("Failed to accept incoming connection: {}", e);
                    continue;
                }
            };

            let handler = ConnectionHandler::new(self.shared.clone(), Some(peer));
            let russh_config = self.russh_config.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tracing::info!(%peer, "New SSH connection");
                let session = match russh::server::run_stream(russh_config, stream, handler).await
                {
                    Ok(session) => session,
                    Err(e) => {
                        tracing::warn!(%peer, "Failed to handshake: {}", e);
                        return;
                    }
                };
                tokio::select! {
                    result = session => {
                        if let Err(e) = result {
                            tracing::warn!(%peer, "SSH session error: {}", e);
                        }
                    }
                    // Dropping the session future closes the connection.
                    _ = shutdown.cancelled() => {}
                }
                tracing::info!(%peer, "SSH connection closed");
            });
        }

        tracing::info!("SSH server stopped");
    }
}
