// ABOUTME: Local TCP listener forwarding each connection through a remote session.
// ABOUTME: Sequential accept loop with a connection ceiling and cooperative shutdown.

mod connection;
mod opener;

pub use opener::{CommandOpener, NETCAT_TEMPLATE, NetcatOpener, SessionOpener};

use crate::ssh::Transport;
use connection::Destination;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_LOCAL_ADDR: &str = "127.0.0.1";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to bind tunnel listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tunnel accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("failed to read tunnel listener address: {0}")]
    LocalAddr(#[source] std::io::Error),

    #[error("max_connections must be at least 1")]
    NoConnections,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Local bind address; loopback unless told otherwise.
    #[serde(default = "default_local_addr")]
    pub local_addr: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Remote command template with `{host}` and `{port}`; netcat when unset.
    #[serde(default)]
    pub command: Option<String>,
    /// How long a connection whose client stopped sending waits for the
    /// remote to finish answering before it is torn down.
    #[serde(default = "default_linger", with = "humantime_serde")]
    pub linger: Duration,
}

fn default_local_addr() -> String {
    DEFAULT_LOCAL_ADDR.to_string()
}

fn default_max_connections() -> usize {
    32
}

fn default_linger() -> Duration {
    Duration::from_secs(5)
}

impl TunnelConfig {
    pub fn new(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_addr: default_local_addr(),
            local_port,
            remote_host: remote_host.into(),
            remote_port,
            max_connections: default_max_connections(),
            command: None,
            linger: default_linger(),
        }
    }

    pub fn local_addr(mut self, addr: impl Into<String>) -> Self {
        self.local_addr = addr.into();
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn command(mut self, template: impl Into<String>) -> Self {
        self.command = Some(template.into());
        self
    }

    pub fn linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    /// `host:port` to bind, bracketing IPv6 literals.
    pub fn bind_address(&self) -> String {
        if self.local_addr.contains(':') && !self.local_addr.starts_with('[') {
            format!("[{}]:{}", self.local_addr, self.local_port)
        } else {
            format!("{}:{}", self.local_addr, self.local_port)
        }
    }

    fn opener<T: Transport>(&self) -> Arc<dyn SessionOpener<T>> {
        match &self.command {
            Some(template) => Arc::new(CommandOpener::new(template.clone())),
            None => Arc::new(NetcatOpener),
        }
    }
}

/// A bound forwarding tunnel.
pub struct Tunnel<T: Transport> {
    listener: TcpListener,
    transport: Arc<T>,
    opener: Arc<dyn SessionOpener<T>>,
    destination: Arc<Destination>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl<T: Transport> std::fmt::Debug for Tunnel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("destination", &self.destination)
            .finish()
    }
}

impl<T: Transport> Tunnel<T> {
    /// Bind the local listener. Sessions are opened as the config says.
    pub async fn bind(transport: Arc<T>, config: TunnelConfig) -> Result<Self> {
        let opener = config.opener();
        Self::bind_with_opener(transport, config, opener).await
    }

    /// Bind the local listener with a custom session opener.
    pub async fn bind_with_opener(
        transport: Arc<T>,
        config: TunnelConfig,
        opener: Arc<dyn SessionOpener<T>>,
    ) -> Result<Self> {
        if config.max_connections == 0 {
            return Err(Error::NoConnections);
        }

        let addr = config.bind_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| Error::Bind {
                addr: addr.clone(),
                source,
            })?;

        Ok(Self {
            listener,
            transport,
            opener,
            destination: Arc::new(Destination {
                host: config.remote_host,
                port: config.remote_port,
                linger: config.linger,
            }),
            permits: Arc::new(Semaphore::new(config.max_connections)),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Error::LocalAddr)
    }

    /// Token that stops the accept loop and every live connection.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept and forward connections until shut down.
    ///
    /// An accept error ends the tunnel. Per-connection failures do not.
    pub async fn run(self) -> Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(
                "Tunnel listening on {} -> {}:{}",
                addr,
                self.destination.host,
                self.destination.port
            );
        }

        loop {
            // A free permit first, so excess connections wait in the backlog.
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("Tunnel accept failed: {}", e);
                        return Err(Error::Accept(e));
                    }
                },
            };

            tracing::info!(%peer, "Accepted tunnel connection");
            tokio::spawn(connection::serve(
                stream,
                peer,
                self.transport.clone(),
                self.opener.clone(),
                self.destination.clone(),
                self.shutdown.clone(),
                permit,
            ));
        }

        tracing::info!("Tunnel stopped");
        Ok(())
    }
}
