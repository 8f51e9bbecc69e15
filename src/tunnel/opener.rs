// ABOUTME: Strategies for opening the remote session that backs one tunnel connection.
// ABOUTME: The default runs netcat on the jump host; any command template can be used.

use crate::ssh::{Result, Session, Transport, quote};
use async_trait::async_trait;

/// Template used by [`NetcatOpener`].
pub const NETCAT_TEMPLATE: &str = "nc {host} {port}";

/// Opens a started session whose stdio is connected to `host:port`.
#[async_trait]
pub trait SessionOpener<T: Transport>: Send + Sync + 'static {
    async fn open(&self, transport: &T, host: &str, port: u16) -> Result<T::Session>;
}

/// Runs a command built from a template with `{host}` and `{port}` placeholders.
/// The host is shell-quoted before substitution.
#[derive(Debug, Clone)]
pub struct CommandOpener {
    template: String,
}

impl CommandOpener {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn command(&self, host: &str, port: u16) -> String {
        self.template
            .replace("{host}", &quote(host))
            .replace("{port}", &port.to_string())
    }
}

#[async_trait]
impl<T: Transport> SessionOpener<T> for CommandOpener {
    async fn open(&self, transport: &T, host: &str, port: u16) -> Result<T::Session> {
        start(transport, &self.command(host, port)).await
    }
}

/// `nc <host> <port>` on the jump host.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetcatOpener;

#[async_trait]
impl<T: Transport> SessionOpener<T> for NetcatOpener {
    async fn open(&self, transport: &T, host: &str, port: u16) -> Result<T::Session> {
        start(transport, &CommandOpener::new(NETCAT_TEMPLATE).command(host, port)).await
    }
}

async fn start<T: Transport>(transport: &T, command: &str) -> Result<T::Session> {
    let mut session = transport.open_session().await?;
    tracing::debug!(command, "Starting tunnel command");
    if let Err(e) = session.start(command).await {
        let _ = session.close().await;
        return Err(e);
    }
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netcat_template_renders_host_and_port() {
        let opener = CommandOpener::new(NETCAT_TEMPLATE);
        assert_eq!(opener.command("db.internal", 5432), "nc db.internal 5432");
    }

    #[test]
    fn hosts_are_quoted() {
        let opener = CommandOpener::new("socat - TCP:{host}:{port}");
        assert_eq!(
            opener.command("db; rm -rf /", 80),
            "socat - TCP:'db; rm -rf /':80"
        );
    }
}
