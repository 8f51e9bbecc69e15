// ABOUTME: Remote command session over a russh client channel.
// ABOUTME: Exposes the channel as separate stdin/stdout/stderr streams.

use super::channel::{self, PIPE_CAPACITY, Pump};
use super::error::{Error, Result};
use super::transport::{Session, SessionStreams};
use async_trait::async_trait;
use russh::Channel;
use russh::client::Msg;
use tokio::io::DuplexStream;

/// Pump-side ends of the session pipes.
struct PumpEnds {
    stdin: DuplexStream,
    stdout: DuplexStream,
    stderr: DuplexStream,
}

/// A session on an established SSH connection.
///
/// Streams can be taken before the session is started; bytes written to stdin
/// early are buffered and delivered once the remote command runs.
pub struct RemoteSession {
    channel: Option<Channel<Msg>>,
    ends: Option<PumpEnds>,
    streams: Option<SessionStreams>,
    pump: Option<Pump>,
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("started", &self.pump.is_some())
            .finish()
    }
}

impl RemoteSession {
    pub(crate) fn new(channel: Channel<Msg>) -> Self {
        let (stdin, stdin_end) = tokio::io::duplex(PIPE_CAPACITY);
        let (stdout, stdout_end) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr, stderr_end) = tokio::io::duplex(PIPE_CAPACITY);

        Self {
            channel: Some(channel),
            ends: Some(PumpEnds {
                stdin: stdin_end,
                stdout: stdout_end,
                stderr: stderr_end,
            }),
            streams: Some(SessionStreams {
                stdin: Box::new(stdin),
                stdout: Box::new(stdout),
                stderr: Box::new(stderr),
            }),
            pump: None,
        }
    }

    fn take_channel(&mut self) -> Result<Channel<Msg>> {
        self.channel.take().ok_or(Error::AlreadyStarted)
    }

    fn attach(&mut self, channel: Channel<Msg>) -> Result<()> {
        let ends = self.ends.take().ok_or(Error::AlreadyStarted)?;
        self.pump = Some(channel::spawn(
            channel,
            ends.stdin,
            ends.stdout,
            Some(ends.stderr),
        ));
        Ok(())
    }
}

#[async_trait]
impl Session for RemoteSession {
    async fn start(&mut self, command: &str) -> Result<()> {
        let channel = self.take_channel()?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::CommandFailed(format!("failed to exec command: {}", e)))?;
        self.attach(channel)
    }

    async fn start_shell(&mut self) -> Result<()> {
        let channel = self.take_channel()?;
        channel
            .request_shell(true)
            .await
            .map_err(|e| Error::CommandFailed(format!("failed to request shell: {}", e)))?;
        self.attach(channel)
    }

    fn take_streams(&mut self) -> Option<SessionStreams> {
        self.streams.take()
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(pump) = self.pump.take() {
            pump.shutdown().await;
        } else if let Some(channel) = self.channel.take() {
            channel.close().await?;
        }
        Ok(())
    }
}
