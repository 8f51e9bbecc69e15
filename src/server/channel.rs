// ABOUTME: One interactive shell channel: a PTY shell relayed to the channel streams.
// ABOUTME: Decoded in-band requests resize the PTY; either relay ending tears down once.

use super::request::{ChannelRequest, RequestError};
use crate::pty::{PtyControl, PtyError, PtyProcess, PtySystem, ShellCommand, TermSize};
use crate::relay::{Teardown, copy_until_cancelled};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Reply to send for an in-band request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Success,
    Failure,
    /// The request takes no reply.
    None,
}

impl Reply {
    fn refuse(want_reply: bool) -> Self {
        if want_reply { Reply::Failure } else { Reply::None }
    }
}

/// Shell channel settings shared by every channel of a server.
#[derive(Debug, Clone)]
pub struct ShellSettings {
    pub shell: ShellCommand,
    /// How long a shell may outlive its channel before it is killed.
    pub hangup_grace: Duration,
}

/// A running shell bound to one channel.
pub struct ShellChannel {
    label: String,
    control: Arc<dyn PtyControl>,
    teardown: Arc<Teardown>,
}

impl std::fmt::Debug for ShellChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellChannel")
            .field("label", &self.label)
            .field("teardown", &self.teardown)
            .finish()
    }
}

impl ShellChannel {
    /// Spawn the configured shell on a new PTY.
    pub fn spawn_shell(pty: &dyn PtySystem, settings: &ShellSettings) -> Result<PtyProcess, PtyError> {
        pty.spawn(&settings.shell, TermSize::default())
    }

    /// Relay a running shell to the channel streams.
    ///
    /// `close_channel` runs once on teardown, before the shell is waited for.
    /// Dropping `guard` happens after the shell has exited.
    #[allow(clippy::too_many_arguments)]
    pub fn start<R, W, F, Fut, G>(
        label: impl Into<String>,
        process: PtyProcess,
        hangup_grace: Duration,
        token: CancellationToken,
        channel_reader: R,
        channel_writer: W,
        close_channel: F,
        guard: G,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        G: Send + 'static,
    {
        let label = label.into();
        let grace = hangup_grace;

        let close_label = label.clone();
        let shell = process.process;
        let teardown = Arc::new(Teardown::new(token, move || async move {
            close_channel().await;
            match shell.wait(grace).await {
                Ok(status) if status.killed => {
                    tracing::info!(channel = %close_label, "Shell killed after hang-up");
                }
                Ok(status) if !status.success() => {
                    tracing::warn!(channel = %close_label, code = status.code, "Shell exited with non-zero status");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(channel = %close_label, "Failed to wait for shell: {}", e),
            }
            drop(guard);
            tracing::info!(channel = %close_label, "Session closed");
        }));

        tokio::spawn(relay_output(
            label.clone(),
            process.reader,
            channel_writer,
            teardown.clone(),
        ));
        tokio::spawn(relay_input(
            label.clone(),
            channel_reader,
            process.writer,
            teardown.clone(),
        ));

        Self {
            label,
            control: process.control,
            teardown,
        }
    }

    /// Apply an in-band request given in wire form.
    pub fn handle_request(&self, kind: &str, want_reply: bool, payload: &[u8]) -> Reply {
        match ChannelRequest::decode(kind, payload) {
            Ok(request) => self.apply(request, want_reply),
            Err(RequestError::ShellCommand) => {
                tracing::debug!(channel = %self.label, "Refusing shell request with a command");
                Reply::refuse(want_reply)
            }
            Err(e) => {
                tracing::warn!(channel = %self.label, "Malformed {} request: {}", kind, e);
                Reply::refuse(want_reply)
            }
        }
    }

    fn apply(&self, request: ChannelRequest, want_reply: bool) -> Reply {
        match request {
            ChannelRequest::Shell => Reply::Success,
            ChannelRequest::PtyReq { term, size } => {
                tracing::debug!(channel = %self.label, term = %term, cols = size.width, rows = size.height, "PTY request");
                match self.control.resize(size) {
                    Ok(()) => Reply::Success,
                    Err(e) => {
                        tracing::warn!(channel = %self.label, "{}", e);
                        Reply::refuse(want_reply)
                    }
                }
            }
            ChannelRequest::WindowChange(size) => {
                if let Err(e) = self.control.resize(size) {
                    tracing::warn!(channel = %self.label, "{}", e);
                }
                Reply::None
            }
            ChannelRequest::Unsupported(kind) => {
                tracing::debug!(channel = %self.label, request = %kind, "Refusing unsupported request");
                Reply::refuse(want_reply)
            }
        }
    }

    /// Tear the channel down. Returns false if it was already torn down.
    pub async fn close(&self) -> bool {
        self.teardown.fire().await
    }

    pub fn is_closed(&self) -> bool {
        self.teardown.is_fired()
    }
}

async fn relay_output<R, W>(label: String, mut pty: R, mut channel: W, teardown: Arc<Teardown>)
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    if let Err(e) = copy_until_cancelled(&mut pty, &mut channel, teardown.token()).await {
        tracing::debug!(channel = %label, "PTY to channel copy ended: {}", e);
    }
    let _ = channel.shutdown().await;
    drop(channel);
    drop(pty);
    teardown.fire().await;
}

async fn relay_input<R, W>(label: String, mut channel: R, mut pty: W, teardown: Arc<Teardown>)
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    if let Err(e) = copy_until_cancelled(&mut channel, &mut pty, teardown.token()).await {
        tracing::debug!(channel = %label, "Channel to PTY copy ended: {}", e);
    }
    drop(pty);
    drop(channel);
    teardown.fire().await;
}
