// ABOUTME: Bridges a russh channel to plain tokio byte streams.
// ABOUTME: One pump task per channel moves data between the channel and in-memory pipes.

use russh::{Channel, ChannelId, ChannelMsg};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capacity of each in-memory pipe between a channel and its consumer.
pub(crate) const PIPE_CAPACITY: usize = 64 * 1024;

/// Extended data stream number carrying stderr.
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Handle to a running pump.
pub(crate) struct Pump {
    pub close: CancellationToken,
    pub task: JoinHandle<()>,
}

impl Pump {
    /// Ask the pump to close the channel and wait until it has.
    ///
    /// Bytes already written to the input pipe are forwarded before the close.
    pub async fn shutdown(self) {
        self.close.cancel();
        if let Err(e) = self.task.await {
            tracing::debug!("Channel pump task failed: {}", e);
        }
    }
}

/// Spawn a pump for `channel`.
///
/// `input` is forwarded to the remote side as channel data, remote data is
/// written to `output` and remote stderr (extended data 1) to `errors` when
/// present. Input EOF sends a channel EOF; remote EOF shuts the outputs down.
pub(crate) fn spawn<S, R, W, E>(
    channel: Channel<S>,
    input: R,
    output: W,
    errors: Option<E>,
) -> Pump
where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
    E: AsyncWrite + Send + Unpin + 'static,
{
    let close = CancellationToken::new();
    let task = tokio::spawn(run(channel, input, output, errors, close.clone()));
    Pump { close, task }
}

async fn run<S, R, W, E>(
    mut channel: Channel<S>,
    mut input: R,
    mut output: W,
    mut errors: Option<E>,
    close: CancellationToken,
) where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
    E: AsyncWrite + Send + Unpin + 'static,
{
    let id = channel.id();
    let mut input_open = true;
    let mut remote_eof = false;
    let mut buf = vec![0u8; 32 * 1024];

    loop {
        tokio::select! {
            // Input first so buffered bytes are flushed before a requested close.
            biased;

            r = input.read(&mut buf), if input_open => {
                match r {
                    Ok(0) => {
                        input_open = false;
                        if let Err(e) = channel.eof().await {
                            tracing::debug!(channel = ?id, "Channel EOF error: {}", e);
                            break;
                        }
                    }
                    Ok(n) => {
                        if let Err(e) = channel.data(&buf[..n]).await {
                            tracing::debug!(channel = ?id, "Channel data error: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(channel = ?id, "Pipe read error: {}", e);
                        break;
                    }
                }
            }

            _ = close.cancelled() => break,

            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { ref data }) => {
                        if let Err(e) = output.write_all(data).await {
                            tracing::debug!(channel = ?id, "Pipe write error: {}", e);
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { ref data, ext }) => {
                        if ext == SSH_EXTENDED_DATA_STDERR
                            && let Some(errors) = errors.as_mut()
                            && let Err(e) = errors.write_all(data).await
                        {
                            tracing::debug!(channel = ?id, "Stderr pipe write error: {}", e);
                        }
                    }
                    Some(ChannelMsg::Eof) => {
                        if !remote_eof {
                            remote_eof = true;
                            shutdown_outputs(&mut output, errors.as_mut()).await;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        tracing::debug!(channel = ?id, exit_status, "Remote command exited");
                    }
                    Some(ChannelMsg::Failure) => {
                        tracing::warn!(channel = ?id, "Remote side refused channel request");
                        break;
                    }
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
        }
    }

    if !remote_eof {
        shutdown_outputs(&mut output, errors.as_mut()).await;
    }
    if let Err(e) = channel.close().await {
        tracing::debug!(channel = ?id, "Channel close error: {}", e);
    }
}

async fn shutdown_outputs<W, E>(output: &mut W, errors: Option<&mut E>)
where
    W: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let _ = output.shutdown().await;
    if let Some(errors) = errors {
        let _ = errors.shutdown().await;
    }
}
