// ABOUTME: Capability traits for the multiplexed remote-session transport.
// ABOUTME: A Transport opens Sessions; a Session hands out stdin/stdout/stderr once.

use super::error::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Write half of a session stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read half of a session stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// The three byte streams of one remote command execution.
///
/// Each stream is owned by exactly one copy task once taken out of the session.
pub struct SessionStreams {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
}

impl std::fmt::Debug for SessionStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStreams").finish_non_exhaustive()
    }
}

/// One logical command execution multiplexed over a shared connection.
#[async_trait]
pub trait Session: Send + 'static {
    /// Start `command` on the remote side.
    async fn start(&mut self, command: &str) -> Result<()>;

    /// Request the remote user's default shell.
    async fn start_shell(&mut self) -> Result<()>;

    /// Take the session's streams. Returns `None` after the first call.
    fn take_streams(&mut self) -> Option<SessionStreams>;

    /// Close the session. Pending stdin bytes are flushed before the channel closes.
    async fn close(&mut self) -> Result<()>;
}

/// An authenticated connection able to open sessions concurrently.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Session: Session;

    async fn open_session(&self) -> Result<Self::Session>;
}
