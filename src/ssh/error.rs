// ABOUTME: SSH transport error types.
// ABOUTME: Covers connection, authentication, session and channel failures.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("jump host rejected every offered key")]
    AuthenticationFailed,

    #[error("no usable credentials: {0}")]
    AgentUnavailable(String),

    #[error("cannot read private key {path}: {reason}")]
    KeyLoadFailed { path: PathBuf, reason: String },

    #[error("jump host refused a session: {0}")]
    SessionOpen(String),

    #[error("session already started")]
    AlreadyStarted,

    #[error("remote command could not start: {0}")]
    CommandFailed(String),

    #[error("command timed out after {0:?}")]
    CommandTimeout(std::time::Duration),

    #[error("channel closed before an exit status arrived")]
    ChannelClosed,

    #[error("SSH protocol error: {0}")]
    Protocol(#[from] russh::Error),

    #[error("SSH key error: {0}")]
    Key(#[from] russh::keys::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
