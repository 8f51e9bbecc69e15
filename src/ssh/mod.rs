// ABOUTME: SSH transport: capability traits plus the russh-backed client.
// ABOUTME: Supports SSH agent and key-based authentication with known_hosts verification.

pub(crate) mod channel;
mod client;
mod error;
mod quote;
mod session;
mod transport;

pub use client::{Client, ClientConfig, CommandOutput};
pub use error::{Error, Result};
pub use quote::quote;
pub use session::RemoteSession;
pub use transport::{BoxedReader, BoxedWriter, Session, SessionStreams, Transport};
