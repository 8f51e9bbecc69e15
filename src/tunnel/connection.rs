// ABOUTME: Relay for one accepted tunnel connection and its remote session.
// ABOUTME: Remote output ending tears the pair down once; local EOF half-closes, then lingers.

use super::opener::SessionOpener;
use crate::relay::{CopyOutcome, Teardown, copy_until_cancelled, drain};
use crate::ssh::{Session, SessionStreams, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;

/// Where a tunnel connection goes.
#[derive(Debug, Clone)]
pub(crate) struct Destination {
    pub host: String,
    pub port: u16,
    /// Grace after local EOF for the remote to finish its output.
    pub linger: Duration,
}

pub(crate) async fn serve<T: Transport>(
    mut stream: TcpStream,
    peer: SocketAddr,
    transport: Arc<T>,
    opener: Arc<dyn SessionOpener<T>>,
    destination: Arc<Destination>,
    tunnel_token: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    let mut session = match opener
        .open(transport.as_ref(), &destination.host, destination.port)
        .await
    {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(%peer, "Failed to open remote session: {}", e);
            let _ = stream.shutdown().await;
            return;
        }
    };

    let Some(streams) = session.take_streams() else {
        tracing::warn!(%peer, "Remote session has no streams");
        let _ = session.close().await;
        let _ = stream.shutdown().await;
        return;
    };

    tracing::debug!(%peer, host = %destination.host, port = destination.port, "Tunnel connection open");

    let teardown = Teardown::new(tunnel_token.child_token(), move || async move {
        if let Err(e) = session.close().await {
            tracing::debug!(%peer, "Failed to close remote session: {}", e);
        }
    });

    let (local_read, local_write) = stream.into_split();
    let SessionStreams {
        stdin,
        stdout,
        stderr,
    } = streams;

    // Each copy owns its streams so they are released before the session closes.
    let remote_to_local = async {
        let (mut stdout, mut local_write) = (stdout, local_write);
        match copy_until_cancelled(&mut stdout, &mut local_write, teardown.token()).await {
            Ok(CopyOutcome::Finished(n)) => {
                tracing::debug!(%peer, bytes = n, "Remote output finished");
            }
            Ok(CopyOutcome::Cancelled) => {}
            Err(e) => tracing::debug!(%peer, "Remote to local copy failed: {}", e),
        }
        let _ = local_write.shutdown().await;
        drop(stdout);
        teardown.fire().await;
    };

    let local_to_remote = async {
        let (mut local_read, mut stdin) = (local_read, stdin);
        match copy_until_cancelled(&mut local_read, &mut stdin, teardown.token()).await {
            Ok(CopyOutcome::Finished(n)) => {
                tracing::debug!(%peer, bytes = n, "Local side finished sending");
                // Half-close: the remote may keep answering for a while.
                if let Err(e) = stdin.shutdown().await {
                    tracing::debug!(%peer, "Failed to close remote stdin: {}", e);
                }
                drop(stdin);
                tokio::select! {
                    _ = teardown.token().cancelled() => {}
                    _ = tokio::time::sleep(destination.linger) => {
                        tracing::debug!(%peer, "Remote still open {:?} after local EOF", destination.linger);
                        teardown.fire().await;
                    }
                }
            }
            Ok(CopyOutcome::Cancelled) => {}
            Err(e) => {
                tracing::debug!(%peer, "Local to remote copy failed: {}", e);
                drop(local_read);
                teardown.fire().await;
            }
        }
    };

    let stderr_drain = async {
        let mut stderr = stderr;
        let (collected, result) = drain(&mut stderr, teardown.token()).await;
        if let Err(e) = result {
            tracing::debug!(%peer, "Remote stderr read failed: {}", e);
        }
        let text = String::from_utf8_lossy(&collected);
        let text = text.trim();
        if !text.is_empty() {
            tracing::warn!(%peer, "Remote stderr: {}", text);
        }
    };

    tokio::join!(remote_to_local, local_to_remote, stderr_drain);
    tracing::debug!(%peer, "Tunnel connection closed");
}
