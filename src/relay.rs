// ABOUTME: Byte relay plumbing shared by the shell server and the tunnel.
// ABOUTME: Cancellable copy tasks, stderr draining and the single-fire teardown guard.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// How a copy task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// The reader reached end-of-stream after this many bytes.
    Finished(u64),
    /// The copy was cancelled before the reader ended.
    Cancelled,
}

/// Copy `reader` into `writer` until EOF, error or cancellation.
pub async fn copy_until_cancelled<R, W>(
    reader: &mut R,
    writer: &mut W,
    token: &CancellationToken,
) -> io::Result<CopyOutcome>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    tokio::select! {
        _ = token.cancelled() => Ok(CopyOutcome::Cancelled),
        r = tokio::io::copy(reader, writer) => r.map(CopyOutcome::Finished),
    }
}

/// Read `reader` to the end into memory, stopping early on cancellation.
///
/// Whatever was collected before an error or cancellation is returned with it.
pub async fn drain<R>(reader: &mut R, token: &CancellationToken) -> (Vec<u8>, io::Result<()>)
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = tokio::select! {
            _ = token.cancelled() => return (collected, Ok(())),
            r = reader.read(&mut buf) => r,
        };
        match n {
            Ok(0) => return (collected, Ok(())),
            Ok(n) => collected.extend_from_slice(&buf[..n]),
            Err(e) => return (collected, Err(e)),
        }
    }
}

type Action = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Single-fire teardown for one relay pair.
///
/// The first `fire` cancels the pair's token (stopping sibling copy tasks) and
/// runs the teardown action; every later or concurrent `fire` is a no-op.
pub struct Teardown {
    token: CancellationToken,
    action: Mutex<Option<Action>>,
}

impl std::fmt::Debug for Teardown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Teardown")
            .field("fired", &self.is_fired())
            .finish()
    }
}

impl Teardown {
    pub fn new<F, Fut>(token: CancellationToken, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            token,
            action: Mutex::new(Some(Box::new(move || -> BoxFuture<'static, ()> {
                Box::pin(action())
            }))),
        }
    }

    /// Token cancelled when the teardown fires. Copy tasks of the pair select on it.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_fired(&self) -> bool {
        self.action.lock().is_none()
    }

    /// Run the teardown if nobody has yet. Returns true for the caller that ran it.
    pub async fn fire(&self) -> bool {
        let action = self.action.lock().take();
        let Some(action) = action else {
            return false;
        };
        self.token.cancel();
        action().await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn counting_teardown(count: Arc<AtomicUsize>) -> Arc<Teardown> {
        Arc::new(Teardown::new(CancellationToken::new(), move || async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            count.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[tokio::test]
    async fn teardown_runs_once_when_fired_twice() {
        let count = Arc::new(AtomicUsize::new(0));
        let teardown = counting_teardown(count.clone());

        assert!(teardown.fire().await);
        assert!(!teardown.fire().await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(teardown.is_fired());
        assert!(teardown.token().is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_fires_run_the_action_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let teardown = counting_teardown(count.clone());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let teardown = teardown.clone();
                tokio::spawn(async move { teardown.fire().await })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn copy_stops_on_cancellation() {
        let (_writer, mut reader) = tokio::io::duplex(64);
        let mut sink = Vec::new();
        let token = CancellationToken::new();
        token.cancel();

        let outcome = copy_until_cancelled(&mut reader, &mut sink, &token)
            .await
            .unwrap();
        assert_eq!(outcome, CopyOutcome::Cancelled);
    }

    #[tokio::test]
    async fn copy_reports_bytes_on_eof() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        writer.write_all(b"ping").await.unwrap();
        drop(writer);

        let mut sink = Vec::new();
        let outcome = copy_until_cancelled(&mut reader, &mut sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, CopyOutcome::Finished(4));
        assert_eq!(sink, b"ping");
    }

    #[tokio::test]
    async fn drain_collects_until_eof() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        writer.write_all(b"nc: connection refused\n").await.unwrap();
        drop(writer);

        let (collected, result) = drain(&mut reader, &CancellationToken::new()).await;
        assert!(result.is_ok());
        assert_eq!(collected, b"nc: connection refused\n");
    }
}
