// ABOUTME: Test support utilities.
// ABOUTME: In-memory transport and PTY doubles plus tracing setup.

#![allow(dead_code)]

use async_trait::async_trait;
use burrow::pty::{
    ExitStatus, PtyControl, PtyError, PtyProcess, PtySystem, ShellCommand, ShellProcess, TermSize,
};
use burrow::scp::{self, CopyHeader};
use burrow::ssh::{self, Session, SessionStreams, Transport};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

const PIPE: usize = 64 * 1024;

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests. Safe to call multiple times.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::from_default_env()
            .add_directive("burrow=debug".parse().unwrap())
            .add_directive("russh=info".parse().unwrap());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Poll `check` until it holds or a second has passed.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// The far side of a started mock session.
pub struct RemoteEnd {
    pub command: String,
    pub stdin: DuplexStream,
    pub stdout: DuplexStream,
    pub stderr: DuplexStream,
    /// Cancelled when the local side closes the session.
    pub hangup: CancellationToken,
}

/// What happened on a mock transport.
#[derive(Default)]
pub struct Record {
    pub commands: Mutex<Vec<String>>,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub stdin_eof: AtomicUsize,
    pub received: Mutex<Vec<(CopyHeader, Vec<u8>)>>,
}

type Remote = Arc<dyn Fn(RemoteEnd, Arc<Record>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Transport whose sessions run an in-process remote.
pub struct MockTransport {
    remote: Remote,
    fail_opens: AtomicUsize,
    pub record: Arc<Record>,
}

impl MockTransport {
    pub fn new<F, Fut>(remote: F) -> Self
    where
        F: Fn(RemoteEnd, Arc<Record>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            remote: Arc::new(move |end: RemoteEnd, record: Arc<Record>| -> BoxFuture<'static, ()> {
                Box::pin(remote(end, record))
            }),
            fail_opens: AtomicUsize::new(0),
            record: Arc::new(Record::default()),
        }
    }

    pub fn echo() -> Self {
        Self::new(echo_remote)
    }

    pub fn scp_receiver() -> Self {
        Self::new(scp_remote)
    }

    /// Refuse the next `n` session opens.
    pub fn fail_next_opens(self, n: usize) -> Self {
        self.fail_opens.store(n, Ordering::SeqCst);
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.record.commands.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Session = MockSession;

    async fn open_session(&self) -> ssh::Result<MockSession> {
        self.record.opened.fetch_add(1, Ordering::SeqCst);
        let refuse = self
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(ssh::Error::SessionOpen(
                "administratively prohibited".to_string(),
            ));
        }

        let (stdin, remote_stdin) = tokio::io::duplex(PIPE);
        let (stdout, remote_stdout) = tokio::io::duplex(PIPE);
        let (stderr, remote_stderr) = tokio::io::duplex(PIPE);
        Ok(MockSession {
            streams: Some(SessionStreams {
                stdin: Box::new(stdin),
                stdout: Box::new(stdout),
                stderr: Box::new(stderr),
            }),
            ends: Some((remote_stdin, remote_stdout, remote_stderr)),
            remote: self.remote.clone(),
            record: self.record.clone(),
            hangup: CancellationToken::new(),
        })
    }
}

pub struct MockSession {
    streams: Option<SessionStreams>,
    ends: Option<(DuplexStream, DuplexStream, DuplexStream)>,
    remote: Remote,
    record: Arc<Record>,
    hangup: CancellationToken,
}

#[async_trait]
impl Session for MockSession {
    async fn start(&mut self, command: &str) -> ssh::Result<()> {
        let (stdin, stdout, stderr) = self.ends.take().ok_or(ssh::Error::AlreadyStarted)?;
        self.record.commands.lock().push(command.to_string());
        let end = RemoteEnd {
            command: command.to_string(),
            stdin,
            stdout,
            stderr,
            hangup: self.hangup.clone(),
        };
        tokio::spawn((self.remote)(end, self.record.clone()));
        Ok(())
    }

    async fn start_shell(&mut self) -> ssh::Result<()> {
        self.start("").await
    }

    fn take_streams(&mut self) -> Option<SessionStreams> {
        self.streams.take()
    }

    async fn close(&mut self) -> ssh::Result<()> {
        self.ends = None;
        self.hangup.cancel();
        self.record.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Echo stdin back on stdout until stdin ends or the session is closed.
pub async fn echo_remote(mut end: RemoteEnd, record: Arc<Record>) {
    let mut buf = [0u8; 4096];
    loop {
        let n = tokio::select! {
            _ = end.hangup.cancelled() => return,
            n = end.stdin.read(&mut buf) => n,
        };
        match n {
            Ok(0) => {
                record.stdin_eof.fetch_add(1, Ordering::SeqCst);
                return;
            }
            Ok(n) => {
                if end.stdout.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
            Err(_) => return,
        }
    }
}

/// Behave like `scp -t`: read one file and acknowledge it.
pub async fn scp_remote(mut end: RemoteEnd, record: Arc<Record>) {
    match scp::receive(&mut end.stdin).await {
        Ok(file) => {
            record.received.lock().push(file);
            let _ = end.stdout.write_all(&[0, 0]).await;
        }
        Err(e) => {
            let _ = end
                .stdout
                .write_all(format!("\x02scp: {}\n", e).as_bytes())
                .await;
        }
    }
}

/// The test's handle on a mock shell: what it prints and what it is sent.
pub struct ShellEnd {
    /// Bytes written here appear as terminal output.
    pub output: DuplexStream,
    /// Terminal input typed by the client.
    pub input: DuplexStream,
    exited: CancellationToken,
}

impl ShellEnd {
    /// Make the shell exit on its own.
    pub fn exit(&self) {
        self.exited.cancel();
    }
}

/// PTY backend that hands each spawned shell to the test.
#[derive(Default)]
pub struct MockPty {
    pub resizes: Arc<Mutex<Vec<TermSize>>>,
    pub waits: Arc<AtomicUsize>,
    pub kills: Arc<AtomicUsize>,
    pub fail: AtomicBool,
    shells: Mutex<Vec<ShellEnd>>,
}

impl MockPty {
    pub fn failing() -> Self {
        let pty = Self::default();
        pty.fail.store(true, Ordering::SeqCst);
        pty
    }

    pub fn take_shell(&self) -> Option<ShellEnd> {
        self.shells.lock().pop()
    }

    pub fn last_size(&self) -> Option<TermSize> {
        self.resizes.lock().last().copied()
    }
}

impl PtySystem for MockPty {
    fn spawn(&self, shell: &ShellCommand, _size: TermSize) -> Result<PtyProcess, PtyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PtyError::Spawn {
                shell: shell.program.clone(),
                reason: "no ptys left".to_string(),
            });
        }

        let (reader, output) = tokio::io::duplex(PIPE);
        let (writer, input) = tokio::io::duplex(PIPE);
        let exited = CancellationToken::new();
        self.shells.lock().push(ShellEnd {
            output,
            input,
            exited: exited.clone(),
        });

        Ok(PtyProcess {
            reader: Box::new(reader),
            writer: Box::new(writer),
            control: Arc::new(MockControl {
                resizes: self.resizes.clone(),
            }),
            process: Box::new(MockProcess {
                exited,
                waits: self.waits.clone(),
                kills: self.kills.clone(),
            }),
        })
    }
}

struct MockControl {
    resizes: Arc<Mutex<Vec<TermSize>>>,
}

impl PtyControl for MockControl {
    fn resize(&self, size: TermSize) -> Result<(), PtyError> {
        self.resizes.lock().push(size);
        Ok(())
    }
}

struct MockProcess {
    exited: CancellationToken,
    waits: Arc<AtomicUsize>,
    kills: Arc<AtomicUsize>,
}

#[async_trait]
impl ShellProcess for MockProcess {
    async fn wait(self: Box<Self>, grace: Duration) -> Result<ExitStatus, PtyError> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = self.exited.cancelled() => Ok(ExitStatus { code: 0, killed: false }),
            _ = tokio::time::sleep(grace) => {
                self.kills.fetch_add(1, Ordering::SeqCst);
                Ok(ExitStatus { code: 1, killed: true })
            }
        }
    }
}
