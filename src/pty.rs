// ABOUTME: Pseudo-terminal adapter: spawns a shell on a PTY and exposes async streams.
// ABOUTME: Native backend uses portable-pty with blocking I/O bridged to tokio pipes.

use crate::ssh::{BoxedReader, BoxedWriter};
use async_trait::async_trait;
use portable_pty::{ChildKiller, CommandBuilder, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub width: u32,
    pub height: u32,
}

impl TermSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Geometry as the OS sees it. Values beyond u16 saturate.
    pub fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: u16::try_from(self.height).unwrap_or(u16::MAX),
            cols: u16::try_from(self.width).unwrap_or(u16::MAX),
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    Open(String),

    #[error("failed to spawn shell {shell}: {reason}")]
    Spawn { shell: String, reason: String },

    #[error("failed to resize pty: {0}")]
    Resize(String),

    #[error("failed to wait for shell: {0}")]
    Wait(String),
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// How the shell process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: u32,
    /// True when the process was killed after the hang-up grace period.
    pub killed: bool,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == 0 && !self.killed
    }
}

/// Program and arguments to run on the PTY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// `$SHELL`, falling back to bash.
    pub fn from_env() -> Self {
        Self::new(std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string()))
    }
}

/// Geometry control for a running PTY.
pub trait PtyControl: Send + Sync {
    fn resize(&self, size: TermSize) -> Result<()>;
}

/// The process attached to a PTY.
#[async_trait]
pub trait ShellProcess: Send {
    /// Wait for exit. If it has not exited within `grace` it is killed.
    async fn wait(self: Box<Self>, grace: Duration) -> Result<ExitStatus>;
}

/// A shell running on a freshly allocated PTY.
pub struct PtyProcess {
    /// Terminal output.
    pub reader: BoxedReader,
    /// Terminal input.
    pub writer: BoxedWriter,
    pub control: Arc<dyn PtyControl>,
    pub process: Box<dyn ShellProcess>,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess").finish_non_exhaustive()
    }
}

/// Allocates PTYs and spawns shells on them.
pub trait PtySystem: Send + Sync {
    fn spawn(&self, shell: &ShellCommand, size: TermSize) -> Result<PtyProcess>;
}

/// PTY backend for the host OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtySystem;

impl PtySystem for NativePtySystem {
    fn spawn(&self, shell: &ShellCommand, size: TermSize) -> Result<PtyProcess> {
        let pair = native_pty_system()
            .openpty(size.to_pty_size())
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&shell.program);
        cmd.args(&shell.args);
        if std::env::var_os("TERM").is_none() {
            cmd.env("TERM", "xterm-256color");
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn {
                shell: shell.program.clone(),
                reason: e.to_string(),
            })?;
        // Only the child keeps the slave side open, so its exit ends our reads.
        drop(pair.slave);

        let pty_reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Open(format!("failed to get pty reader: {}", e)))?;
        let pty_writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Open(format!("failed to get pty writer: {}", e)))?;

        let runtime = tokio::runtime::Handle::current();
        let (reader, reader_end) = tokio::io::duplex(crate::ssh::channel::PIPE_CAPACITY);
        let (writer, writer_end) = tokio::io::duplex(crate::ssh::channel::PIPE_CAPACITY);

        spawn_output_thread(runtime.clone(), pty_reader, reader_end);
        spawn_input_thread(runtime, pty_writer, writer_end);

        tracing::info!(shell = %shell.program, cols = size.width, rows = size.height, "Spawned shell on pty");

        let killer = child.clone_killer();
        Ok(PtyProcess {
            reader: Box::new(reader),
            writer: Box::new(writer),
            control: Arc::new(NativeControl {
                master: parking_lot::Mutex::new(pair.master),
            }),
            process: Box::new(NativeProcess { child, killer }),
        })
    }
}

/// PTY output -> async pipe. Ends when the shell side of the PTY is gone.
fn spawn_output_thread(
    runtime: tokio::runtime::Handle,
    mut pty_reader: Box<dyn Read + Send>,
    mut pipe: tokio::io::DuplexStream,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match pty_reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if runtime.block_on(pipe.write_all(&buf[..n])).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // EIO is how Linux reports a hung-up PTY.
                    tracing::debug!("PTY read ended: {}", e);
                    break;
                }
            }
        }
        let _ = runtime.block_on(pipe.shutdown());
    });
}

/// Async pipe -> PTY input. Ends when the pipe is shut down or the PTY rejects writes.
fn spawn_input_thread(
    runtime: tokio::runtime::Handle,
    mut pty_writer: Box<dyn Write + Send>,
    mut pipe: tokio::io::DuplexStream,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match runtime.block_on(pipe.read(&mut buf)) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Err(e) = pty_writer.write_all(&buf[..n]).and_then(|_| pty_writer.flush())
                    {
                        tracing::debug!("PTY write failed: {}", e);
                        break;
                    }
                }
            }
        }
    });
}

struct NativeControl {
    master: parking_lot::Mutex<Box<dyn portable_pty::MasterPty + Send>>,
}

impl PtyControl for NativeControl {
    fn resize(&self, size: TermSize) -> Result<()> {
        self.master
            .lock()
            .resize(size.to_pty_size())
            .map_err(|e| PtyError::Resize(e.to_string()))?;
        tracing::debug!(cols = size.width, rows = size.height, "PTY resized");
        Ok(())
    }
}

struct NativeProcess {
    child: Box<dyn portable_pty::Child + Send + Sync>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

#[async_trait]
impl ShellProcess for NativeProcess {
    async fn wait(self: Box<Self>, grace: Duration) -> Result<ExitStatus> {
        let NativeProcess { mut child, mut killer } = *self;
        let mut waiter = tokio::task::spawn_blocking(move || child.wait());

        let (status, killed) = match tokio::time::timeout(grace, &mut waiter).await {
            Ok(joined) => (joined, false),
            Err(_) => {
                tracing::debug!("Shell still running after {:?}, killing it", grace);
                if let Err(e) = killer.kill() {
                    tracing::warn!("Failed to kill shell: {}", e);
                }
                (waiter.await, true)
            }
        };

        let status = status
            .map_err(|e| PtyError::Wait(e.to_string()))?
            .map_err(|e| PtyError::Wait(e.to_string()))?;
        Ok(ExitStatus {
            code: status.exit_code(),
            killed,
        })
    }
}
