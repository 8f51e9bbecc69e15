// ABOUTME: Remote filesystem helpers run as shell commands over the SSH connection.
// ABOUTME: Outcomes are classified by exit status, never by matching command output.

use crate::ssh::{self, Client, CommandOutput, quote};
use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("file or directory already exists: {0}")]
    AlreadyExists(String),

    #[error("remote command failed with status {status}: {stderr}")]
    Failed { status: u32, stderr: String },

    #[error(transparent)]
    Ssh(#[from] ssh::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Runs a command remotely and captures its output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> ssh::Result<CommandOutput>;
}

#[async_trait]
impl CommandRunner for Client {
    async fn run(&self, command: &str) -> ssh::Result<CommandOutput> {
        self.exec(command).await
    }
}

/// Contents of a remote file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Final path component.
    pub name: String,
    pub data: Vec<u8>,
}

fn failed(output: &CommandOutput) -> FsError {
    FsError::Failed {
        status: output.exit_code,
        stderr: output.stderr_lossy().trim().to_string(),
    }
}

/// Whether anything exists at `path`.
pub async fn exists<R: CommandRunner + ?Sized>(runner: &R, path: &str) -> Result<bool> {
    let output = runner.run(&format!("test -e {}", quote(path))).await?;
    match output.exit_code {
        0 => Ok(true),
        1 => Ok(false),
        _ => Err(failed(&output)),
    }
}

async fn run_checked<R: CommandRunner + ?Sized>(runner: &R, command: String) -> Result<CommandOutput> {
    tracing::debug!(command = %command, "Running remote fs command");
    let output = runner.run(&command).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(failed(&output))
    }
}

pub async fn make_dir<R: CommandRunner + ?Sized>(runner: &R, path: &str) -> Result<()> {
    if exists(runner, path).await? {
        return Err(FsError::AlreadyExists(path.to_string()));
    }
    run_checked(runner, format!("mkdir -- {}", quote(path))).await?;
    Ok(())
}

pub async fn remove_dir<R: CommandRunner + ?Sized>(runner: &R, path: &str) -> Result<()> {
    if !exists(runner, path).await? {
        return Err(FsError::NotFound(path.to_string()));
    }
    run_checked(runner, format!("rmdir -- {}", quote(path))).await?;
    Ok(())
}

pub async fn remove_file<R: CommandRunner + ?Sized>(runner: &R, path: &str) -> Result<()> {
    if !exists(runner, path).await? {
        return Err(FsError::NotFound(path.to_string()));
    }
    run_checked(runner, format!("rm -- {}", quote(path))).await?;
    Ok(())
}

pub async fn read_file<R: CommandRunner + ?Sized>(runner: &R, path: &str) -> Result<RemoteFile> {
    if !exists(runner, path).await? {
        return Err(FsError::NotFound(path.to_string()));
    }
    let output = run_checked(runner, format!("cat -- {}", quote(path))).await?;
    let name = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    Ok(RemoteFile {
        name,
        data: output.stdout,
    })
}
