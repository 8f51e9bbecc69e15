// ABOUTME: Application-wide error types for burrow.
// ABOUTME: Wraps the per-module errors so the CLI reports one type.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration file not found in {0}")]
    ConfigNotFound(PathBuf),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Ssh(#[from] crate::ssh::Error),

    #[error(transparent)]
    Serve(#[from] crate::server::ServeError),

    #[error(transparent)]
    Tunnel(#[from] crate::tunnel::Error),

    #[error(transparent)]
    Copy(#[from] crate::scp::Error),

    #[error(transparent)]
    Fs(#[from] crate::remote_fs::FsError),
}

pub type Result<T> = std::result::Result<T, Error>;
