// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Defines all subcommands and their arguments.

use burrow::config::HostSpec;
use burrow::tunnel::TunnelConfig;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "burrow")]
#[command(about = "SSH jump-host relay: PTY shells, TCP tunnels and scp uploads")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to burrow.yml (defaults to discovery in the current directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve interactive PTY shells over SSH
    Serve {
        /// Address to listen on
        #[arg(short, long)]
        listen: Option<String>,

        /// Host key file
        #[arg(long)]
        host_key: Option<PathBuf>,

        /// Generate the host key if the file is missing
        #[arg(long)]
        generate_host_key: bool,

        /// Shell to run instead of $SHELL
        #[arg(long)]
        shell: Option<String>,
    },

    /// Forward local ports through the jump host
    Tunnel {
        #[command(flatten)]
        client: ClientArgs,

        /// Forward as [bind_addr:]local_port:remote_host:remote_port
        #[arg(short = 'L', long = "forward", value_parser = parse_forward)]
        forwards: Vec<TunnelConfig>,
    },

    /// Upload a local file with scp
    Copy {
        #[command(flatten)]
        client: ClientArgs,

        /// Local file to upload
        source: PathBuf,

        /// Remote destination directory or path
        destination: String,
    },

    /// Run a command on the jump host
    Exec {
        #[command(flatten)]
        client: ClientArgs,

        /// Command line to run
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Inspect and modify the jump host filesystem
    Fs {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        action: FsAction,
    },
}

#[derive(Subcommand)]
pub enum FsAction {
    /// Exit 0 if the path exists, 1 otherwise
    Exists { path: String },
    /// Create a directory
    Mkdir { path: String },
    /// Remove an empty directory
    Rmdir { path: String },
    /// Remove a file
    Rm { path: String },
    /// Print a file to stdout
    Cat { path: String },
}

#[derive(Args, Debug, Clone, Default)]
pub struct ClientArgs {
    /// Jump host as [user@]host[:port]
    #[arg(short = 'H', long)]
    pub host: Option<HostSpec>,

    /// Private key to authenticate with
    #[arg(short = 'i', long)]
    pub key: Option<PathBuf>,

    /// known_hosts file to verify against
    #[arg(long)]
    pub known_hosts: Option<PathBuf>,

    /// Accept and record an unknown host key
    #[arg(long)]
    pub trust_first_use: bool,
}

/// Parse `[bind_addr:]local_port:remote_host:remote_port`.
pub fn parse_forward(s: &str) -> Result<TunnelConfig, String> {
    let parts: Vec<&str> = s.split(':').collect();
    let (bind, local, host, remote) = match parts.as_slice() {
        [local, host, remote] => (None, *local, *host, *remote),
        [bind, local, host, remote] => (Some(*bind), *local, *host, *remote),
        _ => {
            return Err(format!(
                "expected [bind_addr:]local_port:remote_host:remote_port, got {}",
                s
            ));
        }
    };

    let local_port = local
        .parse::<u16>()
        .map_err(|_| format!("invalid local port: {}", local))?;
    let remote_port = remote
        .parse::<u16>()
        .map_err(|_| format!("invalid remote port: {}", remote))?;
    if host.is_empty() {
        return Err("remote host cannot be empty".to_string());
    }

    let mut config = TunnelConfig::new(local_port, host, remote_port);
    if let Some(bind) = bind.filter(|b| !b.is_empty()) {
        config = config.local_addr(bind);
    }
    Ok(config)
}
