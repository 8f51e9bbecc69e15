// ABOUTME: Entry point for the burrow CLI application.
// ABOUTME: Parses arguments and dispatches to appropriate command handlers.

mod cli;

use burrow::config::{Config, ConnectionConfig};
use burrow::error::{Error, Result};
use burrow::remote_fs;
use burrow::scp;
use burrow::server::Server;
use burrow::ssh::Client;
use burrow::tunnel::{Tunnel, TunnelConfig};
use clap::Parser;
use cli::{Cli, ClientArgs, Commands, FsAction};
use std::env;
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbose flag
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let cwd = env::current_dir()?;
    let config = Config::resolve(cli.config.as_deref(), &cwd)?;

    match cli.command {
        Commands::Serve {
            listen,
            host_key,
            generate_host_key,
            shell,
        } => {
            let mut server_config = config.server.unwrap_or_default();
            if let Some(listen) = listen {
                server_config = server_config.listen(listen);
            }
            if let Some(host_key) = host_key {
                server_config = server_config.host_key(host_key);
            }
            if generate_host_key {
                server_config = server_config.generate_host_key(true);
            }
            if let Some(shell) = shell {
                server_config = server_config.shell(shell);
            }
            serve(server_config).await.map(|_| 0)
        }
        Commands::Tunnel { client, forwards } => {
            let connection = connection_config(config.connection, &client)?;
            let tunnels = if forwards.is_empty() {
                config.tunnels
            } else {
                forwards
            };
            if tunnels.is_empty() {
                return Err(Error::InvalidConfig(
                    "no tunnels given: pass -L or list them under `tunnels:`".to_string(),
                ));
            }
            tunnel(connection, tunnels).await.map(|_| 0)
        }
        Commands::Copy {
            client,
            source,
            destination,
        } => {
            let connection = connection_config(config.connection, &client)?;
            let client = Client::connect(connection.client_config()?).await?;
            let result = scp::copy_file(&client, &source, &destination).await;
            client.disconnect().await?;
            result?;
            Ok(0)
        }
        Commands::Exec { client, command } => {
            let connection = connection_config(config.connection, &client)?;
            let client = Client::connect(connection.client_config()?).await?;
            let result = client.exec(&command.join(" ")).await;
            client.disconnect().await?;
            let output = result?;

            std::io::stdout().write_all(&output.stdout)?;
            std::io::stderr().write_all(&output.stderr)?;
            Ok(output.exit_code as i32)
        }
        Commands::Fs { client, action } => {
            let connection = connection_config(config.connection, &client)?;
            let client = Client::connect(connection.client_config()?).await?;
            let result = fs(&client, action).await;
            client.disconnect().await?;
            result
        }
    }
}

/// Command-line flags layered over the `connection:` section.
fn connection_config(
    configured: Option<ConnectionConfig>,
    args: &ClientArgs,
) -> Result<ConnectionConfig> {
    let mut connection = match (args.host.clone(), configured) {
        (Some(host), Some(mut configured)) => {
            configured.host = host;
            configured
        }
        (Some(host), None) => ConnectionConfig::new(host),
        (None, Some(configured)) => configured,
        (None, None) => {
            return Err(Error::InvalidConfig(
                "no jump host given: pass --host or set `connection.host`".to_string(),
            ));
        }
    };

    if let Some(key) = &args.key {
        connection.key = Some(key.clone());
    }
    if let Some(known_hosts) = &args.known_hosts {
        connection.known_hosts = Some(known_hosts.clone());
    }
    if args.trust_first_use {
        connection.trust_first_connection = true;
    }
    Ok(connection)
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, shutting down");
            token.cancel();
        }
    });
}

async fn serve(config: burrow::server::ServerConfig) -> Result<()> {
    let server = Server::bind(config).await?;
    cancel_on_interrupt(server.shutdown_token());
    server.run().await;
    Ok(())
}

async fn tunnel(connection: ConnectionConfig, configs: Vec<TunnelConfig>) -> Result<()> {
    let client = Arc::new(Client::connect(connection.client_config()?).await?);

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::with_capacity(configs.len());
    for config in configs {
        let tunnel = Tunnel::bind(client.clone(), config).await?;
        let token = tunnel.shutdown_token();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            stop.cancelled().await;
            token.cancel();
        });
        tasks.push(tunnel.run());
    }
    cancel_on_interrupt(shutdown.clone());

    // The first tunnel to fail ends the command.
    futures::future::try_join_all(tasks).await?;
    Ok(())
}

async fn fs(client: &Client, action: FsAction) -> Result<i32> {
    match action {
        FsAction::Exists { path } => {
            let found = remote_fs::exists(client, &path).await?;
            Ok(if found { 0 } else { 1 })
        }
        FsAction::Mkdir { path } => {
            remote_fs::make_dir(client, &path).await?;
            Ok(0)
        }
        FsAction::Rmdir { path } => {
            remote_fs::remove_dir(client, &path).await?;
            Ok(0)
        }
        FsAction::Rm { path } => {
            remote_fs::remove_file(client, &path).await?;
            Ok(0)
        }
        FsAction::Cat { path } => {
            let file = remote_fs::read_file(client, &path).await?;
            std::io::stdout().write_all(&file.data)?;
            Ok(0)
        }
    }
}
