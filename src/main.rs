//! wsrelay
//!
//! Relays raw TCP over WebSocket.
//!
//! `wsrelay serve` accepts WebSocket upgrades that carry a shared secret in
//! `Authorization` and a destination in `X-Proxy-Target`, connects to that
//! destination, and pumps bytes both ways until either side closes.
//!
//! `wsrelay connect` is the matching client: it listens locally and carries
//! each accepted connection through the relay.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod client;
mod config;
mod error;
mod protocol;
mod server;
mod tunnel;

use client::TunnelClient;
use config::Config;
use protocol::{Secret, TargetAddress};
use server::RelayServer;

#[derive(Parser, Debug)]
#[command(name = "wsrelay")]
#[command(author, version, about = "Authenticated TCP-over-WebSocket relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "WSRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay
    Serve(ServeArgs),

    /// Forward a local port through a relay
    Connect(ConnectArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(short, long, env = "WSRELAY_LISTEN")]
    listen: Option<String>,

    /// Shared secret clients must send in the Authorization header
    #[arg(long, env = "WSRELAY_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Read the shared secret from a file
    #[arg(long, conflicts_with = "secret")]
    secret_file: Option<PathBuf>,

    /// Seconds to wait for an outbound connection
    #[arg(long)]
    connect_timeout: Option<u64>,
}

#[derive(Parser, Debug)]
struct ConnectArgs {
    /// Relay URL (ws:// or wss://)
    #[arg(short, long, env = "WSRELAY_SERVER")]
    server: Option<String>,

    /// Token sent in the Authorization header
    #[arg(short = 'k', long, env = "WSRELAY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Destination the relay should connect to, as host:port
    #[arg(short, long)]
    target: TargetAddress,

    /// Local address to accept connections on
    #[arg(short, long, default_value = "127.0.0.1:0")]
    listen: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve(args) => run_serve(args, config).await,
        Commands::Connect(args) => run_connect(args, config).await,
    }
}

async fn run_serve(args: ServeArgs, config: Config) -> Result<()> {
    let mut settings = config.server.settings();
    if let Some(listen) = args.listen {
        settings.listen = listen;
    }
    if let Some(secs) = args.connect_timeout {
        settings.connect_timeout = std::time::Duration::from_secs(secs);
    }

    let secret = match (args.secret, args.secret_file) {
        (Some(secret), _) => Secret::new(secret)?,
        (None, Some(path)) => Secret::load(&path)?,
        (None, None) => config.server.secret()?,
    };

    let server = RelayServer::bind(settings, secret).await?;
    shutdown_on_ctrl_c(server.shutdown_token());
    server.run().await
}

async fn run_connect(args: ConnectArgs, config: Config) -> Result<()> {
    let server = args
        .server
        .or(config.client.server)
        .context("Relay URL required. Use --server, set WSRELAY_SERVER, or add server to [client] in the config file")?;
    let token = args
        .token
        .or(config.client.token)
        .context("Token required. Use --token, set WSRELAY_TOKEN, or add token to [client] in the config file")?;

    let client = TunnelClient::new(&server, token, args.target, &args.listen)?;
    shutdown_on_ctrl_c(client.shutdown_token());
    client.run().await
}

fn shutdown_on_ctrl_c(shutdown: tokio_util::sync::CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            shutdown.cancel();
        }
    });
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
