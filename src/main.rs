//! HttpWarp
//!
//! Tunnels TCP connections through an HTTP server that speaks WebSocket.
//!
//! - `httpwarp client` listens locally and forwards every connection to the
//!   relay, naming the backend the relay should dial
//! - `httpwarp relay` serves the WebSocket endpoint and dials the backends

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use httpwarp::{ClientListener, Config, RelayServer};

#[derive(Parser, Debug)]
#[command(name = "httpwarp")]
#[command(author, version, about = "Tunnel TCP connections over a WebSocket relay")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to the per-user config directory)
    #[arg(long, global = true, env = "HTTPWARP_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept local TCP connections and tunnel them to the relay
    Client(ClientArgs),

    /// Serve the WebSocket endpoint and dial backends for tunnel clients
    Relay(RelayArgs),
}

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Backend application host the relay should connect to
    #[arg(short = 'i', long)]
    backend_host: Option<String>,

    /// Backend application port (required)
    #[arg(short = 'P', long)]
    backend_port: Option<u16>,

    /// Local port to listen on
    #[arg(short = 'p', long)]
    listen_port: Option<u16>,

    /// Relay host, optionally with port
    #[arg(short = 'd', long, env = "HTTPWARP_RELAY")]
    relay: Option<String>,

    /// URL path of the relay's WebSocket endpoint
    #[arg(short = 'u', long)]
    path: Option<String>,

    /// Relay connect timeout in seconds
    #[arg(short = 't', long)]
    timeout: Option<u64>,

    /// Only send backend routing on the first message of each connection
    #[arg(long)]
    route_once: bool,

    /// Connect to the relay with wss://
    #[arg(long)]
    tls: bool,
}

#[derive(Parser, Debug)]
struct RelayArgs {
    /// Port to serve HTTP/WebSocket on
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Address to bind
    #[arg(short = 'b', long)]
    bind: Option<IpAddr>,

    /// URL path to upgrade
    #[arg(short = 'u', long)]
    path: Option<String>,

    /// Backend connect timeout in seconds
    #[arg(short = 't', long)]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::Client(args)) => run_client(args, config).await,
        Some(Commands::Relay(args)) => run_relay(args, config).await,
        None => {
            eprintln!("No command specified. Use --help for usage information.");
            eprintln!();
            eprintln!("Quick start:");
            eprintln!("  httpwarp relay -p 8080                          Serve /data/put on :8080");
            eprintln!(
                "  httpwarp client -d relay:8080 -P 22 -p 2222     Tunnel localhost:2222 to the relay's :22"
            );
            std::process::exit(1);
        }
    }
}

async fn run_client(args: ClientArgs, config: Config) -> Result<()> {
    let mut client = config.client;
    if let Some(host) = args.backend_host {
        client.backend_host = host;
    }
    if let Some(port) = args.backend_port {
        client.backend_port = port;
    }
    if let Some(port) = args.listen_port {
        client.listen_port = port;
    }
    if let Some(relay) = args.relay {
        client.relay = relay;
    }
    if let Some(path) = args.path {
        client.path = path;
    }
    if let Some(timeout) = args.timeout {
        client.connect_timeout_secs = timeout;
    }
    client.route_once |= args.route_once;
    client.tls |= args.tls;

    let listener = ClientListener::bind(Arc::new(client))
        .await
        .context("Failed to start client listener")?;
    listener.run().await?;
    Ok(())
}

async fn run_relay(args: RelayArgs, config: Config) -> Result<()> {
    let mut relay = config.relay;
    if let Some(port) = args.port {
        relay.port = port;
    }
    if let Some(bind) = args.bind {
        relay.bind = bind;
    }
    if let Some(path) = args.path {
        relay.path = path;
    }
    if let Some(timeout) = args.timeout {
        relay.connect_timeout_secs = timeout;
    }

    let server = RelayServer::bind(Arc::new(relay))
        .await
        .context("Failed to start relay")?;
    server.run().await.context("Relay server stopped")?;
    Ok(())
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
