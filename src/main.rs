//! HTTP Tunnel
//!
//! Relays arbitrary TCP streams over networks that only let HTTP(S)
//! through.
//!
//! - `http-tunnel client` accepts local TCP connections and carries each
//!   one as two long-lived HTTP exchanges (an upload and a download leg)
//!   to the tunnel endpoint.
//! - `http-tunnel server` terminates those exchanges and bridges them to
//!   the target configured for the session's route.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod client;
mod config;
mod error;
mod protocol;
mod pump;
mod server;


use client::{ClientContext, LocalListener};
use config::{Config, SessionMode};
use server::{RouteTable, SessionTable, TableSettings, TunnelEndpoint};

#[derive(Parser, Debug)]
#[command(name = "http-tunnel")]
#[command(author, version, about = "Tunnel TCP connections through HTTP")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to the per-user config directory)
    #[arg(short, long, global = true, env = "HTTP_TUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept local TCP connections and tunnel them to the endpoint
    Client(ClientArgs),

    /// Serve the tunnel endpoint and connect sessions to their targets
    Server(ServerArgs),
}

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Tunnel endpoint URL
    #[arg(short, long, env = "HTTP_TUNNEL_URL")]
    url: Option<String>,

    /// Session id (the route the endpoint connects to)
    #[arg(short, long)]
    id: Option<String>,

    /// Local port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Local address to listen on
    #[arg(long)]
    listen_host: Option<String>,

    /// Reuse the session id for every connection instead of suffixing it
    #[arg(long)]
    shared: bool,
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to serve the endpoint on
    #[arg(short, long)]
    bind: Option<String>,

    /// URL path of the endpoint
    #[arg(long)]
    path: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::Client(args)) => run_client(args, config).await,
        Some(Commands::Server(args)) => run_server(args, config).await,
        None => {
            eprintln!("No command specified. Use --help for usage information.");
            eprintln!();
            eprintln!("Quick start:");
            eprintln!("  http-tunnel server -b 0.0.0.0:57244                 Serve the endpoint");
            eprintln!(
                "  http-tunnel client -u http://host:57244/tunnel -i yan -p 8888"
            );
            std::process::exit(1);
        }
    }
}

async fn run_client(args: ClientArgs, mut config: Config) -> Result<()> {
    if let Some(url) = args.url {
        config.client.tunnel_url = url;
    }
    if let Some(id) = args.id {
        config.client.session_id = id;
    }
    if let Some(port) = args.port {
        config.client.listen_port = port;
    }
    if let Some(host) = args.listen_host {
        config.client.listen_host = host;
    }
    if args.shared {
        config.client.session_mode = SessionMode::Shared;
    }

    let ctx = Arc::new(
        ClientContext::from_config(&config).context("Failed to set up tunnel client")?,
    );
    let addr = format!(
        "{}:{}",
        config.client.listen_host, config.client.listen_port
    );
    let listener = LocalListener::bind(
        &addr,
        ctx,
        &config.client.session_id,
        config.client.session_mode,
    )
    .await
    .with_context(|| format!("Failed to listen on {}", addr))?;

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(listener.run(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("\nShutting down...");
    shutdown.cancel();
    handle.await?;
    Ok(())
}

async fn run_server(args: ServerArgs, mut config: Config) -> Result<()> {
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(path) = args.path {
        config.server.path = path;
    }

    let routes = RouteTable::new(config.routes.clone());
    if routes.is_empty() {
        warn!("No [[route]] entries configured; every session will be rejected");
    } else {
        info!("Loaded {} route(s)", routes.len());
    }

    let shutdown = CancellationToken::new();
    let table = SessionTable::new(routes, TableSettings::from(&config), shutdown.clone());
    let endpoint = TunnelEndpoint::new(
        table,
        &config.server.path,
        &config.server.response_content_type,
    );

    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });

    endpoint
        .serve(listener, shutdown)
        .await
        .context("Tunnel endpoint failed")
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
