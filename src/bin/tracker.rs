//! Tracker Application
//!
//! Keeps the membership table and song queue and tells peers when to seed,
//! listen and play.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mob_radio::{config::AppConfig, network::local_ip, tracker::status, tracker::TrackerServer};

#[derive(Parser, Debug)]
#[command(author, version, about = "mob tracker: membership, song queue and playback sync")]
struct Args {
    /// Control port peers connect to
    port: Option<u16>,

    /// Config file (defaults to the per-user config location)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port for the HTTP status API
    #[arg(long)]
    status_port: Option<u16>,

    /// Do not serve the status API
    #[arg(long)]
    no_status: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = AppConfig::load(args.config.as_deref()).context("Failed to load config")?;
    if let Some(port) = args.port {
        config.tracker.port = port;
    }
    if args.status_port.is_some() {
        config.tracker.status_port = args.status_port;
    }
    if args.no_status {
        config.tracker.status_port = None;
    }

    let ip = local_ip().context("Error: not connected to the internet.")?;

    let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.tracker.port);
    let server = TrackerServer::bind(bind, &config.tracker)
        .await
        .context("Failed to start tracker")?;

    println!("mob tracker listening on: {}:{} ...", ip, config.tracker.port);

    if let Some(status_port) = config.tracker.status_port {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), status_port);
        let state = server.state();
        tokio::spawn(async move {
            if let Err(e) = status::serve(addr, state).await {
                tracing::error!("Status API stopped: {}", e);
            }
        });
    }

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down...");
            on_signal.cancel();
        }
    });

    server.run(shutdown).await;
    Ok(())
}
