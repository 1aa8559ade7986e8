//! Peer Application
//!
//! Joins a tracker, relays the current song to other peers and plays it in
//! sync with them. Driven from an interactive shell.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mob_radio::{
    config::AppConfig,
    media::default_sink,
    network::local_ip,
    peer::PeerNode,
    shell::{Command, BANNER, HELP, PROMPT},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "mob peer: internet radio over a relay chain")]
struct Args {
    /// Config file (defaults to the per-user config location)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory scanned for .mp3 files
    #[arg(long)]
    songs_dir: Option<PathBuf>,

    /// Tracker to join on startup
    #[arg(long)]
    join: Option<String>,
}

fn print_list(items: &[String]) {
    println!("[{}]", items.join(" "));
}

async fn join(node: &mut PeerNode, addr: &str) {
    println!("Joining tracker {}", addr);
    if let Err(e) = node.join(addr).await {
        println!("Error: {}", e);
    }
}

async fn leave(node: &mut PeerNode) {
    if node.is_joined() {
        println!("Leaving the tracker ...");
        node.leave().await;
        println!("done");
    }
}

/// Run one command. Returns false when the shell should exit.
async fn execute(node: &mut PeerNode, command: Command) -> bool {
    match command {
        Command::Join(addr) => join(node, &addr).await,
        Command::Leave => leave(node).await,
        Command::ListSongs => match node.list_songs().await {
            Ok(songs) => print_list(&songs),
            Err(e) => println!("Error: {}", e),
        },
        Command::ListPeers => match node.list_peers().await {
            Ok(peers) => print_list(&peers),
            Err(e) => println!("Error: {}", e),
        },
        Command::Play(song) => match node.play(&song).await {
            Ok(()) => println!("Enqueued {}", song),
            Err(e) => println!("Error: {}", e),
        },
        Command::Help => println!("{}", HELP),
        Command::Quit => {
            leave(node).await;
            return false;
        }
        Command::Empty => {}
    }
    true
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
    if let Some(dir) = args.songs_dir {
        config.peer.songs_dir = dir;
    }

    let ip = local_ip().context("Error: not connected to the internet.")?;
    let mut node = PeerNode::new(config, ip, default_sink());

    print!("{}", BANNER);
    println!();
    println!("internet radio version {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Local address {}, {} song(s) available", ip, node.catalog().songs().len());

    if let Some(addr) = args.join {
        join(&mut node, &addr).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{}", PROMPT);
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                leave(&mut node).await;
                break;
            }
        };

        // End of input behaves like `quit`
        let Some(line) = line else {
            leave(&mut node).await;
            break;
        };

        match Command::parse(&line) {
            Ok(command) => {
                if !execute(&mut node, command).await {
                    break;
                }
            }
            Err(e) => println!("Error: {}", e),
        }
    }

    Ok(())
}
