//! peerlink-webrtc: share files with peers over WebRTC data channels
//!
//! Peers find each other through Nostr relays: offers, answers and ICE
//! candidates are exchanged as signed relay events, and every peer announces
//! the files it shares as a catalog event. Once a data channel is open,
//! files are requested by name and sent in chunks.
//!
//! Build with: cargo build -p peerlink-webrtc

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nostr_sdk::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use peerlink_common::config::NodeConfig;
use peerlink_common::core::catalog::Catalog;
use peerlink_common::core::error::{is_interrupted, Interrupted};
use peerlink_common::core::identity::PeerIdentity;
use peerlink_common::core::node::{Node, NodeHandle};
use peerlink_common::core::transfer::CHUNK_SIZE;
use peerlink_common::signaling::nostr_protocol::DEFAULT_NOSTR_RELAYS;

mod console;
mod output;
mod signaling;
mod webrtc;

use crate::console::{parse_command, Command};
use crate::signaling::NostrSignalBus;
use crate::webrtc::{WebRtcFactory, DEFAULT_STUN_SERVER};

#[derive(Parser)]
#[command(name = "peerlink-webrtc")]
#[command(about = "Peer-to-peer file sharing over WebRTC with Nostr signaling")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Use verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the relays, share files and accept connections
    Run {
        /// File or folder to advertise (can be specified multiple times)
        #[arg(long, value_name = "PATH")]
        share: Vec<PathBuf>,

        /// Public key of a peer to connect to on startup
        #[arg(long, value_name = "PUBKEY")]
        connect: Option<String>,

        /// Directory for received files (defaults to current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Custom Nostr relay URLs (can be specified multiple times)
        #[arg(long, value_name = "URL")]
        relay: Vec<String>,

        /// Secret key (hex or nsec) to reuse an identity; a new one is
        /// generated otherwise
        #[arg(long, value_name = "KEY")]
        secret_key: Option<String>,

        /// STUN server URLs (can be specified multiple times)
        #[arg(long, value_name = "URL")]
        stun: Vec<String>,

        /// Only use host candidates (no STUN)
        #[arg(long, conflicts_with = "stun")]
        no_stun: bool,

        /// Seconds a session may take to open its data channel
        #[arg(long, value_name = "SECS", default_value_t = 30)]
        handshake_timeout: u64,

        /// Seconds without data before a file request is given up
        #[arg(long, value_name = "SECS", default_value_t = 30)]
        transfer_timeout: u64,

        /// Size of the chunks files are sent in
        #[arg(long, value_name = "BYTES", default_value_t = CHUNK_SIZE)]
        chunk_size: usize,

        /// Stay silent on requests for unknown files instead of answering
        /// with file_not_found
        #[arg(long)]
        no_not_found_reply: bool,
    },

    /// Generate a new identity
    Keygen,
}

fn main() {
    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")
        .and_then(|runtime| runtime.block_on(async_main()));

    if let Err(e) = result {
        if is_interrupted(&e) {
            // Exit with 128 + SIGINT (2) = 130, standard Unix convention
            std::process::exit(130);
        }
        eprintln!("Error: {:?}", e);
        std::process::exit(1);
    }
}

async fn async_main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging with filters for noisy internal modules
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = format!(
        "{},webrtc_ice=error,webrtc_sctp=warn,nostr_relay_pool=warn",
        log_level
    );
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&filter)).init();

    match cli.command {
        Commands::Run {
            share,
            connect,
            output,
            relay,
            secret_key,
            stun,
            no_stun,
            handshake_timeout,
            transfer_timeout,
            chunk_size,
            no_not_found_reply,
        } => {
            let keys = match secret_key {
                Some(secret) => Keys::parse(secret.trim()).context("Invalid secret key")?,
                None => Keys::generate(),
            };
            let connect = connect
                .map(|pubkey| pubkey.parse::<PeerIdentity>())
                .transpose()
                .context("Invalid --connect public key")?;

            let config = NodeConfig {
                handshake_timeout: Duration::from_secs(handshake_timeout),
                transfer_timeout: Duration::from_secs(transfer_timeout),
                chunk_size,
                reply_not_found: !no_not_found_reply,
                ..NodeConfig::default()
            };
            config.validate()?;

            let relays = if relay.is_empty() {
                DEFAULT_NOSTR_RELAYS.iter().map(|s| s.to_string()).collect()
            } else {
                relay
            };
            let ice_urls = if no_stun {
                Vec::new()
            } else if stun.is_empty() {
                vec![DEFAULT_STUN_SERVER.to_string()]
            } else {
                stun
            };
            let output_dir = match output {
                Some(dir) => dir,
                None => std::env::current_dir().context("Failed to get current directory")?,
            };

            run(RunOptions {
                keys,
                config,
                relays,
                ice_urls,
                share,
                connect,
                output_dir,
            })
            .await?;
        }

        Commands::Keygen => {
            let keys = Keys::generate();
            let secret = keys
                .secret_key()
                .to_bech32()
                .context("Failed to encode secret key")?;
            println!("Secret key: {}", secret);
            println!("Public key: {}", PeerIdentity::from(keys.public_key()));
        }
    }

    Ok(())
}

struct RunOptions {
    keys: Keys,
    config: NodeConfig,
    relays: Vec<String>,
    ice_urls: Vec<String>,
    share: Vec<PathBuf>,
    connect: Option<PeerIdentity>,
    output_dir: PathBuf,
}

async fn run(options: RunOptions) -> Result<()> {
    eprintln!("Connecting to {} relay(s)...", options.relays.len());
    let bus = Arc::new(NostrSignalBus::connect(options.keys, options.relays).await?);
    bus.subscribe().await?;
    let identity = bus.identity();

    let (bus_tx, bus_rx) = mpsc::channel(options.config.event_buffer);
    let receiver = bus.start_event_receiver(bus_tx);

    let factory = Arc::new(WebRtcFactory::new(options.ice_urls));
    let (node, handle, mut events) =
        Node::new(identity, options.config, bus.clone(), factory, bus_rx);
    let node_task = tokio::spawn(node.run());

    eprintln!("Your public key: {}", handle.local_identity());
    eprintln!("Relays: {}", bus.relay_urls().join(", "));

    let mut shared = Vec::new();
    if !options.share.is_empty() {
        share_paths(&handle, &mut shared, options.share).await?;
    }
    if let Some(peer) = options.connect {
        eprintln!("Connecting to {}...", peer);
        handle.start_session(peer).await?;
    }
    eprintln!("Type 'help' for commands.");

    let mut lines = console::read_lines();
    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nInterrupted, shutting down...");
                break Err(anyhow::Error::new(Interrupted));
            }
            line = lines.recv() => {
                let Some(line) = line else {
                    break Ok(());
                };
                match parse_command(&line) {
                    Ok(Some(Command::Quit)) => break Ok(()),
                    Ok(Some(command)) => {
                        if let Err(e) = execute(&handle, &mut shared, command).await {
                            eprintln!("Error: {:#}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => eprintln!("{:#}", e),
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    break Ok(());
                };
                console::report_event(event, &options.output_dir).await;
            }
        }
    };

    handle.shutdown().await;
    match node_task.await {
        Ok(Err(e)) => log::warn!("Node stopped with error: {:#}", e),
        Err(e) => log::warn!("Node task failed: {}", e),
        Ok(Ok(())) => {}
    }
    receiver.abort();
    bus.disconnect().await;

    result
}

async fn share_paths(
    handle: &NodeHandle,
    shared: &mut Vec<PathBuf>,
    paths: Vec<PathBuf>,
) -> Result<()> {
    for path in &paths {
        if !path.exists() {
            anyhow::bail!("Path not found: {}", path.display());
        }
    }
    let mut candidate = shared.clone();
    candidate.extend(paths);
    let catalog = Catalog::from_paths(&candidate)?;

    let count = catalog.len();
    handle.advertise(catalog).await?;
    *shared = candidate;
    eprintln!("Sharing {} file(s)", count);
    Ok(())
}

async fn execute(handle: &NodeHandle, shared: &mut Vec<PathBuf>, command: Command) -> Result<()> {
    match command {
        Command::Connect(peer) => {
            let session = handle.start_session(peer).await?;
            eprintln!("Offer sent to {} (session {})", peer, session);
        }
        Command::Share(paths) => share_paths(handle, shared, paths).await?,
        Command::Catalog => console::print_catalogs(&handle.remote_catalogs().await?),
        Command::Get { peer, name } => {
            handle.request_file(peer, name.clone()).await?;
            eprintln!("Requested '{}' from {}", name, peer.short());
        }
        Command::Say { peer, text } => handle.send_message(peer, text).await?,
        Command::Close(peer) => handle.close(peer).await?,
        Command::Sessions => console::print_sessions(&handle.sessions().await?),
        Command::Help => eprintln!("{}", console::HELP),
        Command::Quit => {}
    }
    Ok(())
}
