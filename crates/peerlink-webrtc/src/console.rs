//! Interactive commands read from stdin, and event reporting.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use peerlink_common::core::catalog::CatalogAnnouncement;
use peerlink_common::core::identity::PeerIdentity;
use peerlink_common::core::node::NodeEvent;
use peerlink_common::core::registry::SessionInfo;
use peerlink_common::core::session::SignalingState;

use crate::output::{format_bytes, save_received_file};

pub const HELP: &str = "\
Commands:
  connect <pubkey>          open a session with a peer
  share <path>...           add files or folders to the advertised catalog
  catalog                   list files advertised by other peers
  get <pubkey> <name>       request a file from a connected peer
  say <pubkey> <text>       send a chat message to a connected peer
  close <pubkey>            close every session with a peer
  sessions                  list sessions
  help                      show this help
  quit                      exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect(PeerIdentity),
    Share(Vec<PathBuf>),
    Catalog,
    Get { peer: PeerIdentity, name: String },
    Say { peer: PeerIdentity, text: String },
    Close(PeerIdentity),
    Sessions,
    Help,
    Quit,
}

fn parse_peer(arg: Option<&str>) -> Result<PeerIdentity> {
    let arg = arg.context("Missing public key")?;
    arg.parse()
        .with_context(|| format!("Invalid public key: {}", arg))
}

/// Split off the first whitespace-delimited word.
fn split_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(i) => (&input[..i], input[i..].trim_start()),
        None => (input, ""),
    }
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>> {
    let (word, rest) = split_word(line.trim());
    let command = match word {
        "" => return Ok(None),
        "connect" => Command::Connect(parse_peer(Some(rest).filter(|s| !s.is_empty()))?),
        "share" => {
            let paths: Vec<PathBuf> = rest.split_whitespace().map(PathBuf::from).collect();
            if paths.is_empty() {
                bail!("Usage: share <path>...");
            }
            Command::Share(paths)
        }
        "catalog" | "ls" => Command::Catalog,
        "get" => {
            let (peer, name) = split_word(rest);
            if name.is_empty() {
                bail!("Usage: get <pubkey> <name>");
            }
            Command::Get {
                peer: parse_peer(Some(peer))?,
                name: name.to_string(),
            }
        }
        "say" => {
            let (peer, text) = split_word(rest);
            if text.is_empty() {
                bail!("Usage: say <pubkey> <text>");
            }
            Command::Say {
                peer: parse_peer(Some(peer))?,
                text: text.to_string(),
            }
        }
        "close" => Command::Close(parse_peer(Some(rest).filter(|s| !s.is_empty()))?),
        "sessions" => Command::Sessions,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => bail!("Unknown command '{}', type 'help' for a list", other),
    };
    Ok(Some(command))
}

/// Read stdin line by line until EOF.
pub fn read_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

pub fn print_catalogs(catalogs: &[CatalogAnnouncement]) {
    if catalogs.is_empty() {
        eprintln!("No catalogs seen yet");
        return;
    }
    for catalog in catalogs {
        eprintln!("{} ({} files)", catalog.advertiser, catalog.entries.len());
        for entry in &catalog.entries {
            let size = entry
                .size()
                .map(format_bytes)
                .unwrap_or_else(|| "unknown size".to_string());
            eprintln!("  {}  [{}]", entry.name, size);
        }
    }
}

pub fn print_sessions(sessions: &[SessionInfo]) {
    if sessions.is_empty() {
        eprintln!("No sessions");
        return;
    }
    for info in sessions {
        eprintln!(
            "{}  {}  {}  {}",
            info.session_id, info.peer, info.role, info.state
        );
    }
}

/// Print one node event. Received files are saved under `output_dir`.
pub async fn report_event(event: NodeEvent, output_dir: &Path) {
    match event {
        NodeEvent::SessionStateChanged { peer, state, .. } => match state {
            SignalingState::Connected | SignalingState::Terminated(_) => {}
            state => log::debug!("Session with {}: {}", peer.short(), state),
        },
        NodeEvent::Connected { peer, .. } => {
            eprintln!("Connected to {}", peer);
        }
        NodeEvent::SessionFailed { peer, failure, .. } => {
            eprintln!("Session with {} failed: {}", peer, failure);
        }
        NodeEvent::CatalogUpdated {
            advertiser,
            entries,
        } => {
            eprintln!("{} shares {} file(s)", advertiser, entries.len());
        }
        NodeEvent::FileReceived {
            peer,
            filename,
            data,
            ..
        } => match save_received_file(output_dir, &filename, &data).await {
            Ok(path) => eprintln!(
                "Received '{}' ({}) from {} -> {}",
                filename,
                format_bytes(data.len() as u64),
                peer.short(),
                path.display()
            ),
            Err(e) => eprintln!("Received '{}' but failed to save it: {:#}", filename, e),
        },
        NodeEvent::TransferFailed {
            peer,
            filename,
            error,
            ..
        } => {
            eprintln!("Transfer of '{}' from {} failed: {}", filename, peer.short(), error);
        }
        NodeEvent::MessageReceived { peer, text, .. } => {
            eprintln!("<{}> {}", peer.short(), text);
        }
        NodeEvent::ChannelClosed { peer, .. } => {
            eprintln!("Connection to {} closed", peer);
        }
    }
}
