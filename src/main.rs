use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wormhole_cli::RoomOptions;

#[derive(Parser)]
#[command(name = "wormhole")]
#[command(version, about = "Resumable peer-to-peer file transfer and chat", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Clone)]
struct RoomArgs {
    /// Room secret shared by everyone in the room (prompted if not provided)
    #[arg(short, long, env = "WORMHOLE_ROOM")]
    room: Option<String>,

    /// Nickname shown in chat
    #[arg(short, long, env = "WORMHOLE_NICK")]
    nick: Option<String>,

    /// Ticket of a peer to dial, may be repeated
    #[arg(short, long = "peer")]
    peers: Vec<String>,

    /// Seconds a sender waits for the receiver's handshake (waits forever if not set)
    #[arg(long, env = "WORMHOLE_HANDSHAKE_TIMEOUT")]
    handshake_timeout: Option<u64>,
}

impl From<RoomArgs> for RoomOptions {
    fn from(args: RoomArgs) -> Self {
        RoomOptions {
            room: args.room,
            nick: args.nick,
            peers: args.peers,
            handshake_timeout: args.handshake_timeout.map(Duration::from_secs),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file or folder to everyone in a room
    Send {
        /// Path to the file or folder to send
        path: PathBuf,

        #[command(flatten)]
        room: RoomArgs,
    },

    /// Receive into a directory, resuming any earlier partial transfer
    Receive {
        /// Destination directory (defaults to current directory)
        #[arg(default_value = ".")]
        dir: PathBuf,

        #[command(flatten)]
        room: RoomArgs,
    },

    /// Chat in a room
    Chat {
        #[command(flatten)]
        room: RoomArgs,
    },

    /// Interactive shell (the default)
    Shell {
        #[command(flatten)]
        room: RoomArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Some(Commands::Send { path, room }) => {
            wormhole_cli::run_send(&path, room.into()).await?;
        }
        Some(Commands::Receive { dir, room }) => {
            wormhole_cli::run_receive(&dir, room.into()).await?;
        }
        Some(Commands::Chat { room }) => {
            wormhole_cli::run_chat(room.into()).await?;
        }
        Some(Commands::Shell { room }) => {
            wormhole_cli::run_shell(room.into()).await?;
        }
        None => {
            wormhole_cli::run_shell(RoomOptions::default()).await?;
        }
    }

    Ok(())
}
