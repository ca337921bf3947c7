use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use console::style;
use dialoguer::{Input, theme::ColorfulTheme};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use wormhole_core::{
    Channel, IrohSwarm, PeerTicket, ReceiveProgress, Room, RoomEvent, SendProgress, Topic,
    TransferConfig, TransferProgress,
};

pub mod palette;
pub mod progress;
pub mod shell;

pub use progress::format_bytes;
pub use shell::run_shell;

use palette::NickPalette;
use progress::TransferView;

/// Room settings shared by every command.
#[derive(Debug, Clone, Default)]
pub struct RoomOptions {
    pub room: Option<String>,
    pub nick: Option<String>,
    pub peers: Vec<String>,
    pub handshake_timeout: Option<Duration>,
}

impl RoomOptions {
    pub fn config(&self) -> TransferConfig {
        let config = TransferConfig::default();
        match self.handshake_timeout {
            Some(timeout) => config.with_handshake_timeout(timeout),
            None => config,
        }
    }

    pub fn nick(&self) -> String {
        self.nick
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "anon".to_string())
    }

    /// The room secret, asking for it when none was given.
    fn room_or_prompt(&self) -> Result<String> {
        match &self.room {
            Some(room) => Ok(room.clone()),
            None => Ok(Input::<String>::with_theme(&ColorfulTheme::default())
                .with_prompt("Room secret")
                .interact_text()?),
        }
    }
}

/// Bind an endpoint for both topics of `room` and join it.
pub async fn open_room(
    room: &str,
    nick: &str,
    config: TransferConfig,
) -> Result<(IrohSwarm, Room, mpsc::Receiver<RoomEvent>)> {
    let swarm = IrohSwarm::bind(&[Topic::chat(room), Topic::files(room)]).await?;
    let (joined, events) = Room::join(&swarm, room, nick, config).await?;
    Ok((swarm, joined, events))
}

/// Dial every ticket, returning the number of connections opened.
pub async fn dial_all(swarm: &IrohSwarm, tickets: &[String]) -> Result<usize> {
    let mut connected = 0;
    for ticket in tickets {
        let ticket = PeerTicket::deserialize(ticket)?;
        connected += swarm.dial(&ticket).await?;
    }
    Ok(connected)
}

pub fn expand_path(input: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(input).to_string())
}

fn print_ticket(swarm: &IrohSwarm) {
    println!(
        "\n{} Share this ticket with your peers:\n",
        style("⚡").cyan()
    );
    println!("  {}", style(swarm.ticket()).green());
    println!();
}

pub async fn run_send(path: &Path, options: RoomOptions) -> Result<()> {
    let path = expand_path(&path.to_string_lossy());
    if !path.exists() {
        anyhow::bail!("Path does not exist: {}", path.display());
    }
    let room = options.room_or_prompt()?;

    println!(
        "\n{} Preparing to send: {}",
        style("⚡").cyan(),
        style(path.display()).green()
    );

    let (swarm, joined, mut events) = open_room(&room, &options.nick(), options.config()).await?;
    print_ticket(&swarm);
    dial_all(&swarm, &options.peers).await?;
    joined.send_path(&path).await?;

    println!("{}", style("Waiting for a receiver to connect...").dim());

    let mut view = TransferView::new();
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(event) = event else { break };

        match event {
            RoomEvent::PeerJoined {
                peer,
                channel: Channel::Files,
                ..
            } => view.println(format!("{} {}", style("Receiver connected:").green(), peer)),
            RoomEvent::Transfer { conn, progress } => {
                view.update(conn, &progress);
                match progress {
                    TransferProgress::Send(SendProgress::Finished { .. }) => {
                        println!("\n{} Transfer complete!", style("✓").green().bold());
                        break;
                    }
                    TransferProgress::Send(SendProgress::Closed)
                    | TransferProgress::Send(SendProgress::Error(_)) => {
                        let hint = style("Waiting for the receiver to reconnect...").dim();
                        view.println(hint.to_string());
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    joined.leave();
    swarm.shutdown().await?;
    Ok(())
}

pub async fn run_receive(dir: &Path, options: RoomOptions) -> Result<()> {
    let dir = expand_path(&dir.to_string_lossy());
    let room = options.room_or_prompt()?;

    let (swarm, joined, mut events) = open_room(&room, &options.nick(), options.config()).await?;
    print_ticket(&swarm);
    dial_all(&swarm, &options.peers).await?;
    joined.receive_into(&dir).await?;

    println!(
        "\n{} Receiving into {}",
        style("⚡").cyan(),
        style(dir.display()).green()
    );

    let mut view = TransferView::new();
    let mut saved = false;
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(event) = event else { break };

        match event {
            RoomEvent::PeerJoined {
                peer,
                channel: Channel::Files,
                ..
            } => view.println(format!("{} {}", style("Sender connected:").green(), peer)),
            RoomEvent::Transfer { conn, progress } => {
                view.update(conn, &progress);
                match progress {
                    TransferProgress::Receive(ReceiveProgress::Finished { .. }) => {
                        saved = true;
                        break;
                    }
                    TransferProgress::Receive(ReceiveProgress::Error(_)) => {
                        let hint = style("Waiting for the sender to reconnect...").dim();
                        view.println(hint.to_string());
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    joined.leave();
    swarm.shutdown().await?;
    if !saved {
        println!(
            "{}",
            style("Interrupted, run the same command again to resume.").yellow()
        );
    }
    Ok(())
}

pub async fn run_chat(options: RoomOptions) -> Result<()> {
    let room = options.room_or_prompt()?;
    let nick = options.nick();
    let (swarm, joined, mut events) = open_room(&room, &nick, options.config()).await?;
    print_ticket(&swarm);
    dial_all(&swarm, &options.peers).await?;

    println!(
        "{} Chatting in {} as {}. Empty line or Ctrl-C quits.",
        style("⚡").cyan(),
        style(&room).bold(),
        style(&nick).bold()
    );

    let mut palette = NickPalette::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let text = line.trim();
                if text.is_empty() {
                    break;
                }
                let message = joined.broadcast_chat(text).await?;
                println!("<{}> {}", palette.paint(&message.nick), message.text);
            }
            Some(event) = events.recv() => match event {
                RoomEvent::Chat { message, .. } => {
                    println!("<{}> {}", palette.paint(&message.nick), message.text);
                }
                RoomEvent::PeerJoined { peer, channel: Channel::Chat, .. } => {
                    println!("{}", style(format!("{peer} joined")).dim());
                }
                RoomEvent::PeerLeft { conn, channel: Channel::Chat, .. } => {
                    println!("{}", style(format!("peer {conn} left")).dim());
                }
                _ => {}
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    joined.leave();
    swarm.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_carries_handshake_timeout() {
        let options = RoomOptions {
            handshake_timeout: Some(Duration::from_secs(7)),
            ..Default::default()
        };
        assert_eq!(
            options.config().handshake_timeout,
            Some(Duration::from_secs(7))
        );
        assert_eq!(RoomOptions::default().config().handshake_timeout, None);
    }

    #[test]
    fn test_explicit_nick_wins() {
        let options = RoomOptions {
            nick: Some("ana".into()),
            ..Default::default()
        };
        assert_eq!(options.nick(), "ana");
    }

    #[test]
    fn test_expand_path_leaves_plain_paths() {
        assert_eq!(expand_path("a/b"), PathBuf::from("a/b"));
    }
}
