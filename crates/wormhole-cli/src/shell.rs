use std::path::PathBuf;

use anyhow::Result;
use console::style;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use wormhole_core::{Channel, ChatMessage, IrohSwarm, Room, RoomEvent};

use crate::palette::NickPalette;
use crate::progress::TransferView;
use crate::{RoomOptions, dial_all, expand_path, open_room};

/// One line of shell input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Host(String),
    Join { room: String, tickets: Vec<String> },
    Dial(String),
    Nick(String),
    Chat(String),
    Send(PathBuf),
    Receive(PathBuf),
    Stop,
    Ticket,
    Help,
    Quit,
    Empty,
}

impl ShellCommand {
    /// Bare text is chat; anything starting with `/` is a command.
    pub fn parse(line: &str) -> std::result::Result<Self, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(ShellCommand::Empty);
        }
        let Some(command) = line.strip_prefix('/') else {
            return Ok(ShellCommand::Chat(line.to_string()));
        };

        let (name, rest) = match command.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (command, ""),
        };
        let required = |what: &str| {
            if rest.is_empty() {
                Err(format!("usage: /{name} <{what}>"))
            } else {
                Ok(rest.to_string())
            }
        };

        match name {
            "host" => required("room").map(ShellCommand::Host),
            "join" => {
                let mut words = rest.split_whitespace();
                let room = words
                    .next()
                    .ok_or_else(|| "usage: /join <room> [ticket...]".to_string())?;
                Ok(ShellCommand::Join {
                    room: room.to_string(),
                    tickets: words.map(str::to_string).collect(),
                })
            }
            "dial" => required("ticket").map(ShellCommand::Dial),
            "nick" => required("name").map(ShellCommand::Nick),
            "chat" | "say" => required("message").map(ShellCommand::Chat),
            "send" => required("path").map(|p| ShellCommand::Send(expand_path(&p))),
            "receive" | "recv" => required("dir").map(|p| ShellCommand::Receive(expand_path(&p))),
            "stop" => Ok(ShellCommand::Stop),
            "ticket" => Ok(ShellCommand::Ticket),
            "help" | "?" => Ok(ShellCommand::Help),
            "quit" | "exit" => Ok(ShellCommand::Quit),
            other => Err(format!("unknown command /{other}, try /help")),
        }
    }
}

const HELP: &[(&str, &str)] = &[
    ("/host <room>", "create a room and print its ticket"),
    ("/join <room> [ticket...]", "join a room, dialling any tickets given"),
    ("/dial <ticket>", "connect to a peer in the current room"),
    ("/nick <name>", "change your nickname"),
    ("/chat <msg>", "send a chat line (bare text works too)"),
    ("/send <path>", "offer a file or folder to every peer"),
    ("/receive <dir>", "accept transfers into a directory"),
    ("/stop", "stop offering or accepting new transfers"),
    ("/ticket", "show the ticket for this room"),
    ("/help", "show this help"),
    ("/quit", "leave and exit"),
];

struct Session {
    swarm: IrohSwarm,
    room: Room,
}

struct Shell {
    options: RoomOptions,
    nick: String,
    session: Option<Session>,
    events: Option<mpsc::Receiver<RoomEvent>>,
    palette: NickPalette,
    view: TransferView,
}

enum Input {
    Line(Option<String>),
    Event(RoomEvent),
    Interrupt,
}

pub async fn run_shell(options: RoomOptions) -> Result<()> {
    let mut shell = Shell {
        nick: options.nick(),
        options,
        session: None,
        events: None,
        palette: NickPalette::new(),
        view: TransferView::new(),
    };

    println!(
        "\n{} wormhole shell, you are {}. Type {} for commands.",
        style("⚡").cyan(),
        style(&shell.nick).bold(),
        style("/help").green()
    );

    if let Some(room) = shell.options.room.clone() {
        let tickets = shell.options.peers.clone();
        shell.enter(room, tickets, false).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let input = tokio::select! {
            line = lines.next_line() => Input::Line(line?),
            Some(event) = next_event(&mut shell.events) => Input::Event(event),
            _ = tokio::signal::ctrl_c() => Input::Interrupt,
        };

        match input {
            Input::Line(None) | Input::Interrupt => break,
            Input::Line(Some(line)) => match ShellCommand::parse(&line) {
                Ok(ShellCommand::Quit) => break,
                Ok(command) => shell.execute(command).await,
                Err(e) => shell.warn(e),
            },
            Input::Event(event) => shell.show(event),
        }
    }

    shell.leave().await;
    println!("{}", style("bye").dim());
    Ok(())
}

async fn next_event(events: &mut Option<mpsc::Receiver<RoomEvent>>) -> Option<RoomEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Shell {
    async fn execute(&mut self, command: ShellCommand) {
        match command {
            ShellCommand::Empty | ShellCommand::Quit => {}
            ShellCommand::Help => {
                for (usage, what) in HELP {
                    self.view
                        .println(format!("  {:<26} {}", style(usage).green(), what));
                }
            }
            ShellCommand::Host(room) => self.enter(room, Vec::new(), true).await,
            ShellCommand::Join { room, tickets } => self.enter(room, tickets, false).await,
            ShellCommand::Nick(nick) => {
                self.nick = nick;
                if let Some(session) = &self.session {
                    session.room.set_nick(self.nick.clone());
                }
                self.info(format!("you are now {}", style(&self.nick).bold()));
            }
            other => {
                if self.session.is_none() {
                    self.warn("not in a room, use /host or /join first");
                    return;
                }
                if let Err(e) = self.in_room(other).await {
                    self.warn(e.to_string());
                }
            }
        }
    }

    async fn in_room(&mut self, command: ShellCommand) -> Result<()> {
        let Some(session) = &self.session else {
            return Ok(());
        };
        match command {
            ShellCommand::Dial(ticket) => {
                let connected = dial_all(&session.swarm, std::slice::from_ref(&ticket)).await?;
                self.info(format!("dialled, {connected} connections opened"));
            }
            ShellCommand::Chat(text) => {
                let message = session.room.broadcast_chat(text).await?;
                self.show_chat(&message);
            }
            ShellCommand::Send(path) => {
                let picked_up = session.room.send_path(&path).await?;
                self.info(format!(
                    "offering {} to {} waiting peers and anyone who joins",
                    style(path.display()).cyan(),
                    picked_up
                ));
            }
            ShellCommand::Receive(dir) => {
                let picked_up = session.room.receive_into(&dir).await?;
                self.info(format!(
                    "accepting transfers into {} ({} peers waiting)",
                    style(dir.display()).cyan(),
                    picked_up
                ));
            }
            ShellCommand::Stop => {
                if session.room.stop_transfers() {
                    self.info("stopped, running transfers will finish");
                } else {
                    self.info("no transfer command active");
                }
            }
            ShellCommand::Ticket => {
                let ticket = session.swarm.ticket();
                self.view.println(format!("  {}", style(ticket).green()));
            }
            _ => {}
        }
        Ok(())
    }

    async fn enter(&mut self, room: String, tickets: Vec<String>, show_ticket: bool) {
        self.leave().await;
        let opened = open_room(&room, &self.nick, self.options.config()).await;
        let (swarm, joined, events) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                self.warn(format!("could not open room: {e}"));
                return;
            }
        };

        self.palette.clear();
        self.info(format!("joined room {}", style(&room).bold()));
        if show_ticket {
            self.view.println(format!(
                "{} Share this ticket with your peers:\n\n  {}\n",
                style("⚡").cyan(),
                style(swarm.ticket()).green()
            ));
        }
        if !tickets.is_empty() {
            match dial_all(&swarm, &tickets).await {
                Ok(connected) => self.info(format!("dialled, {connected} connections opened")),
                Err(e) => self.warn(format!("dial failed: {e}")),
            }
        }

        self.session = Some(Session {
            swarm,
            room: joined,
        });
        self.events = Some(events);
    }

    async fn leave(&mut self) {
        self.events = None;
        if let Some(session) = self.session.take() {
            let name = session.room.name().to_string();
            session.room.leave();
            if let Err(e) = session.swarm.shutdown().await {
                tracing::debug!(error = %e, "endpoint shutdown failed");
            }
            self.info(format!("left room {name}"));
        }
    }

    fn show(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::Chat { message, .. } => self.show_chat(&message),
            RoomEvent::PeerJoined { conn, peer, channel } => {
                if channel == Channel::Chat {
                    self.info(format!("peer {peer} joined ({conn})"));
                }
            }
            RoomEvent::PeerLeft {
                conn,
                channel,
                error,
            } => match (channel, error) {
                (Channel::Chat, None) => self.info(format!("peer {conn} left")),
                (Channel::Chat, Some(e)) => self.info(format!("peer {conn} dropped: {e}")),
                (Channel::Files, _) => {}
            },
            RoomEvent::Transfer { conn, progress } => self.view.update(conn, &progress),
        }
    }

    fn show_chat(&mut self, message: &ChatMessage) {
        let nick = self.palette.paint(&message.nick);
        self.view.println(format!("<{}> {}", nick, message.text));
    }

    fn info(&self, line: impl AsRef<str>) {
        self.view.println(style(line.as_ref()).dim().to_string());
    }

    fn warn(&self, line: impl AsRef<str>) {
        self.view
            .println(format!("{} {}", style("⚠").yellow(), line.as_ref()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_text_is_chat() {
        assert_eq!(
            ShellCommand::parse("  hello there "),
            Ok(ShellCommand::Chat("hello there".into()))
        );
        assert_eq!(ShellCommand::parse("   "), Ok(ShellCommand::Empty));
    }

    #[test]
    fn test_commands_with_arguments() {
        assert_eq!(
            ShellCommand::parse("/host garden"),
            Ok(ShellCommand::Host("garden".into()))
        );
        assert_eq!(
            ShellCommand::parse("/join garden abc def"),
            Ok(ShellCommand::Join {
                room: "garden".into(),
                tickets: vec!["abc".into(), "def".into()],
            })
        );
        assert_eq!(
            ShellCommand::parse("/chat  /not a command"),
            Ok(ShellCommand::Chat("/not a command".into()))
        );
        assert_eq!(
            ShellCommand::parse("/send ./photos"),
            Ok(ShellCommand::Send(PathBuf::from("./photos")))
        );
        assert_eq!(ShellCommand::parse("/quit"), Ok(ShellCommand::Quit));
    }

    #[test]
    fn test_missing_argument_and_unknown_command() {
        assert!(ShellCommand::parse("/nick").is_err());
        assert!(ShellCommand::parse("/join").is_err());
        assert!(ShellCommand::parse("/frobnicate").is_err());
    }
}
