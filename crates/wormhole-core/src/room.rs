//! A room: one chat pool and one file pool derived from the same secret.
//!
//! Chat connections are handed to the [`ChatDispatcher`]. File connections sit parked until a
//! send or receive command is active; the command then fans out to every parked connection and
//! to every one that arrives while it stays active, each driven by its own session.
//!
//! Changing or stopping the command withdraws sessions that are still negotiating and offers
//! their connections again. Sessions already streaming run to the end.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::fs;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chat::ChatDispatcher;
use crate::classifier::{ConnectionClassifier, TransferLease};
use crate::config::TransferConfig;
use crate::protocol::ChatMessage;
use crate::swarm::{ConnectionId, PeerConnection, Swarm};
use crate::transfer::{ReceiveProgress, ReceiveSession, SendProgress, SendSession};
use crate::{Error, Result, Topic};

const EVENT_BUFFER: usize = 256;
const PROGRESS_BUFFER: usize = 64;

/// Which pool a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Chat,
    Files,
}

#[derive(Debug, Clone)]
pub enum TransferProgress {
    Send(SendProgress),
    Receive(ReceiveProgress),
}

impl TransferProgress {
    pub fn is_terminal(&self) -> bool {
        match self {
            TransferProgress::Send(p) => p.is_terminal(),
            TransferProgress::Receive(p) => p.is_terminal(),
        }
    }
}

/// Everything a room reports to its owner.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    PeerJoined {
        conn: ConnectionId,
        peer: String,
        channel: Channel,
    },
    PeerLeft {
        conn: ConnectionId,
        channel: Channel,
        error: Option<String>,
    },
    Chat {
        conn: ConnectionId,
        message: ChatMessage,
    },
    Transfer {
        conn: ConnectionId,
        progress: TransferProgress,
    },
}

#[derive(Debug, Clone)]
enum Command {
    Send(PathBuf),
    Receive(PathBuf),
}

/// Per-session context for one joined room. Leaving or dropping it stops every task it owns.
pub struct Room {
    inner: Arc<RoomInner>,
}

struct RoomInner {
    name: String,
    chat_topic: Topic,
    files_topic: Topic,
    nick: Mutex<String>,
    config: TransferConfig,
    classifier: ConnectionClassifier,
    chat: ChatDispatcher,
    events: mpsc::Sender<RoomEvent>,
    // Lock order: `command` before `parked`.
    command: Mutex<Option<Command>>,
    /// Bumped whenever `command` changes.
    generation: watch::Sender<u64>,
    parked: Mutex<HashMap<ConnectionId, PeerConnection>>,
    dest_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Room {
    /// Join both topics of `secret` on `swarm`.
    pub async fn join<S: Swarm>(
        swarm: &S,
        secret: &str,
        nick: impl Into<String>,
        config: TransferConfig,
    ) -> Result<(Room, mpsc::Receiver<RoomEvent>)> {
        let chat_topic = Topic::chat(secret);
        let files_topic = Topic::files(secret);
        let chat_incoming = swarm.join(chat_topic).await?;
        let files_incoming = swarm.join(files_topic).await?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let classifier = ConnectionClassifier::new();
        let inner = Arc::new(RoomInner {
            name: secret.to_string(),
            chat_topic,
            files_topic,
            nick: Mutex::new(nick.into()),
            config,
            chat: ChatDispatcher::new(classifier.clone()),
            classifier,
            events: events_tx,
            command: Mutex::new(None),
            generation: watch::Sender::new(0),
            parked: Mutex::new(HashMap::new()),
            dest_locks: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let chat_task = tokio::spawn(Arc::clone(&inner).accept_chat(chat_incoming));
        let files_task = tokio::spawn(Arc::clone(&inner).accept_files(files_incoming));
        inner.track(chat_task);
        inner.track(files_task);

        info!(room = %secret, chat = %chat_topic, files = %files_topic, "joined room");
        Ok((Room { inner }, events_rx))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn chat_topic(&self) -> Topic {
        self.inner.chat_topic
    }

    pub fn files_topic(&self) -> Topic {
        self.inner.files_topic
    }

    pub fn config(&self) -> &TransferConfig {
        &self.inner.config
    }

    pub fn nick(&self) -> String {
        self.inner.nick.lock().clone()
    }

    pub fn set_nick(&self, nick: impl Into<String>) {
        *self.inner.nick.lock() = nick.into();
    }

    /// Send `path` to every file peer, now and later, until [`Room::stop_transfers`].
    ///
    /// Returns how many already-connected peers were picked up.
    pub async fn send_path(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        match fs::metadata(path).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::SourceNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        }
        info!(source = %path.display(), "send command active");
        Ok(self.inner.activate(Command::Send(path.to_path_buf())))
    }

    /// Receive from every file peer into `dir`, creating it if needed.
    pub async fn receive_into(&self, dir: impl AsRef<Path>) -> Result<usize> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await?;
        let dir = fs::canonicalize(dir).await?;
        info!(dest = %dir.display(), "receive command active");
        Ok(self.inner.activate(Command::Receive(dir)))
    }

    /// Stop fanning the current command out. Sessions still negotiating are withdrawn and
    /// their connections parked; streaming sessions continue.
    pub fn stop_transfers(&self) -> bool {
        let mut command = self.inner.command.lock();
        let stopped = command.take().is_some();
        if stopped {
            self.inner.generation.send_modify(|g| *g += 1);
            info!("transfer command stopped");
        }
        stopped
    }

    pub fn has_active_command(&self) -> bool {
        self.inner.command.lock().is_some()
    }

    /// Broadcast a chat line and return it for local echo.
    pub async fn broadcast_chat(&self, text: impl Into<String>) -> Result<ChatMessage> {
        let message = ChatMessage::new(self.nick(), text);
        let delivered = self.inner.chat.broadcast(&message).await?;
        debug!(delivered, "chat broadcast");
        Ok(message)
    }

    /// Connected chat peers.
    pub fn peer_count(&self) -> usize {
        self.inner.chat.peer_count()
    }

    /// File connections waiting for a command.
    pub fn parked_count(&self) -> usize {
        self.inner.parked.lock().len()
    }

    /// Connections currently in transfer mode.
    pub fn active_transfers(&self) -> usize {
        self.inner.classifier.transfer_count()
    }

    #[cfg(test)]
    pub(crate) fn dest_lock_count(&self) -> usize {
        self.inner.dest_locks.lock().len()
    }

    pub fn leave(self) {
        info!(room = %self.inner.name, "leaving room");
        self.inner.shutdown();
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl RoomInner {
    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    async fn accept_chat(self: Arc<Self>, mut incoming: mpsc::Receiver<PeerConnection>) {
        while let Some(conn) = incoming.recv().await {
            let (id, peer) = (conn.id(), conn.peer().to_string());
            info!(conn = %id, %peer, "chat peer connected");
            self.chat.attach(conn, self.events.clone());
            let _ = self
                .events
                .send(RoomEvent::PeerJoined {
                    conn: id,
                    peer,
                    channel: Channel::Chat,
                })
                .await;
        }
        debug!("chat pool closed");
    }

    async fn accept_files(self: Arc<Self>, mut incoming: mpsc::Receiver<PeerConnection>) {
        while let Some(conn) = incoming.recv().await {
            let (id, peer) = (conn.id(), conn.peer().to_string());
            info!(conn = %id, %peer, "file peer connected");
            self.offer(conn);
            let _ = self
                .events
                .send(RoomEvent::PeerJoined {
                    conn: id,
                    peer,
                    channel: Channel::Files,
                })
                .await;
        }
        debug!("file pool closed");
    }

    /// Start a session for `conn` if a command is active, otherwise park it.
    fn offer(self: &Arc<Self>, conn: PeerConnection) {
        let command = self.command.lock();
        match command.as_ref() {
            Some(command) => self.start_session(conn, command.clone()),
            None => {
                debug!(conn = %conn.id(), "parking file connection");
                self.parked.lock().insert(conn.id(), conn);
            }
        }
    }

    fn activate(self: &Arc<Self>, command: Command) -> usize {
        let mut current = self.command.lock();
        *current = Some(command.clone());
        self.generation.send_modify(|g| *g += 1);
        let waiting: Vec<PeerConnection> = self.parked.lock().drain().map(|(_, c)| c).collect();
        let picked_up = waiting.len();
        for conn in waiting {
            self.start_session(conn, command.clone());
        }
        picked_up
    }

    fn start_session(self: &Arc<Self>, conn: PeerConnection, command: Command) {
        let Some(lease) = self.classifier.claim(conn.id()) else {
            warn!(conn = %conn.id(), "connection already carries a transfer");
            return;
        };
        // Subscribed under the command lock, so only a later change withdraws it.
        let withdraw = self.generation.subscribe();
        let task = tokio::spawn(Arc::clone(self).drive_session(conn, command, lease, withdraw));
        self.track(task);
    }

    async fn drive_session(
        self: Arc<Self>,
        mut conn: PeerConnection,
        command: Command,
        lease: TransferLease,
        withdraw: watch::Receiver<u64>,
    ) {
        let id = conn.id();
        let result = match command {
            Command::Send(source) => {
                let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
                let forward = self.forward(id, rx, TransferProgress::Send);
                let result = SendSession::new(source, self.config.clone())
                    .withdraw_on(withdraw)
                    .run(&mut conn, tx)
                    .await
                    .map(|_| ());
                let _ = forward.await;
                result
            }
            Command::Receive(dest) => {
                let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
                let forward = self.forward(id, rx, TransferProgress::Receive);
                let result = ReceiveSession::new(dest.clone(), self.config.clone())
                    .withdraw_on(withdraw)
                    .exclusive(self.dest_lock(&dest))
                    .run(&mut conn, tx)
                    .await
                    .map(|_| ());
                let _ = forward.await;
                self.release_dest_lock(&dest);
                result
            }
        };
        drop(lease);

        match result {
            Err(Error::HandshakeTimeout) | Err(Error::Cancelled) => {
                debug!(conn = %id, "no transfer agreed, offering connection again");
                self.offer(conn);
            }
            other => {
                drop(conn);
                let _ = self
                    .events
                    .send(RoomEvent::PeerLeft {
                        conn: id,
                        channel: Channel::Files,
                        error: other.err().map(|e| e.to_string()),
                    })
                    .await;
            }
        }
    }

    fn forward<P: Send + 'static>(
        &self,
        conn: ConnectionId,
        mut progress: mpsc::Receiver<P>,
        wrap: fn(P) -> TransferProgress,
    ) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(p) = progress.recv().await {
                if events
                    .send(RoomEvent::Transfer {
                        conn,
                        progress: wrap(p),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        })
    }

    fn dest_lock(&self, dest: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.dest_locks
            .lock()
            .entry(dest.to_path_buf())
            .or_default()
            .clone()
    }

    /// Forget the lock for `dest` once no session holds a handle to it.
    fn release_dest_lock(&self, dest: &Path) {
        let mut locks = self.dest_locks.lock();
        if locks
            .get(dest)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(dest);
        }
    }

    fn shutdown(&self) {
        self.command.lock().take();
        self.parked.lock().clear();
        self.chat.shutdown();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
