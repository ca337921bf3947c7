use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::classifier::ConnectionClassifier;
use crate::protocol::{ChatMessage, MAX_FRAME_SIZE, Message, read_frame, write_frame};
use crate::room::{Channel, RoomEvent};
use crate::swarm::{ConnectionId, PeerConnection};
use crate::{Error, Result};

/// Frames queued per peer before broadcast waits on a slow connection.
const OUTBOUND_QUEUE: usize = 64;

/// Routes chat frames between the local user and every chat-eligible connection.
///
/// Best effort: frames that are not well-formed CHAT messages are dropped without comment.
#[derive(Clone)]
pub struct ChatDispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    classifier: ConnectionClassifier,
    peers: Mutex<HashMap<ConnectionId, mpsc::Sender<Vec<u8>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatDispatcher {
    pub fn new(classifier: ConnectionClassifier) -> Self {
        Self {
            inner: Arc::new(Inner {
                classifier,
                peers: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Interpret one inbound frame from `conn`.
    pub fn dispatch(&self, conn: ConnectionId, frame: &[u8]) -> Option<ChatMessage> {
        if self.inner.classifier.is_transfer(conn) {
            debug!(%conn, "not parsing chat on a transfer connection");
            return None;
        }
        match Message::from_json(frame) {
            Ok(Message::Chat(message)) => Some(message),
            Ok(_) => None,
            Err(_) => None,
        }
    }

    /// Start reading chat from `conn` and make it a broadcast target.
    pub fn attach(&self, conn: PeerConnection, events: mpsc::Sender<RoomEvent>) {
        let id = conn.id();
        let (mut reader, mut writer) = conn.into_parts();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
        self.inner.peers.lock().insert(id, tx);

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    debug!(conn = %id, error = %e, "chat write failed");
                    break;
                }
            }
        });

        let dispatcher = self.clone();
        let reader_task = tokio::spawn(async move {
            let error = loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) => {
                        let Some(message) = dispatcher.dispatch(id, &frame) else {
                            continue;
                        };
                        if events
                            .send(RoomEvent::Chat { conn: id, message })
                            .await
                            .is_err()
                        {
                            break None;
                        }
                    }
                    Ok(None) => break None,
                    Err(e) => break Some(e.to_string()),
                }
            };

            dispatcher.inner.peers.lock().remove(&id);
            debug!(conn = %id, ?error, "chat connection ended");
            let _ = events
                .send(RoomEvent::PeerLeft {
                    conn: id,
                    channel: Channel::Chat,
                    error,
                })
                .await;
        });

        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(writer_task);
        tasks.push(reader_task);
    }

    /// Write `message` to every connected peer not in transfer mode.
    ///
    /// Returns the number of peers it was queued for.
    pub async fn broadcast(&self, message: &ChatMessage) -> Result<usize> {
        let frame = Message::Chat(message.clone()).to_json()?;
        if frame.len() > MAX_FRAME_SIZE {
            return Err(Error::Protocol("chat message too large".into()));
        }

        let targets: Vec<(ConnectionId, mpsc::Sender<Vec<u8>>)> = self
            .inner
            .peers
            .lock()
            .iter()
            .filter(|(id, _)| !self.inner.classifier.is_transfer(**id))
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut delivered = 0;
        for (id, tx) in targets {
            if tx.send(frame.clone()).await.is_ok() {
                delivered += 1;
            } else {
                debug!(conn = %id, "chat peer gone before broadcast");
            }
        }
        Ok(delivered)
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.lock().len()
    }

    /// Stop every chat task and forget all peers.
    pub fn shutdown(&self) {
        self.inner.peers.lock().clear();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_frame(nick: &str, text: &str) -> Vec<u8> {
        Message::Chat(ChatMessage::new(nick, text)).to_json().unwrap()
    }

    #[test]
    fn test_dispatch_parses_chat() {
        let dispatcher = ChatDispatcher::new(ConnectionClassifier::new());
        let msg = dispatcher
            .dispatch(ConnectionId::next(), &chat_frame("ana", "hello"))
            .unwrap();
        assert_eq!(msg.nick, "ana");
        assert_eq!(msg.text, "hello");
    }

    #[test]
    fn test_dispatch_drops_noise_and_handshakes() {
        let dispatcher = ChatDispatcher::new(ConnectionClassifier::new());
        let id = ConnectionId::next();
        assert!(dispatcher.dispatch(id, b"\x00\x01binary").is_none());
        assert!(dispatcher.dispatch(id, br#"{"type":"CHAT"}"#).is_none());
        let handshake = Message::Handshake { received_bytes: 9 }.to_json().unwrap();
        assert!(dispatcher.dispatch(id, &handshake).is_none());
    }

    #[test]
    fn test_dispatch_skips_transfer_connections() {
        let classifier = ConnectionClassifier::new();
        let dispatcher = ChatDispatcher::new(classifier.clone());
        let id = ConnectionId::next();

        let lease = classifier.claim(id).unwrap();
        assert!(dispatcher.dispatch(id, &chat_frame("ana", "hi")).is_none());
        drop(lease);
        assert!(dispatcher.dispatch(id, &chat_frame("ana", "hi")).is_some());
    }

    #[tokio::test]
    async fn test_broadcast_skips_transfer_connections() {
        let classifier = ConnectionClassifier::new();
        let dispatcher = ChatDispatcher::new(classifier.clone());
        let (events_tx, _events_rx) = mpsc::channel(16);

        let (near_a, mut far_a) = tokio::io::duplex(4096);
        let (near_b, mut far_b) = tokio::io::duplex(4096);
        let conn_a = PeerConnection::from_io("a", near_a);
        let conn_b = PeerConnection::from_io("b", near_b);
        let b_id = conn_b.id();
        dispatcher.attach(conn_a, events_tx.clone());
        dispatcher.attach(conn_b, events_tx);

        let _lease = classifier.claim(b_id).unwrap();
        let sent = dispatcher
            .broadcast(&ChatMessage::new("me", "only a"))
            .await
            .unwrap();
        assert_eq!(sent, 1);

        let frame = read_frame(&mut far_a).await.unwrap().unwrap();
        assert!(matches!(Message::from_json(&frame).unwrap(), Message::Chat(m) if m.text == "only a"));

        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(50), read_frame(&mut far_b)).await;
        assert!(nothing.is_err(), "transfer connection must not receive chat");

        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn test_closed_peer_is_reported_and_removed() {
        let dispatcher = ChatDispatcher::new(ConnectionClassifier::new());
        let (events_tx, mut events_rx) = mpsc::channel(16);

        let (near, far) = tokio::io::duplex(4096);
        let conn = PeerConnection::from_io("gone", near);
        let id = conn.id();
        dispatcher.attach(conn, events_tx);
        assert_eq!(dispatcher.peer_count(), 1);

        drop(far);
        match events_rx.recv().await.unwrap() {
            RoomEvent::PeerLeft { conn, channel, error } => {
                assert_eq!(conn, id);
                assert_eq!(channel, Channel::Chat);
                assert!(error.is_none());
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(dispatcher.peer_count(), 0);
    }
}
