//! In-process substrate: every node on a topic is piped to every other node on it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{PeerConnection, Swarm};
use crate::{Error, Result, Topic};

/// Buffer size of each in-memory pipe direction.
const PIPE_CAPACITY: usize = 64 * 1024;

struct Member {
    node: u64,
    tx: mpsc::Sender<PeerConnection>,
}

/// Shared meeting point for [`MemorySwarm`] nodes.
#[derive(Clone, Default)]
pub struct MemoryHub {
    topics: Arc<Mutex<HashMap<Topic, Vec<Member>>>>,
    next_node: Arc<AtomicU64>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new node attached to this hub.
    pub fn node(&self) -> MemorySwarm {
        MemorySwarm {
            hub: self.clone(),
            node: self.next_node.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// One participant of a [`MemoryHub`].
#[derive(Clone)]
pub struct MemorySwarm {
    hub: MemoryHub,
    node: u64,
}

impl Swarm for MemorySwarm {
    async fn join(&self, topic: Topic) -> Result<mpsc::Receiver<PeerConnection>> {
        let (tx, rx) = mpsc::channel(64);

        let peers: Vec<(u64, mpsc::Sender<PeerConnection>)> = {
            let mut topics = self.hub.topics.lock();
            let members = topics.entry(topic).or_default();
            members.retain(|m| !m.tx.is_closed());
            let existing = members
                .iter()
                .filter(|m| m.node != self.node)
                .map(|m| (m.node, m.tx.clone()))
                .collect();
            members.push(Member {
                node: self.node,
                tx: tx.clone(),
            });
            existing
        };

        debug!(node = self.node, %topic, peers = peers.len(), "joined memory topic");

        for (peer, peer_tx) in peers {
            let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
            tx.send(PeerConnection::from_io(format!("mem-{peer}"), local))
                .await
                .map_err(|_| Error::ConnectionFailed("local pool closed".into()))?;
            if peer_tx
                .send(PeerConnection::from_io(format!("mem-{}", self.node), remote))
                .await
                .is_err()
            {
                debug!(peer, "memory peer left before connection was delivered");
            }
        }

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{read_frame, write_frame};

    #[tokio::test]
    async fn test_nodes_on_same_topic_get_connected() {
        let hub = MemoryHub::new();
        let a = hub.node();
        let b = hub.node();
        let topic = Topic::chat("memory");

        let mut a_rx = a.join(topic).await.unwrap();
        let mut b_rx = b.join(topic).await.unwrap();

        let mut a_conn = a_rx.recv().await.unwrap();
        let mut b_conn = b_rx.recv().await.unwrap();
        assert_eq!(a_conn.peer(), format!("mem-{}", b.node));

        let (_, writer) = a_conn.split_mut();
        write_frame(writer, b"ping").await.unwrap();
        let (reader, _) = b_conn.split_mut();
        assert_eq!(read_frame(reader).await.unwrap().unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_different_topics_stay_apart() {
        let hub = MemoryHub::new();
        let a = hub.node();
        let b = hub.node();

        let mut a_rx = a.join(Topic::chat("one")).await.unwrap();
        let _b_rx = b.join(Topic::chat("two")).await.unwrap();

        assert!(a_rx.try_recv().is_err());
    }
}
