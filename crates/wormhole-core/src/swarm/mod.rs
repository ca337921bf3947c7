//! The discovery substrate seen from the core: a topic goes in, live connections come out.

pub mod memory;
pub mod quic;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::{Result, Topic};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Process-unique identity of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An ordered, bidirectional byte stream to one peer.
///
/// A read returning 0 bytes means the peer closed its side; read or write errors mean the
/// connection failed.
pub struct PeerConnection {
    id: ConnectionId,
    peer: String,
    reader: BoxedReader,
    writer: BoxedWriter,
}

impl PeerConnection {
    pub fn new<R, W>(peer: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id: ConnectionId::next(),
            peer: peer.into(),
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Wrap a single duplex stream.
    pub fn from_io<T>(peer: impl Into<String>, io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self::new(peer, reader, writer)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Human-readable label of the remote side.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Borrow both directions at once.
    pub fn split_mut(&mut self) -> (&mut BoxedReader, &mut BoxedWriter) {
        (&mut self.reader, &mut self.writer)
    }

    pub fn into_parts(self) -> (BoxedReader, BoxedWriter) {
        (self.reader, self.writer)
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// A discovery substrate.
pub trait Swarm: Send + Sync {
    /// Join `topic` and receive every connection to a peer interested in it, current and
    /// future. The channel closes when the substrate shuts down.
    fn join(&self, topic: Topic) -> impl Future<Output = Result<mpsc::Receiver<PeerConnection>>> + Send;
}
