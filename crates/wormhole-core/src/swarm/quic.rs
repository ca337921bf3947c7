use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use iroh::endpoint::{Connection, Incoming, SendStream};
use iroh::{Endpoint, EndpointAddr, SecretKey};
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{PeerConnection, Swarm};
use crate::protocol::alpn_for;
use crate::ticket::PeerTicket;
use crate::{Error, Result, Topic};

/// Written by the dialling side so the acceptor sees the lazily opened stream.
pub const PREAMBLE: &[u8; 4] = b"WHv1";

/// Upper bound on how long a dropped stream waits for the peer to acknowledge its data.
const LINGER: Duration = Duration::from_secs(10);

type Routes = Arc<Mutex<HashMap<Vec<u8>, mpsc::Sender<PeerConnection>>>>;
type Lingering = Arc<Mutex<Vec<JoinHandle<()>>>>;

/// Outbound half of a QUIC stream.
///
/// Dropping it finishes the stream and keeps the connection open until the peer has
/// acknowledged everything written, so closing the endpoint right after a transfer does not
/// cut off its tail.
struct QuicWriter {
    stream: Option<SendStream>,
    conn: Option<Connection>,
    lingering: Lingering,
}

impl QuicWriter {
    fn new(stream: SendStream, conn: Connection, lingering: Lingering) -> Self {
        Self {
            stream: Some(stream),
            conn: Some(conn),
            lingering,
        }
    }

    fn stream(&mut self) -> io::Result<Pin<&mut SendStream>> {
        match self.stream.as_mut() {
            Some(stream) => Ok(Pin::new(stream)),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

impl AsyncWrite for QuicWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stream() {
            Ok(stream) => AsyncWrite::poll_write(stream, cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream() {
            Ok(stream) => stream.poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream() {
            Ok(stream) => stream.poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl Drop for QuicWriter {
    fn drop(&mut self) {
        let (Some(mut stream), Some(conn)) = (self.stream.take(), self.conn.take()) else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let task = handle.spawn(async move {
            // Already finished by a shutdown on the normal path.
            let _ = stream.finish();
            match tokio::time::timeout(LINGER, stream.stopped()).await {
                Ok(_) => debug!("stream acknowledged"),
                Err(_) => debug!("peer did not acknowledge stream in time"),
            }
            drop(conn);
        });
        let mut lingering = self.lingering.lock();
        lingering.retain(|t| !t.is_finished());
        lingering.push(task);
    }
}

/// iroh-backed substrate: one endpoint, one identity, one ALPN per joined topic.
#[derive(Clone)]
pub struct IrohSwarm {
    endpoint: Endpoint,
    routes: Routes,
    lingering: Lingering,
}

impl IrohSwarm {
    /// Bind a fresh endpoint accepting the given topics
    pub async fn bind(topics: &[Topic]) -> Result<Self> {
        Self::with_secret_key(SecretKey::generate(&mut rand::rng()), topics).await
    }

    /// Bind an endpoint with a specific secret key
    pub async fn with_secret_key(secret_key: SecretKey, topics: &[Topic]) -> Result<Self> {
        let alpns = topics.iter().map(alpn_for).collect();
        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(alpns)
            .bind()
            .await?;

        // Wait for the endpoint to be online (connected to relay)
        endpoint.online().await;

        info!(endpoint_id = %endpoint.id(), "wormhole endpoint started");

        let routes: Routes = Arc::default();
        let lingering: Lingering = Arc::default();
        tokio::spawn(accept_loop(
            endpoint.clone(),
            routes.clone(),
            lingering.clone(),
        ));

        Ok(Self {
            endpoint,
            routes,
            lingering,
        })
    }

    /// This endpoint's address, including direct socket addresses when available.
    pub fn addr(&self) -> EndpointAddr {
        let mut addr = self.endpoint.addr();
        for socket_addr in self.endpoint.bound_sockets() {
            addr = addr.with_ip_addr(socket_addr);
        }
        addr
    }

    pub fn id(&self) -> iroh::PublicKey {
        self.endpoint.id()
    }

    /// Ticket other peers use to dial this endpoint
    pub fn ticket(&self) -> PeerTicket {
        PeerTicket::new(self.addr())
    }

    /// Connect to a peer on every joined topic. Returns the number of connections made.
    pub async fn dial(&self, ticket: &PeerTicket) -> Result<usize> {
        let routes: Vec<(Vec<u8>, mpsc::Sender<PeerConnection>)> = self
            .routes
            .lock()
            .iter()
            .map(|(alpn, tx)| (alpn.clone(), tx.clone()))
            .collect();

        let label = short_id(&ticket.addr.id.to_string());
        let mut connected = 0;
        for (alpn, tx) in routes {
            debug!(peer = %label, "dialling");
            let conn = self.endpoint.connect(ticket.addr.clone(), alpn.as_slice()).await?;
            let (mut send, recv) = conn.open_bi().await?;
            send.write_all(PREAMBLE).await?;

            let writer = QuicWriter::new(send, conn, self.lingering.clone());
            let peer = PeerConnection::new(label.clone(), recv, writer);
            tx.send(peer)
                .await
                .map_err(|_| Error::ConnectionFailed("topic no longer joined".into()))?;
            connected += 1;
        }

        Ok(connected)
    }

    /// Shutdown the endpoint gracefully, after dropped streams had their chance to drain.
    pub async fn shutdown(self) -> Result<()> {
        let pending: Vec<JoinHandle<()>> = self.lingering.lock().drain(..).collect();
        if !pending.is_empty() {
            debug!(streams = pending.len(), "waiting for streams to drain");
            futures::future::join_all(pending).await;
        }
        self.endpoint.close().await;
        Ok(())
    }
}

impl Swarm for IrohSwarm {
    async fn join(&self, topic: Topic) -> Result<mpsc::Receiver<PeerConnection>> {
        let (tx, rx) = mpsc::channel(32);
        self.routes.lock().insert(alpn_for(&topic), tx);
        debug!(%topic, "joined topic");
        Ok(rx)
    }
}

async fn accept_loop(endpoint: Endpoint, routes: Routes, lingering: Lingering) {
    while let Some(incoming) = endpoint.accept().await {
        let routes = routes.clone();
        let lingering = lingering.clone();
        tokio::spawn(async move {
            if let Err(e) = accept_one(incoming, routes, lingering).await {
                debug!(error = %e, "dropping incoming connection");
            }
        });
    }
    debug!("endpoint closed, accept loop finished");
}

async fn accept_one(incoming: Incoming, routes: Routes, lingering: Lingering) -> Result<()> {
    let conn = incoming.accept()?.await?;

    let alpn = conn.alpn().to_vec();
    let Some(tx) = routes.lock().get(&alpn).cloned() else {
        return Err(Error::Protocol("connection for a topic we did not join".into()));
    };

    // Streams are lazy: the dialler's preamble is what makes this resolve.
    let (send, mut recv) = conn.accept_bi().await?;
    let mut preamble = [0u8; 4];
    recv.read_exact(&mut preamble).await?;
    if &preamble != PREAMBLE {
        return Err(Error::Protocol("bad connection preamble".into()));
    }

    let peer = PeerConnection::new("incoming", recv, QuicWriter::new(send, conn, lingering));
    info!(conn = %peer.id(), "peer connected");
    tx.send(peer)
        .await
        .map_err(|_| Error::ConnectionFailed("topic no longer joined".into()))
}

fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}
