//! Single-shot sender and receiver sessions for one connection.
//!
//! Each session walks `Idle -> AwaitingHandshake -> Streaming -> Finished | Errored` (the
//! receiver adds `Extracting`) and reports through a progress channel. A session is consumed
//! by `run`, so a second file always needs a new session and a fresh handshake.
//!
//! While still negotiating, a session can be withdrawn through a `watch` channel; it then
//! ends with [`Error::Cancelled`] before any archive byte was written or stored.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use crate::archive::{ArchivePacker, ArchiveUnpacker};
use crate::config::TransferConfig;
use crate::handshake::{await_accept, await_handshake, send_accept, send_handshake, send_offer};
use crate::partial::PartialFile;
use crate::skip::ByteOffsetSkipper;
use crate::swarm::PeerConnection;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    AwaitingHandshake,
    Streaming,
    Extracting,
    Finished,
    Errored,
}

/// Progress updates for sending
#[derive(Debug, Clone)]
pub enum SendProgress {
    /// Waiting for the receiver to say where to resume
    AwaitingHandshake,

    /// Handshake parsed; this many archive bytes will be skipped
    Resuming { offset: u64 },

    /// A batch of bytes was written to the connection
    Sending { bytes: u64, bytes_sent: u64 },

    /// Archive fully streamed and outbound side closed
    Finished { bytes_sent: u64 },

    /// The peer went away mid-session
    Closed,

    /// Withdrawn before the receiver answered
    Cancelled,

    /// Error occurred
    Error(String),
}

/// Progress updates for receiving
#[derive(Debug, Clone)]
pub enum ReceiveProgress {
    /// Handshake written with the current partial size
    HandshakeSent { received_bytes: u64 },

    /// A chunk was appended to the partial file
    Receiving { bytes: u64, total_received: u64 },

    /// Stream ended, unpacking the partial file
    Extracting,

    /// Extraction done and partial file removed
    Finished { dest: PathBuf, entries: u64 },

    /// Withdrawn before a sender accepted; the partial file is untouched
    Cancelled,

    /// Error occurred; the partial file is kept for the next session
    Error(String),
}

impl SendProgress {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SendProgress::Finished { .. }
                | SendProgress::Closed
                | SendProgress::Cancelled
                | SendProgress::Error(_)
        )
    }
}

impl ReceiveProgress {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReceiveProgress::Finished { .. }
                | ReceiveProgress::Cancelled
                | ReceiveProgress::Error(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    /// Resume offset the receiver asked for
    pub offset: u64,
    /// Bytes actually written to the connection
    pub bytes_sent: u64,
    /// Full archive length
    pub archive_len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveReport {
    /// Partial size the stream was appended to
    pub resumed_from: u64,
    /// Bytes appended during this session
    pub bytes_received: u64,
    /// Entries written by extraction
    pub entries: u64,
}

/// Sender side of one transfer over one connection.
pub struct SendSession {
    source: PathBuf,
    config: TransferConfig,
    state: SessionState,
    withdraw: Option<watch::Receiver<u64>>,
}

impl SendSession {
    pub fn new(source: impl Into<PathBuf>, config: TransferConfig) -> Self {
        Self {
            source: source.into(),
            config,
            state: SessionState::Idle,
            withdraw: None,
        }
    }

    /// Give up negotiating as soon as `withdraw` sees a new value.
    pub fn withdraw_on(mut self, withdraw: watch::Receiver<u64>) -> Self {
        self.withdraw = Some(withdraw);
        self
    }

    fn transition(&mut self, conn: &PeerConnection, next: SessionState) {
        debug!(conn = %conn.id(), from = ?self.state, to = ?next, "send session");
        self.state = next;
    }

    /// Run the session to a terminal state. The terminal event is always emitted.
    pub async fn run(
        mut self,
        conn: &mut PeerConnection,
        progress: mpsc::Sender<SendProgress>,
    ) -> Result<SendReport> {
        match self.drive(conn, &progress).await {
            Ok(report) => {
                self.transition(conn, SessionState::Finished);
                info!(
                    conn = %conn.id(),
                    offset = report.offset,
                    bytes_sent = report.bytes_sent,
                    "send finished"
                );
                let _ = progress
                    .send(SendProgress::Finished {
                        bytes_sent: report.bytes_sent,
                    })
                    .await;
                Ok(report)
            }
            Err(e) => {
                self.transition(conn, SessionState::Errored);
                let event = if matches!(e, Error::Cancelled) {
                    SendProgress::Cancelled
                } else if e.is_disconnect() {
                    SendProgress::Closed
                } else {
                    SendProgress::Error(e.to_string())
                };
                warn!(conn = %conn.id(), error = %e, "send session ended");
                let _ = progress.send(event).await;
                Err(e)
            }
        }
    }

    async fn drive(
        &mut self,
        conn: &mut PeerConnection,
        progress: &mpsc::Sender<SendProgress>,
    ) -> Result<SendReport> {
        self.transition(conn, SessionState::AwaitingHandshake);
        let _ = progress.send(SendProgress::AwaitingHandshake).await;

        let id = conn.id();
        let timeout = self.config.handshake_timeout;
        let (reader, writer) = conn.split_mut();
        let offset = until_withdrawn(self.withdraw.as_mut(), async {
            send_offer(&mut *writer)
                .await
                .map_err(|e| Error::Handshake(e.to_string()))?;
            await_handshake(&mut *reader, timeout).await
        })
        .await?;
        send_accept(&mut *writer, offset).await?;
        info!(conn = %id, offset, source = %self.source.display(), "resuming send");
        let _ = progress.send(SendProgress::Resuming { offset }).await;

        debug!(conn = %id, from = ?self.state, to = ?SessionState::Streaming, "send session");
        self.state = SessionState::Streaming;

        let mut skipper = ByteOffsetSkipper::new(offset);
        let mut stream = ArchivePacker::new(&self.source, &self.config).spawn();
        let mut bytes_sent = 0u64;

        while let Some(chunk) = stream.next_chunk().await {
            let tail = skipper.skip(&chunk);
            if tail.is_empty() {
                continue;
            }
            writer.write_all(tail).await?;
            bytes_sent += tail.len() as u64;
            let _ = progress
                .send(SendProgress::Sending {
                    bytes: tail.len() as u64,
                    bytes_sent,
                })
                .await;
        }

        let archive_len = stream.finish().await?;
        if offset >= archive_len {
            debug!(conn = %id, offset, archive_len, "receiver already has the whole archive");
        }

        // Half-close: the receiver sees end-of-stream and starts extracting.
        writer.shutdown().await?;

        Ok(SendReport {
            offset,
            bytes_sent,
            archive_len,
        })
    }
}

/// Receiver side of one transfer over one connection.
pub struct ReceiveSession {
    dest: PathBuf,
    config: TransferConfig,
    state: SessionState,
    withdraw: Option<watch::Receiver<u64>>,
    dest_lock: Option<Arc<Mutex<()>>>,
}

impl ReceiveSession {
    pub fn new(dest: impl Into<PathBuf>, config: TransferConfig) -> Self {
        Self {
            dest: dest.into(),
            config,
            state: SessionState::Idle,
            withdraw: None,
            dest_lock: None,
        }
    }

    /// Give up negotiating as soon as `withdraw` sees a new value.
    pub fn withdraw_on(mut self, withdraw: watch::Receiver<u64>) -> Self {
        self.withdraw = Some(withdraw);
        self
    }

    /// Hold `lock` from the sender's ACCEPT until the partial file is settled.
    ///
    /// Sessions sharing a destination pass the same lock.
    pub fn exclusive(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.dest_lock = Some(lock);
        self
    }

    fn transition(&mut self, conn: &PeerConnection, next: SessionState) {
        debug!(conn = %conn.id(), from = ?self.state, to = ?next, "receive session");
        self.state = next;
    }

    /// Run the session to a terminal state. The terminal event is always emitted.
    pub async fn run(
        mut self,
        conn: &mut PeerConnection,
        progress: mpsc::Sender<ReceiveProgress>,
    ) -> Result<ReceiveReport> {
        match self.drive(conn, &progress).await {
            Ok(report) => {
                self.transition(conn, SessionState::Finished);
                info!(
                    conn = %conn.id(),
                    dest = %self.dest.display(),
                    entries = report.entries,
                    "receive finished"
                );
                let _ = progress
                    .send(ReceiveProgress::Finished {
                        dest: self.dest.clone(),
                        entries: report.entries,
                    })
                    .await;
                Ok(report)
            }
            Err(Error::Cancelled) => {
                self.transition(conn, SessionState::Errored);
                debug!(conn = %conn.id(), "receive session withdrawn before a sender accepted");
                let _ = progress.send(ReceiveProgress::Cancelled).await;
                Err(Error::Cancelled)
            }
            Err(e) => {
                self.transition(conn, SessionState::Errored);
                warn!(conn = %conn.id(), error = %e, "receive session ended, partial file kept");
                let _ = progress.send(ReceiveProgress::Error(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn drive(
        &mut self,
        conn: &mut PeerConnection,
        progress: &mpsc::Sender<ReceiveProgress>,
    ) -> Result<ReceiveReport> {
        fs::create_dir_all(&self.dest).await?;
        let partial = PartialFile::in_dir(&self.dest);
        let announced = partial.len().await?;

        self.transition(conn, SessionState::AwaitingHandshake);
        let id = conn.id();
        let timeout = self.config.handshake_timeout;
        let (reader, writer) = conn.split_mut();

        // The handshake goes out before anything inbound is read.
        send_handshake(&mut *writer, announced).await?;
        info!(conn = %id, received_bytes = announced, "sent handshake");
        let _ = progress
            .send(ReceiveProgress::HandshakeSent {
                received_bytes: announced,
            })
            .await;

        let offset = until_withdrawn(
            self.withdraw.as_mut(),
            await_accept(&mut *reader, &mut *writer, &partial, timeout),
        )
        .await?;

        let dest_lock = self.dest_lock.clone();
        let _exclusive = match &dest_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        // Another session may have grown or finished the partial file since the handshake.
        let resumed_from = partial.len().await?;
        if offset > resumed_from {
            return Err(Error::Handshake(format!(
                "sender resumes at {offset} but only {resumed_from} bytes are held"
            )));
        }
        if offset < resumed_from {
            debug!(conn = %id, offset, resumed_from, "dropping bytes already held");
        }

        debug!(conn = %id, from = ?self.state, to = ?SessionState::Streaming, "receive session");
        self.state = SessionState::Streaming;

        let mut skipper = ByteOffsetSkipper::new(resumed_from - offset);
        let mut file = partial.open_append().await?;
        let mut buf = vec![0u8; self.config.chunk_size.max(1)];
        let mut total_received = resumed_from;

        let streamed: Result<()> = loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(e.into()),
            };
            let fresh = skipper.skip(&buf[..n]);
            if fresh.is_empty() {
                continue;
            }
            if let Err(e) = file.write_all(fresh).await {
                break Err(e.into());
            }
            total_received += fresh.len() as u64;
            let _ = progress
                .send(ReceiveProgress::Receiving {
                    bytes: fresh.len() as u64,
                    total_received,
                })
                .await;
        };

        // Close the append handle on every path so the partial size is durable.
        let closed = async {
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        streamed?;
        closed?;

        let unpacker = ArchiveUnpacker::new(&self.dest);
        if !unpacker.verify_file(partial.path()).await? {
            return Err(Error::ConnectionClosed);
        }

        self.transition(conn, SessionState::Extracting);
        let _ = progress.send(ReceiveProgress::Extracting).await;

        let entries = unpacker.unpack_file(partial.path()).await?;
        partial.remove().await?;

        Ok(ReceiveReport {
            resumed_from,
            bytes_received: total_received - resumed_from,
            entries,
        })
    }
}

/// Run `work` unless `withdraw` changes first.
async fn until_withdrawn<T>(
    withdraw: Option<&mut watch::Receiver<u64>>,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    let Some(withdraw) = withdraw else {
        return work.await;
    };
    tokio::select! {
        biased;
        result = work => result,
        _ = withdraw.changed() => Err(Error::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_withdrawn_sender_stops_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("f.txt");
        std::fs::write(&src, b"x").unwrap();

        let (near, _far) = tokio::io::duplex(1024);
        let mut conn = PeerConnection::from_io("silent", near);
        let (withdraw_tx, withdraw_rx) = watch::channel(0u64);
        let (tx, mut rx) = mpsc::channel(8);

        let session = SendSession::new(&src, TransferConfig::default()).withdraw_on(withdraw_rx);
        let run = tokio::spawn(async move { session.run(&mut conn, tx).await });
        assert!(matches!(rx.recv().await, Some(SendProgress::AwaitingHandshake)));

        withdraw_tx.send_modify(|generation| *generation += 1);
        assert!(matches!(run.await.unwrap(), Err(Error::Cancelled)));
        assert!(matches!(rx.recv().await, Some(SendProgress::Cancelled)));
    }

    #[test]
    fn test_terminal_events() {
        assert!(SendProgress::Closed.is_terminal());
        assert!(SendProgress::Finished { bytes_sent: 0 }.is_terminal());
        assert!(!SendProgress::Resuming { offset: 3 }.is_terminal());
        assert!(ReceiveProgress::Error("x".into()).is_terminal());
        assert!(ReceiveProgress::Cancelled.is_terminal());
        assert!(!ReceiveProgress::Extracting.is_terminal());
    }
}
