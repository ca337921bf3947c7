//! Resume-point negotiation that precedes every archive stream.
//!
//! The receiver's first write is a HANDSHAKE frame carrying the size of its partial file. The
//! sender opens with an OFFER, reads frames until one of them is a handshake and answers it
//! with an ACCEPT naming the offset it streams from. Archive bytes follow the ACCEPT directly,
//! so a receiver never appends anything to its partial file before it has seen one.
//!
//! Two peers in the same role simply keep waiting: senders skip each other's OFFER and
//! receivers skip each other's HANDSHAKE.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::partial::PartialFile;
use crate::protocol::{Message, read_frame, send_message};
use crate::{Error, Result};

/// Announce how many archive bytes this side already holds.
pub async fn send_handshake<W>(writer: &mut W, received_bytes: u64) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    send_message(writer, &Message::Handshake { received_bytes }).await
}

/// Announce that this side wants to send.
pub async fn send_offer<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    send_message(writer, &Message::Offer).await
}

/// Confirm a handshake. Archive bytes from `offset` must follow immediately.
pub async fn send_accept<W>(writer: &mut W, offset: u64) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    send_message(writer, &Message::Accept { offset }).await
}

/// Wait for the peer's handshake and return its `receivedBytes`.
///
/// Reads one frame at a time so no payload byte after the handshake is consumed.
pub async fn await_handshake<R>(reader: &mut R, timeout: Option<Duration>) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    within(timeout, async {
        loop {
            match next_message(&mut *reader).await? {
                Message::Handshake { received_bytes } => return Ok(received_bytes),
                Message::Offer => debug!("peer is offering too, still waiting for a handshake"),
                other => debug!(?other, "ignoring non-handshake message"),
            }
        }
    })
    .await
}

/// Wait for the sender's ACCEPT and return the offset its stream starts at.
///
/// Every OFFER is answered with a fresh handshake from the current size of `partial`, so a
/// sender that arrives after this side's first handshake was consumed still gets one.
pub async fn await_accept<R, W>(
    reader: &mut R,
    writer: &mut W,
    partial: &PartialFile,
    timeout: Option<Duration>,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    within(timeout, async {
        loop {
            match next_message(&mut *reader).await? {
                Message::Accept { offset } => return Ok(offset),
                Message::Offer => {
                    let received_bytes = partial.len().await?;
                    debug!(received_bytes, "peer offered, repeating handshake");
                    send_handshake(&mut *writer, received_bytes).await?;
                }
                Message::Handshake { .. } => debug!("peer is receiving too, still waiting"),
                other => debug!(?other, "ignoring message while waiting for a sender"),
            }
        }
    })
    .await
}

/// Next parseable control message; stray frames are skipped.
async fn next_message<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        let frame = match read_frame(&mut *reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                return Err(Error::Handshake("connection closed during negotiation".into()));
            }
            Err(e) => return Err(Error::Handshake(e.to_string())),
        };
        match Message::from_json(&frame) {
            Ok(message) => return Ok(message),
            Err(e) => debug!(error = %e, len = frame.len(), "ignoring unparseable frame"),
        }
    }
}

async fn within<T>(
    timeout: Option<Duration>,
    wait: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| Error::HandshakeTimeout)?,
        None => wait.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChatMessage, write_frame};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_handshake_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        send_handshake(&mut a, 4096).await.unwrap();
        assert_eq!(await_handshake(&mut b, None).await.unwrap(), 4096);
    }

    #[tokio::test]
    async fn test_stray_frames_before_handshake_are_ignored() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"garbage").await.unwrap();
        send_message(&mut a, &Message::Chat(ChatMessage::new("bob", "hello")))
            .await
            .unwrap();
        send_handshake(&mut a, 12).await.unwrap();

        assert_eq!(await_handshake(&mut b, None).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_payload_after_handshake_is_left_unread() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        send_handshake(&mut a, 0).await.unwrap();
        a.write_all(b"PAYLOAD").await.unwrap();
        drop(a);

        assert_eq!(await_handshake(&mut b, None).await.unwrap(), 0);
        let mut rest = Vec::new();
        b.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"PAYLOAD");
    }

    #[tokio::test]
    async fn test_close_before_handshake_fails() {
        let (a, mut b) = tokio::io::duplex(1024);
        drop(a);
        let err = await_handshake(&mut b, None).await.unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
    }

    #[tokio::test]
    async fn test_offers_from_another_sender_are_skipped() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        send_offer(&mut a).await.unwrap();
        send_handshake(&mut a, 77).await.unwrap();

        assert_eq!(await_handshake(&mut b, None).await.unwrap(), 77);
    }

    #[tokio::test]
    async fn test_receiver_ignores_other_receivers_and_answers_offers() {
        let dir = tempfile::tempdir().unwrap();
        let partial = PartialFile::in_dir(dir.path());
        std::fs::write(partial.path(), vec![1u8; 300]).unwrap();

        let (near, mut far) = tokio::io::duplex(4096);
        let (mut reader, mut writer) = tokio::io::split(near);

        // Another receiver's handshake, then a sender that missed ours.
        send_handshake(&mut far, 0).await.unwrap();
        send_offer(&mut far).await.unwrap();
        send_accept(&mut far, 300).await.unwrap();

        let offset = await_accept(&mut reader, &mut writer, &partial, None)
            .await
            .unwrap();
        assert_eq!(offset, 300);
        assert_eq!(await_handshake(&mut far, None).await.unwrap(), 300);
    }

    #[tokio::test]
    async fn test_receiver_without_sender_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let partial = PartialFile::in_dir(dir.path());
        let (near, mut far) = tokio::io::duplex(4096);
        let (mut reader, mut writer) = tokio::io::split(near);
        send_handshake(&mut far, 0).await.unwrap();

        let err = await_accept(
            &mut reader,
            &mut writer,
            &partial,
            Some(Duration::from_millis(20)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::HandshakeTimeout));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (_a, mut b) = tokio::io::duplex(1024);
        let err = await_handshake(&mut b, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeTimeout));
    }
}
