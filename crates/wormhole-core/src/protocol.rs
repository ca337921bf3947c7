use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

/// ALPN prefix; the topic hex is appended to keep pools apart on one endpoint.
pub const WORMHOLE_ALPN_PREFIX: &[u8] = b"wormhole/1/";

/// Chunk size for archive packing and payload reads (256 KB)
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Upper bound for a single control frame.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Control messages exchanged as JSON frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Receiver announces how many archive bytes it already holds
    Handshake {
        #[serde(rename = "receivedBytes", default)]
        received_bytes: u64,
    },

    /// Sender announces itself; a waiting receiver answers with a fresh handshake
    Offer,

    /// Sender confirms a handshake; archive bytes from `offset` follow this frame
    Accept { offset: u64 },

    /// A chat line
    Chat(ChatMessage),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub nick: String,
    pub text: String,
    /// Milliseconds since the unix epoch
    pub timestamp: u64,
}

impl ChatMessage {
    pub fn new(nick: impl Into<String>, text: impl Into<String>) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            nick: nick.into(),
            text: text.into(),
            timestamp,
        }
    }
}

impl Message {
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Build the ALPN for a topic pool.
pub fn alpn_for(topic: &crate::Topic) -> Vec<u8> {
    let mut alpn = WORMHOLE_ALPN_PREFIX.to_vec();
    alpn.extend_from_slice(topic.to_hex().as_bytes());
    alpn
}

/// Send a length-prefixed message
pub async fn send_message<W>(stream: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_frame(stream, &msg.to_json()?).await
}

/// Write one frame: u32 big-endian length, then the payload.
pub async fn write_frame<W>(stream: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::Protocol("message too large".into()));
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);

    // One write so the header and body never straddle two sends.
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Read exactly one frame. Returns `None` on a clean end-of-stream at a frame boundary.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = stream.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::Protocol("truncated frame header".into()));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol("message too large".into()));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_wire_format() {
        let msg = Message::Handshake {
            received_bytes: 1536,
        };
        let json: serde_json::Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "HANDSHAKE");
        assert_eq!(json["receivedBytes"], 1536);
    }

    #[test]
    fn test_chat_wire_format() {
        let msg = Message::Chat(ChatMessage {
            nick: "ana".into(),
            text: "hi".into(),
            timestamp: 1_700_000_000_000,
        });
        let json: serde_json::Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "CHAT");
        assert_eq!(json["nick"], "ana");
        assert_eq!(json["text"], "hi");
        assert_eq!(json["timestamp"], 1_700_000_000_000u64);
    }

    #[test]
    fn test_offer_and_accept_wire_format() {
        let offer: serde_json::Value =
            serde_json::from_slice(&Message::Offer.to_json().unwrap()).unwrap();
        assert_eq!(offer["type"], "OFFER");

        let accept = Message::Accept { offset: 512 }.to_json().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&accept).unwrap();
        assert_eq!(json["type"], "ACCEPT");
        assert_eq!(json["offset"], 512);
        assert_eq!(
            Message::from_json(&accept).unwrap(),
            Message::Accept { offset: 512 }
        );
    }

    #[test]
    fn test_handshake_without_received_bytes_defaults_to_zero() {
        let msg = Message::from_json(br#"{"type":"HANDSHAKE"}"#).unwrap();
        assert_eq!(msg, Message::Handshake { received_bytes: 0 });
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(Message::from_json(br#"{"type":"PING"}"#).is_err());
        assert!(Message::from_json(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_frames_survive_byte_at_a_time_delivery() {
        let (mut a, mut b) = tokio::io::duplex(1);
        let writer = tokio::spawn(async move {
            write_frame(&mut a, b"first").await.unwrap();
            write_frame(&mut a, b"").await.unwrap();
            write_frame(&mut a, b"third").await.unwrap();
        });

        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"third");
        writer.await.unwrap();
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_header_is_protocol_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes())
            .await
            .unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_truncated_header_is_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0]).await.unwrap();
        drop(a);
        assert!(read_frame(&mut b).await.is_err());
    }
}
