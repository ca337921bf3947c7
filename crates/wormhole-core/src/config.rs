use std::time::Duration;

use crate::protocol::CHUNK_SIZE;

/// Tunables shared by every transfer session in a room.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Read and pack granularity in bytes.
    pub chunk_size: usize,
    /// Number of packed chunks queued between the archive thread and the socket.
    pub channel_buffer: usize,
    /// How long a sender waits for the receiver's handshake. `None` waits forever.
    pub handshake_timeout: Option<Duration>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            chunk_size: CHUNK_SIZE,
            channel_buffer: 16,
            handshake_timeout: None,
        }
    }
}

impl TransferConfig {
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }
}
