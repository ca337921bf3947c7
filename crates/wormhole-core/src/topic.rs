use std::fmt;

use sha2::{Digest, Sha256};

/// Suffix appended to the room secret to derive the file-transfer topic.
pub const FILES_SUFFIX: &str = "-files";

/// Discovery key for one logical channel of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topic([u8; 32]);

impl Topic {
    /// Hash an arbitrary secret into a topic.
    pub fn derive(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        Self(digest.into())
    }

    /// Topic of the chat channel for a room.
    pub fn chat(room: &str) -> Self {
        Self::derive(room)
    }

    /// Topic of the file-transfer channel for a room.
    pub fn files(room: &str) -> Self {
        Self::derive(&format!("{room}{FILES_SUFFIX}"))
    }

    pub fn to_hex(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
