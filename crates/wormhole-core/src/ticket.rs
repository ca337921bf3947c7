use iroh::EndpointAddr;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Everything needed to dial a peer's endpoint.
///
/// The room secret is never part of the ticket; both sides must already know it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerTicket {
    /// The peer's endpoint address
    pub addr: EndpointAddr,
}

impl PeerTicket {
    pub fn new(addr: EndpointAddr) -> Self {
        Self { addr }
    }

    /// Encode as lowercase base32 for copy and paste.
    pub fn serialize(&self) -> String {
        let bytes = postcard::to_allocvec(self).expect("ticket serialization cannot fail");
        data_encoding::BASE32_NOPAD.encode(&bytes).to_lowercase()
    }

    /// Parse a ticket, ignoring case and surrounding whitespace.
    pub fn deserialize(s: &str) -> Result<Self> {
        let s = s.trim().to_uppercase();
        let bytes = data_encoding::BASE32_NOPAD
            .decode(s.as_bytes())
            .map_err(|e| Error::InvalidTicket(format!("invalid base32: {}", e)))?;

        postcard::from_bytes(&bytes)
            .map_err(|e| Error::InvalidTicket(format!("invalid ticket data: {}", e)))
    }
}

impl std::fmt::Display for PeerTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.serialize())
    }
}

impl std::str::FromStr for PeerTicket {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::deserialize(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iroh::SecretKey;

    fn ticket() -> PeerTicket {
        let secret = SecretKey::generate(&mut rand::rng());
        PeerTicket::new(EndpointAddr::new(secret.public()))
    }

    #[test]
    fn test_ticket_parses_back() {
        let ticket = ticket();
        let decoded: PeerTicket = ticket.to_string().parse().unwrap();
        assert_eq!(ticket.addr.id, decoded.addr.id);
    }

    #[test]
    fn test_ticket_tolerates_case_and_whitespace() {
        let ticket = ticket();
        let pasted = format!("  {}\n", ticket.serialize().to_uppercase());
        let decoded = PeerTicket::deserialize(&pasted).unwrap();
        assert_eq!(ticket.addr.id, decoded.addr.id);
    }

    #[test]
    fn test_ticket_rejects_bad_input() {
        let err = PeerTicket::deserialize("not-valid-base32!").unwrap_err();
        assert!(err.to_string().contains("invalid base32"));

        // Valid base32 but not a valid ticket
        let err = PeerTicket::deserialize("MFRGGZDFMY").unwrap_err();
        assert!(err.to_string().contains("invalid ticket data"));
    }
}
