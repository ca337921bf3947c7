use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::swarm::ConnectionId;

/// Registry of connections currently carrying a transfer.
///
/// Chat dispatch skips exactly these connections, so archive bytes are never parsed as chat
/// and chat frames are never written into an archive stream.
#[derive(Debug, Clone, Default)]
pub struct ConnectionClassifier {
    transfers: Arc<Mutex<HashSet<ConnectionId>>>,
}

impl ConnectionClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a connection into transfer mode. `None` if it already is.
    pub fn claim(&self, id: ConnectionId) -> Option<TransferLease> {
        if !self.transfers.lock().insert(id) {
            return None;
        }
        debug!(conn = %id, "connection entered transfer mode");
        Some(TransferLease {
            id,
            classifier: self.clone(),
        })
    }

    pub fn is_transfer(&self, id: ConnectionId) -> bool {
        self.transfers.lock().contains(&id)
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers.lock().len()
    }

    fn release(&self, id: ConnectionId) {
        if self.transfers.lock().remove(&id) {
            debug!(conn = %id, "connection left transfer mode");
        }
    }
}

/// Keeps a connection in transfer mode until dropped.
#[derive(Debug)]
pub struct TransferLease {
    id: ConnectionId,
    classifier: ConnectionClassifier,
}

impl Drop for TransferLease {
    fn drop(&mut self) {
        self.classifier.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_marks_and_releases() {
        let classifier = ConnectionClassifier::new();
        let id = ConnectionId::next();

        let lease = classifier.claim(id).unwrap();
        assert!(classifier.is_transfer(id));
        assert_eq!(classifier.transfer_count(), 1);

        drop(lease);
        assert!(!classifier.is_transfer(id));
        assert_eq!(classifier.transfer_count(), 0);
    }

    #[test]
    fn test_double_claim_is_refused() {
        let classifier = ConnectionClassifier::new();
        let id = ConnectionId::next();

        let _lease = classifier.claim(id).unwrap();
        assert!(classifier.claim(id).is_none());
        assert!(classifier.claim(ConnectionId::next()).is_some());
    }
}
