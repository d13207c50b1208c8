use std::collections::HashMap;

use eam_core::{Broadcaster, ConnectionId};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

const DEFAULT_CHANNEL_DEPTH: usize = 64;

/// Outbound queues of every live WebSocket connection.
pub struct ConnectionHub {
    peers: Mutex<HashMap<ConnectionId, mpsc::Sender<Vec<u8>>>>,
    per_connection_buffer: usize,
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_DEPTH)
    }
}

impl ConnectionHub {
    pub fn new(per_connection_buffer: usize) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            per_connection_buffer: per_connection_buffer.max(1),
        }
    }

    pub fn register(&self, id: ConnectionId) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(self.per_connection_buffer);
        let mut peers = self.peers.lock();
        peers.insert(id, tx);
        debug!(connection_id = %id, active = peers.len(), "connection registered");
        rx
    }

    pub fn unregister(&self, id: ConnectionId) -> bool {
        let mut peers = self.peers.lock();
        let removed = peers.remove(&id).is_some();
        debug!(connection_id = %id, active = peers.len(), "connection unregistered");
        removed
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn deliver(id: ConnectionId, tx: &mpsc::Sender<Vec<u8>>, payload: Vec<u8>) -> Delivery {
    match tx.try_send(payload) {
        Ok(()) => Delivery::Queued,
        Err(TrySendError::Full(_)) => {
            warn!(connection_id = %id, "outbound queue full; dropping frame");
            Delivery::Dropped
        }
        Err(TrySendError::Closed(_)) => Delivery::Gone,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Delivery {
    Queued,
    Dropped,
    Gone,
}

impl Broadcaster for ConnectionHub {
    fn send(&self, peer: ConnectionId, payload: Vec<u8>) -> bool {
        let mut peers = self.peers.lock();
        let Some(tx) = peers.get(&peer) else {
            return false;
        };
        match deliver(peer, tx, payload) {
            Delivery::Queued => true,
            Delivery::Dropped => false,
            Delivery::Gone => {
                peers.remove(&peer);
                warn!(connection_id = %peer, "evicted closed connection");
                false
            }
        }
    }

    fn broadcast(&self, payload: Vec<u8>) -> usize {
        let mut peers = self.peers.lock();
        let mut delivered = 0;
        peers.retain(|id, tx| match deliver(*id, tx, payload.clone()) {
            Delivery::Queued => {
                delivered += 1;
                true
            }
            Delivery::Dropped => true,
            Delivery::Gone => {
                warn!(connection_id = %id, "evicted closed connection");
                false
            }
        });
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test_timeout::tokio_timeout_test]
    async fn broadcast_reaches_every_peer() {
        let hub = ConnectionHub::default();
        let mut a = hub.register(Uuid::new_v4());
        let mut b = hub.register(Uuid::new_v4());

        assert_eq!(hub.broadcast(b"done".to_vec()), 2);
        assert_eq!(a.recv().await.as_deref(), Some(&b"done"[..]));
        assert_eq!(b.recv().await.as_deref(), Some(&b"done"[..]));
    }

    #[test_timeout::tokio_timeout_test]
    async fn send_targets_one_peer() {
        let hub = ConnectionHub::default();
        let a_id = Uuid::new_v4();
        let mut a = hub.register(a_id);
        let mut b = hub.register(Uuid::new_v4());

        assert!(hub.send(a_id, b"reply".to_vec()));
        assert_eq!(a.recv().await.as_deref(), Some(&b"reply"[..]));
        assert!(b.try_recv().is_err());
        assert!(!hub.send(Uuid::new_v4(), b"nobody".to_vec()));
    }

    #[test]
    fn closed_receivers_are_evicted() {
        let hub = ConnectionHub::default();
        let gone = Uuid::new_v4();
        drop(hub.register(gone));
        let _live = hub.register(Uuid::new_v4());

        assert_eq!(hub.broadcast(b"x".to_vec()), 1);
        assert_eq!(hub.len(), 1);
        assert!(!hub.unregister(gone));
    }

    #[test]
    fn full_queue_drops_frame_but_keeps_peer() {
        let hub = ConnectionHub::new(1);
        let id = Uuid::new_v4();
        let _rx = hub.register(id);

        assert!(hub.send(id, b"first".to_vec()));
        assert!(!hub.send(id, b"second".to_vec()));
        assert_eq!(hub.len(), 1);
    }
}
