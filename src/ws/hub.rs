//! Outbound routing to live connections

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::protocol::{ConnectionId, ServerMsg};

/// Messages buffered per connection before new ones are dropped
pub const OUTBOX_CAPACITY: usize = 256;

/// Outboxes of every connected socket, keyed by connection id.
///
/// Sends never wait: a missing, full or closed outbox drops the message.
pub struct ConnectionHub {
    outboxes: DashMap<ConnectionId, mpsc::Sender<ServerMsg>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self {
            outboxes: DashMap::new(),
        }
    }

    /// Create the outbox for a new connection
    pub fn register(&self, id: ConnectionId) -> mpsc::Receiver<ServerMsg> {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        self.outboxes.insert(id, tx);
        rx
    }

    pub fn unregister(&self, id: ConnectionId) {
        self.outboxes.remove(&id);
    }

    pub fn connected(&self) -> usize {
        self.outboxes.len()
    }

    /// Queue a message for one connection. Returns whether it was queued.
    pub fn send(&self, to: ConnectionId, msg: ServerMsg) -> bool {
        let Some(tx) = self.outboxes.get(&to).map(|e| e.value().clone()) else {
            debug!(connection_id = %to, "Dropping message for unknown connection");
            return false;
        };
        match tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(connection_id = %to, "Outbox full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection_id = %to, "Outbox closed, dropping message");
                false
            }
        }
    }

    /// Queue a message for every connection
    pub fn broadcast(&self, msg: &ServerMsg) {
        let targets: Vec<ConnectionId> = self.outboxes.iter().map(|e| *e.key()).collect();
        for id in targets {
            self.send(id, msg.clone());
        }
    }
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new()
    }
}
