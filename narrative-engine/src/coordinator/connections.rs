//! Registry of live real-time connections, keyed by session.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::events::ServerEvent;

/// Identifier of one live connection.
pub type ConnectionId = u64;

/// Default outbound buffer per connection.
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Live connections per session.
///
/// Connections register at handshake and deregister on close. Each one owns
/// the receiving half of a bounded channel; the registry keeps the senders.
pub struct ConnectionRegistry {
    sessions: DashMap<String, HashMap<ConnectionId, mpsc::Sender<ServerEvent>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Register a connection for `session_id`.
    pub fn register(&self, session_id: &str) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(self.capacity);
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(id, tx);
        debug!(session_id = %session_id, connection_id = id, "Connection registered");
        (id, rx)
    }

    /// Remove a connection; drops the session entry when it was the last.
    pub fn deregister(&self, session_id: &str, connection_id: ConnectionId) {
        if let Some(mut conns) = self.sessions.get_mut(session_id) {
            conns.remove(&connection_id);
        }
        self.sessions.remove_if(session_id, |_, conns| conns.is_empty());
        debug!(session_id = %session_id, connection_id, "Connection deregistered");
    }

    /// Deliver to one connection. Returns false if it is gone or saturated.
    pub fn send_to(&self, session_id: &str, connection_id: ConnectionId, event: ServerEvent) -> bool {
        let sender = self
            .sessions
            .get(session_id)
            .and_then(|conns| conns.get(&connection_id).cloned());
        match sender {
            Some(tx) => self.deliver(session_id, connection_id, &tx, event),
            None => false,
        }
    }

    /// Deliver to every connection of the session except `except`.
    /// Returns the number of connections reached.
    pub fn broadcast(&self, session_id: &str, except: Option<ConnectionId>, event: &ServerEvent) -> usize {
        let targets: Vec<(ConnectionId, mpsc::Sender<ServerEvent>)> = match self.sessions.get(session_id) {
            Some(conns) => conns
                .iter()
                .filter(|(id, _)| Some(**id) != except)
                .map(|(id, tx)| (*id, tx.clone()))
                .collect(),
            None => return 0,
        };

        targets
            .iter()
            .filter(|(id, tx)| self.deliver(session_id, *id, tx, event.clone()))
            .count()
    }

    pub fn connection_count(&self, session_id: &str) -> usize {
        self.sessions.get(session_id).map(|c| c.len()).unwrap_or(0)
    }

    fn deliver(
        &self,
        session_id: &str,
        connection_id: ConnectionId,
        tx: &mpsc::Sender<ServerEvent>,
        event: ServerEvent,
    ) -> bool {
        match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(
                    session_id = %session_id,
                    connection_id,
                    event = event.kind(),
                    "Connection buffer full; event not delivered"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.deregister(session_id, connection_id);
                false
            }
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_skips_initiator() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = registry.register("s");
        let (_b, mut rx_b) = registry.register("s");
        let (_c, mut rx_other) = registry.register("other");

        assert_eq!(registry.broadcast("s", Some(a), &ServerEvent::Pong), 1);
        assert_eq!(rx_b.recv().await, Some(ServerEvent::Pong));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_other.try_recv().is_err());

        assert!(registry.send_to("s", a, ServerEvent::Pong));
        assert_eq!(rx_a.recv().await, Some(ServerEvent::Pong));
    }

    #[tokio::test]
    async fn test_deregister_and_closed_receivers() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = registry.register("s");
        let (b, rx_b) = registry.register("s");
        assert_eq!(registry.connection_count("s"), 2);

        registry.deregister("s", a);
        assert_eq!(registry.connection_count("s"), 1);

        // A dropped receiver is pruned on the next delivery attempt.
        drop(rx_b);
        assert!(!registry.send_to("s", b, ServerEvent::Pong));
        assert_eq!(registry.connection_count("s"), 0);
    }

    #[tokio::test]
    async fn test_full_buffer_does_not_block() {
        let registry = ConnectionRegistry::with_capacity(1);
        let (a, _rx) = registry.register("s");
        assert!(registry.send_to("s", a, ServerEvent::Pong));
        assert!(!registry.send_to("s", a, ServerEvent::Pong));
    }
}
