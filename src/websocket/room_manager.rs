use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A client's subscription information.
pub struct ClientSubscription {
    /// Subscribed league ids.
    pub leagues: HashSet<String>,
    /// Channel to send messages to the client.
    pub tx: mpsc::UnboundedSender<String>,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Manages WebSocket client subscriptions to league rooms.
pub struct RoomManager {
    /// Client subscriptions keyed by client ID.
    clients: DashMap<Uuid, ClientSubscription>,
    /// League rooms: league id -> set of client IDs.
    rooms: DashMap<String, HashSet<Uuid>>,
}

impl RoomManager {
    /// Create a new room manager.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new client.
    pub fn register(&self, tx: mpsc::UnboundedSender<String>) -> Uuid {
        let client_id = Uuid::new_v4();
        self.clients.insert(
            client_id,
            ClientSubscription {
                leagues: HashSet::new(),
                tx,
            },
        );
        client_id
    }

    /// Unregister a client and remove it from all rooms.
    pub fn unregister(&self, client_id: Uuid) {
        if let Some((_, subscription)) = self.clients.remove(&client_id) {
            for league in subscription.leagues {
                self.leave_room(&league, client_id);
            }
        }
    }

    /// Subscribe a client to a league.
    ///
    /// `catch_up` produces the first message for the client. It is queued
    /// while the client entry is locked, so no broadcast for this league can
    /// reach the client ahead of it. Returns false for unknown clients.
    pub fn subscribe<F>(&self, client_id: Uuid, league_id: &str, catch_up: F) -> bool
    where
        F: FnOnce() -> Option<String>,
    {
        let Some(mut client) = self.clients.get_mut(&client_id) else {
            return false;
        };

        if client.leagues.insert(league_id.to_string()) {
            self.rooms
                .entry(league_id.to_string())
                .or_default()
                .insert(client_id);
        }

        if let Some(message) = catch_up() {
            if client.tx.send(message).is_err() {
                debug!("Client {} closed before catch-up for {}", client_id, league_id);
            }
        }
        true
    }

    /// Unsubscribe a client from a league. Returns true if it was subscribed.
    pub fn unsubscribe(&self, client_id: Uuid, league_id: &str) -> bool {
        let removed = self
            .clients
            .get_mut(&client_id)
            .map(|mut client| client.leagues.remove(league_id))
            .unwrap_or(false);

        if removed {
            self.leave_room(league_id, client_id);
        }
        removed
    }

    /// Send a message to a single client.
    pub fn send_to(&self, client_id: Uuid, message: String) -> bool {
        self.clients
            .get(&client_id)
            .map(|client| client.tx.send(message).is_ok())
            .unwrap_or(false)
    }

    /// Broadcast a message to every subscriber of a league.
    ///
    /// A failed send only affects that connection: it is logged and the
    /// connection is dropped from the registry.
    pub fn broadcast(&self, league_id: &str, message: &str) -> BroadcastReport {
        let client_ids: Vec<Uuid> = self
            .rooms
            .get(league_id)
            .map(|room| room.iter().copied().collect())
            .unwrap_or_default();

        let mut report = BroadcastReport::default();
        let mut dead = Vec::new();

        for client_id in client_ids {
            let sent = self
                .clients
                .get(&client_id)
                .map(|client| client.tx.send(message.to_string()).is_ok());
            match sent {
                Some(true) => report.delivered += 1,
                Some(false) => {
                    warn!("Broadcast to client {} for league {} failed", client_id, league_id);
                    report.failed += 1;
                    dead.push(client_id);
                }
                // Unregistered between the room read and the send.
                None => {}
            }
        }

        for client_id in dead {
            self.unregister(client_id);
        }

        report
    }

    /// Number of subscribers in a league room.
    pub fn subscriber_count(&self, league_id: &str) -> usize {
        self.rooms.get(league_id).map(|room| room.len()).unwrap_or(0)
    }

    /// Get the number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Get the number of active rooms (leagues with subscribers).
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn leave_room(&self, league_id: &str, client_id: Uuid) {
        if let Some(mut room) = self.rooms.get_mut(league_id) {
            room.remove(&client_id);
        }
        self.rooms.remove_if(league_id, |_, room| room.is_empty());
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self {
            clients: DashMap::new(),
            rooms: DashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_sends_catch_up_first() {
        let rooms = RoomManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = rooms.register(tx);

        assert!(rooms.subscribe(client, "l1", || Some("snapshot".to_string())));
        rooms.broadcast("l1", "delta");

        assert_eq!(rx.try_recv().unwrap(), "snapshot");
        assert_eq!(rx.try_recv().unwrap(), "delta");
    }

    #[test]
    fn test_broadcast_only_reaches_league_subscribers() {
        let rooms = RoomManager::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let a = rooms.register(tx1);
        let b = rooms.register(tx2);
        rooms.subscribe(a, "l1", || None);
        rooms.subscribe(b, "l2", || None);

        let report = rooms.broadcast("l1", "hello");
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 0 });
        assert_eq!(rx1.try_recv().unwrap(), "hello");
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_dead_connection_is_pruned() {
        let rooms = RoomManager::new();
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let dead = rooms.register(tx1);
        let alive = rooms.register(tx2);
        rooms.subscribe(dead, "l1", || None);
        rooms.subscribe(alive, "l1", || None);
        drop(rx1);

        let report = rooms.broadcast("l1", "delta");
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1 });
        assert_eq!(rx2.try_recv().unwrap(), "delta");
        assert_eq!(rooms.client_count(), 1);
        assert_eq!(rooms.subscriber_count("l1"), 1);
    }

    #[test]
    fn test_unsubscribe_and_unregister() {
        let rooms = RoomManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = rooms.register(tx);
        rooms.subscribe(client, "l1", || None);
        rooms.subscribe(client, "l2", || None);

        assert!(rooms.unsubscribe(client, "l1"));
        assert!(!rooms.unsubscribe(client, "l1"));
        assert_eq!(rooms.room_count(), 1);

        rooms.unregister(client);
        assert_eq!(rooms.room_count(), 0);
        assert_eq!(rooms.client_count(), 0);
    }
}
