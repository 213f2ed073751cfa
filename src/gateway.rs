use std::collections::{HashMap, HashSet};

use mongodb::bson::Uuid;
use tokio::sync::mpsc;

use crate::types::Message;

pub type ConnId = Uuid;

/// Events fanned out to a live connection.
#[derive(Debug, Clone)]
pub enum Outbound {
    Message(Message),
    RoomDeleted { room: String },
}

/// Ephemeral connection ↔ broadcast-group registry.
///
/// Owned by the coordinator task and mutated only from its loop, so
/// subscribe/unsubscribe are atomic with respect to broadcast iteration.
/// Nothing here is persisted; on restart clients re-fetch history instead.
pub struct Gateway {
    sessions: HashMap<ConnId, mpsc::Sender<Outbound>>,
    groups: HashMap<String, HashSet<ConnId>>,
}

impl Gateway {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            groups: HashMap::new(),
        }
    }

    pub fn register(&mut self, conn_id: ConnId, tx: mpsc::Sender<Outbound>) {
        self.sessions.insert(conn_id, tx);
    }

    /// Drops the session and scrubs it from every group.
    pub fn unregister(&mut self, conn_id: ConnId) {
        self.sessions.remove(&conn_id);
        for members in self.groups.values_mut() {
            members.remove(&conn_id);
        }
        self.groups.retain(|_, members| !members.is_empty());
    }

    /// Idempotent; delivers no historical backfill.
    pub fn subscribe(&mut self, conn_id: ConnId, group_key: &str) {
        self.groups
            .entry(group_key.to_string())
            .or_default()
            .insert(conn_id);
    }

    pub fn unsubscribe(&mut self, conn_id: ConnId, group_key: &str) {
        if let Some(members) = self.groups.get_mut(group_key) {
            members.remove(&conn_id);
            if members.is_empty() {
                self.groups.remove(group_key);
            }
        }
    }

    /// Delivers to every current subscriber, the sender's own connection
    /// included. An empty group is a no-op; a dead subscriber is pruned
    /// without disturbing delivery to the rest.
    pub async fn broadcast(&mut self, group_key: &str, event: Outbound) {
        let Some(members) = self.groups.get(group_key) else {
            return;
        };

        let mut dead = Vec::new();
        for conn_id in members {
            match self.sessions.get(conn_id) {
                Some(tx) => {
                    if tx.send(event.clone()).await.is_err() {
                        log::warn!("Dropping dead subscriber {} from {}", conn_id, group_key);
                        dead.push(*conn_id);
                    }
                }
                None => dead.push(*conn_id),
            }
        }

        for conn_id in dead {
            self.unsubscribe(conn_id, group_key);
            self.sessions.remove(&conn_id);
        }
    }

    /// Notifies every member that the room is gone and dissolves the group.
    /// Returns the evicted connections so their session state can be reset.
    pub async fn drop_group(&mut self, group_key: &str) -> Vec<ConnId> {
        self.broadcast(
            group_key,
            Outbound::RoomDeleted {
                room: group_key.to_string(),
            },
        )
        .await;

        match self.groups.remove(group_key) {
            Some(members) => members.into_iter().collect(),
            None => Vec::new(),
        }
    }

    #[cfg(test)]
    fn group_len(&self, group_key: &str) -> usize {
        self.groups.get(group_key).map_or(0, HashSet::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(room: &str, author: &str, content: &str) -> Message {
        Message {
            room: room.into(),
            author: author.into(),
            content: content.into(),
            timestamp: "12:00".into(),
        }
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let mut gateway = Gateway::new();
        let conn = ConnId::new();
        let (tx, _rx) = mpsc::channel(8);
        gateway.register(conn, tx);

        gateway.subscribe(conn, "alice_and_bob");
        gateway.subscribe(conn, "alice_and_bob");

        assert_eq!(gateway.group_len("alice_and_bob"), 1);
    }

    #[tokio::test]
    async fn broadcast_to_empty_group_is_a_noop() {
        let mut gateway = Gateway::new();
        gateway
            .broadcast("nobody_here", Outbound::Message(message("nobody_here", "a", "hi")))
            .await;
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber_including_sender() {
        let mut gateway = Gateway::new();
        let alice = ConnId::new();
        let bob = ConnId::new();
        let (alice_tx, mut alice_rx) = mpsc::channel(8);
        let (bob_tx, mut bob_rx) = mpsc::channel(8);
        gateway.register(alice, alice_tx);
        gateway.register(bob, bob_tx);
        gateway.subscribe(alice, "alice_and_bob");
        gateway.subscribe(bob, "alice_and_bob");

        let msg = message("alice_and_bob", "alice", "hi");
        gateway.broadcast("alice_and_bob", Outbound::Message(msg.clone())).await;

        for rx in [&mut alice_rx, &mut bob_rx] {
            match rx.recv().await {
                Some(Outbound::Message(received)) => assert_eq!(received, msg),
                other => panic!("expected message broadcast, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn dead_subscriber_does_not_block_the_rest() {
        let mut gateway = Gateway::new();
        let dead = ConnId::new();
        let live = ConnId::new();
        let (dead_tx, dead_rx) = mpsc::channel(8);
        let (live_tx, mut live_rx) = mpsc::channel(8);
        drop(dead_rx);
        gateway.register(dead, dead_tx);
        gateway.register(live, live_tx);
        gateway.subscribe(dead, "alice_and_bob");
        gateway.subscribe(live, "alice_and_bob");

        let msg = message("alice_and_bob", "alice", "still here?");
        gateway.broadcast("alice_and_bob", Outbound::Message(msg.clone())).await;

        match live_rx.recv().await {
            Some(Outbound::Message(received)) => assert_eq!(received, msg),
            other => panic!("expected message broadcast, got {other:?}"),
        }
        assert_eq!(gateway.group_len("alice_and_bob"), 1);
    }

    #[tokio::test]
    async fn unregister_scrubs_group_membership() {
        let mut gateway = Gateway::new();
        let conn = ConnId::new();
        let (tx, _rx) = mpsc::channel(8);
        gateway.register(conn, tx);
        gateway.subscribe(conn, "alice_and_bob");

        gateway.unregister(conn);

        assert_eq!(gateway.group_len("alice_and_bob"), 0);
    }

    #[tokio::test]
    async fn drop_group_notifies_and_evicts_members() {
        let mut gateway = Gateway::new();
        let conn = ConnId::new();
        let (tx, mut rx) = mpsc::channel(8);
        gateway.register(conn, tx);
        gateway.subscribe(conn, "alice_and_bob");

        let evicted = gateway.drop_group("alice_and_bob").await;

        assert_eq!(evicted, vec![conn]);
        match rx.recv().await {
            Some(Outbound::RoomDeleted { room }) => assert_eq!(room, "alice_and_bob"),
            other => panic!("expected room deletion notice, got {other:?}"),
        }
        assert_eq!(gateway.group_len("alice_and_bob"), 0);
    }
}
