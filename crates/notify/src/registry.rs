// crates/notify/src/registry.rs
//! Registry of live push channels, indexed by audience.
//!
//! Owners and rooms are both just named audiences over the same sink set, so
//! a single audience index covers them. All indices live behind one lock:
//! a disconnect removes the sink from every index before the lock is
//! released, so concurrent fan-out can never observe partial removal.
//!
//! Health detection is lazy. There is no heartbeat; a sink is considered
//! dead the first time a send to it fails, and is disconnected as a side
//! effect of that send attempt.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::notification::Notification;

/// Opaque handle for one registered push channel.
pub type ConnectionId = Uuid;

/// Identifier of the user owning a connection or a job.
pub type OwnerId = u64;

/// The send half of a push channel. The transport adapter (socket framing,
/// SSE, test harness) owns the receiving half.
pub type Sink = mpsc::UnboundedSender<Notification>;

/// Tuning knobs for the notification layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Per-owner cap on the recent-notification ring.
    pub history_limit: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self { history_limit: 100 }
    }
}

/// A named delivery audience. One connection can belong to many audiences at
/// once; membership is tracked symmetrically on the connection and in the
/// audience index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Audience {
    Owner(OwnerId),
    Room(String),
}

/// Counts reported by [`ConnectionRegistry::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub total: usize,
    pub owners: usize,
    pub rooms: usize,
}

struct ConnectionEntry {
    tx: Sink,
    audiences: HashSet<Audience>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    index: HashMap<Audience, HashSet<ConnectionId>>,
    history: HashMap<OwnerId, VecDeque<Notification>>,
}

impl Inner {
    fn insert(&mut self, id: ConnectionId, tx: Sink, audiences: HashSet<Audience>) {
        for audience in &audiences {
            self.index.entry(audience.clone()).or_default().insert(id);
        }
        self.connections.insert(id, ConnectionEntry { tx, audiences });
    }

    /// Remove a connection from the primary map and from every audience it
    /// belonged to. Called only while the write lock is held.
    fn remove(&mut self, id: ConnectionId) -> bool {
        let Some(entry) = self.connections.remove(&id) else {
            return false;
        };
        for audience in entry.audiences {
            if let Some(members) = self.index.get_mut(&audience) {
                members.remove(&id);
                if members.is_empty() {
                    self.index.remove(&audience);
                }
            }
        }
        true
    }

    /// Deliver to every sink in `audience` (or every sink at all for
    /// `None`), disconnecting any sink whose send fails. Returns the number
    /// of sinks that accepted the send.
    fn deliver(&mut self, audience: Option<&Audience>, notification: &Notification) -> usize {
        let targets: Vec<ConnectionId> = match audience {
            Some(audience) => self
                .index
                .get(audience)
                .map(|members| members.iter().copied().collect())
                .unwrap_or_default(),
            None => self.connections.keys().copied().collect(),
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for id in targets {
            let Some(entry) = self.connections.get(&id) else {
                continue;
            };
            if entry.tx.send(notification.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(id);
            }
        }
        for id in dead {
            tracing::debug!(connection_id = %id, "send failed, retiring dead sink");
            self.remove(id);
        }
        delivered
    }

    fn record_history(&mut self, owner: OwnerId, notification: &Notification, limit: usize) {
        let ring = self.history.entry(owner).or_default();
        ring.push_back(notification.clone());
        while ring.len() > limit {
            ring.pop_front();
        }
    }
}

/// Tracks every live push channel in the process.
///
/// Shared between the job processor (fan-out), transport adapters
/// (connect/disconnect), and administrative reads.
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    config: NotifyConfig,
}

impl ConnectionRegistry {
    pub fn new(config: NotifyConfig) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            config,
        }
    }

    /// Register a sink, optionally bound to an owner and an initial set of
    /// rooms. The new sink receives a `connected` acknowledgment directly;
    /// nothing is fanned out. If even the acknowledgment fails the sink is
    /// already dead and is dropped on the spot.
    pub fn connect(
        &self,
        tx: Sink,
        owner: Option<OwnerId>,
        rooms: impl IntoIterator<Item = String>,
    ) -> ConnectionId {
        let id = Uuid::new_v4();
        let mut audiences: HashSet<Audience> =
            rooms.into_iter().map(Audience::Room).collect();
        if let Some(owner) = owner {
            audiences.insert(Audience::Owner(owner));
        }

        match self.inner.write() {
            Ok(mut inner) => {
                let ack_ok = tx.send(Notification::connected(id)).is_ok();
                if ack_ok {
                    inner.insert(id, tx, audiences);
                    tracing::debug!(connection_id = %id, "connection registered");
                } else {
                    tracing::debug!(connection_id = %id, "sink dead at handshake, not registered");
                }
            }
            Err(e) => tracing::error!("RwLock poisoned registering connection: {e}"),
        }
        id
    }

    /// Build a channel pair and register its send half. Convenience for
    /// callers that want the registry to own channel construction.
    pub fn open_channel(
        &self,
        owner: Option<OwnerId>,
        rooms: impl IntoIterator<Item = String>,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.connect(tx, owner, rooms);
        (id, rx)
    }

    /// Remove a connection from the owner index, every room, and the global
    /// set. Returns false for an unknown id.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        match self.inner.write() {
            Ok(mut inner) => inner.remove(id),
            Err(e) => {
                tracing::error!("RwLock poisoned disconnecting: {e}");
                false
            }
        }
    }

    /// Add the connection to a room. Owner indexing is unaffected.
    pub fn join_room(&self, id: ConnectionId, room: &str) -> bool {
        match self.inner.write() {
            Ok(mut inner) => {
                let Some(entry) = inner.connections.get_mut(&id) else {
                    return false;
                };
                let audience = Audience::Room(room.to_string());
                entry.audiences.insert(audience.clone());
                inner.index.entry(audience).or_default().insert(id);
                true
            }
            Err(e) => {
                tracing::error!("RwLock poisoned joining room: {e}");
                false
            }
        }
    }

    /// Drop the connection's membership in a room.
    pub fn leave_room(&self, id: ConnectionId, room: &str) -> bool {
        match self.inner.write() {
            Ok(mut inner) => {
                let audience = Audience::Room(room.to_string());
                let Some(entry) = inner.connections.get_mut(&id) else {
                    return false;
                };
                let was_member = entry.audiences.remove(&audience);
                if was_member {
                    if let Some(members) = inner.index.get_mut(&audience) {
                        members.remove(&id);
                        if members.is_empty() {
                            inner.index.remove(&audience);
                        }
                    }
                }
                was_member
            }
            Err(e) => {
                tracing::error!("RwLock poisoned leaving room: {e}");
                false
            }
        }
    }

    /// Deliver to every sink owned by `owner`. The notification is also
    /// recorded in the owner's recent-history ring, whether or not any sink
    /// is currently connected. The count is sinks that accepted the send,
    /// not a delivery guarantee.
    pub fn send_to_user(&self, owner: OwnerId, notification: &Notification) -> usize {
        match self.inner.write() {
            Ok(mut inner) => {
                inner.record_history(owner, notification, self.config.history_limit);
                inner.deliver(Some(&Audience::Owner(owner)), notification)
            }
            Err(e) => {
                tracing::error!("RwLock poisoned sending to user: {e}");
                0
            }
        }
    }

    /// Deliver to every sink currently joined to `room`.
    pub fn send_to_room(&self, room: &str, notification: &Notification) -> usize {
        match self.inner.write() {
            Ok(mut inner) => {
                inner.deliver(Some(&Audience::Room(room.to_string())), notification)
            }
            Err(e) => {
                tracing::error!("RwLock poisoned sending to room: {e}");
                0
            }
        }
    }

    /// Deliver to every registered sink.
    pub fn broadcast(&self, notification: &Notification) -> usize {
        match self.inner.write() {
            Ok(mut inner) => inner.deliver(None, notification),
            Err(e) => {
                tracing::error!("RwLock poisoned broadcasting: {e}");
                0
            }
        }
    }

    /// Recent notifications addressed to `owner`, newest first.
    pub fn recent_for_owner(&self, owner: OwnerId) -> Vec<Notification> {
        match self.inner.read() {
            Ok(inner) => inner
                .history
                .get(&owner)
                .map(|ring| ring.iter().rev().cloned().collect())
                .unwrap_or_default(),
            Err(e) => {
                tracing::error!("RwLock poisoned reading history: {e}");
                Vec::new()
            }
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        match self.inner.read() {
            Ok(inner) => {
                let owners = inner
                    .index
                    .keys()
                    .filter(|a| matches!(a, Audience::Owner(_)))
                    .count();
                let rooms = inner
                    .index
                    .keys()
                    .filter(|a| matches!(a, Audience::Room(_)))
                    .count();
                ConnectionStats {
                    total: inner.connections.len(),
                    owners,
                    rooms,
                }
            }
            Err(e) => {
                tracing::error!("RwLock poisoned reading stats: {e}");
                ConnectionStats {
                    total: 0,
                    owners: 0,
                    rooms: 0,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::NotificationKind;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(NotifyConfig::default())
    }

    #[tokio::test]
    async fn test_connect_sends_ack_to_new_sink_only() {
        let reg = registry();
        let (_id_a, mut rx_a) = reg.open_channel(Some(1), Vec::new());
        let ack = rx_a.recv().await.unwrap();
        assert_eq!(ack.kind, NotificationKind::Connected);

        // A second connection's ack must not reach the first sink.
        let (_id_b, mut rx_b) = reg.open_channel(Some(2), Vec::new());
        assert_eq!(rx_b.recv().await.unwrap().kind, NotificationKind::Connected);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_user_routes_by_owner() {
        let reg = registry();
        let (_a, mut rx_a) = reg.open_channel(Some(1), Vec::new());
        let (_b, mut rx_b) = reg.open_channel(Some(2), Vec::new());
        rx_a.recv().await.unwrap();
        rx_b.recv().await.unwrap();

        let delivered = reg.send_to_user(1, &Notification::info("hello"));
        assert_eq!(delivered, 1);
        assert_eq!(rx_a.recv().await.unwrap().kind, NotificationKind::Info);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_room_delivers_to_members_only() {
        let reg = registry();
        let (_a, mut rx_a) = reg.open_channel(Some(1), vec!["analytics".to_string()]);
        let (_b, mut rx_b) = reg.open_channel(Some(2), vec!["billing".to_string()]);
        rx_a.recv().await.unwrap();
        rx_b.recv().await.unwrap();

        let delivered = reg.send_to_room("analytics", &Notification::info("report ready"));
        assert_eq!(delivered, 1);
        assert_eq!(rx_a.recv().await.unwrap().kind, NotificationKind::Info);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_removes_from_all_indices() {
        let reg = registry();
        let (id, mut rx) = reg.open_channel(Some(1), vec!["analytics".to_string()]);
        rx.recv().await.unwrap();

        assert!(reg.disconnect(id));
        assert_eq!(reg.send_to_user(1, &Notification::info("x")), 0);
        assert_eq!(reg.send_to_room("analytics", &Notification::info("x")), 0);
        assert_eq!(reg.stats().total, 0);

        // Second disconnect is a no-op.
        assert!(!reg.disconnect(id));
    }

    #[tokio::test]
    async fn test_join_and_leave_room() {
        let reg = registry();
        let (id, mut rx) = reg.open_channel(Some(1), Vec::new());
        rx.recv().await.unwrap();

        assert!(reg.join_room(id, "exports"));
        assert_eq!(reg.send_to_room("exports", &Notification::info("x")), 1);
        rx.recv().await.unwrap();

        assert!(reg.leave_room(id, "exports"));
        assert_eq!(reg.send_to_room("exports", &Notification::info("x")), 0);
        // Owner routing is untouched by room churn.
        assert_eq!(reg.send_to_user(1, &Notification::info("x")), 1);
    }

    #[tokio::test]
    async fn test_dead_sink_is_retired_on_send() {
        let reg = registry();
        let (id, rx) = reg.open_channel(Some(1), vec!["analytics".to_string()]);
        drop(rx);

        // First send detects the dead sink and retires it everywhere.
        assert_eq!(reg.send_to_user(1, &Notification::info("x")), 0);
        assert_eq!(reg.stats().total, 0);
        assert_eq!(reg.send_to_room("analytics", &Notification::info("x")), 0);
        assert!(!reg.disconnect(id));
    }

    #[tokio::test]
    async fn test_broadcast_counts_all_sinks() {
        let reg = registry();
        let (_a, mut rx_a) = reg.open_channel(Some(1), Vec::new());
        let (_b, mut rx_b) = reg.open_channel(None, Vec::new());
        rx_a.recv().await.unwrap();
        rx_b.recv().await.unwrap();

        assert_eq!(reg.broadcast(&Notification::alert("maintenance")), 2);
    }

    #[tokio::test]
    async fn test_history_ring_is_bounded_and_newest_first() {
        let reg = ConnectionRegistry::new(NotifyConfig { history_limit: 3 });
        for i in 0..5 {
            reg.send_to_user(1, &Notification::info(&format!("n{i}")));
        }
        let recent = reg.recent_for_owner(1);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].payload["message"], "n4");
        assert_eq!(recent[2].payload["message"], "n2");
        // Unknown owner has no history.
        assert!(reg.recent_for_owner(99).is_empty());
    }

    #[tokio::test]
    async fn test_stats_counts_audiences() {
        let reg = registry();
        let (_a, _rx_a) = reg.open_channel(Some(1), vec!["analytics".to_string()]);
        let (_b, _rx_b) = reg.open_channel(Some(2), vec!["analytics".to_string()]);
        let stats = reg.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.owners, 2);
        assert_eq!(stats.rooms, 1);
    }
}
