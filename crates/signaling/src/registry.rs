use serde::Serialize;
use shared::{ConnectionId, ServerEvent};
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// Queue drained by a connection's WebSocket writer task.
pub type Outbound = mpsc::UnboundedSender<ServerEvent>;

#[derive(Debug)]
struct ConnectionRecord {
    identity: Option<String>,
    rooms: HashSet<String>,
    outbound: Outbound,
}

#[derive(Debug, Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, ConnectionRecord>,
    /// Inverse of `ConnectionRecord::identity`.
    identities: HashMap<String, ConnectionId>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub connections: usize,
    pub identities: usize,
    pub rooms: usize,
}

/// Outcome of [`ConnectionRegistry::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// `superseded` is the connection that held the identity before, if any.
    Joined { superseded: Option<ConnectionId> },
    /// The connection is not live; nothing changed.
    NotLive,
}

/// Live connections, their declared identities and room membership.
///
/// Every mutation happens under a single write lock, so the identity tables
/// are mutual inverses whenever the lock is released.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport-level connect. The connection has no identity until it joins.
    pub async fn connect(&self, connection_id: ConnectionId, outbound: Outbound) {
        let record = ConnectionRecord {
            identity: None,
            rooms: HashSet::new(),
            outbound,
        };
        self.state.write().await.connections.insert(connection_id, record);
    }

    /// Binds `identity` to the connection and adds it to `room`.
    ///
    /// Last join wins: a previous connection holding the same identity loses
    /// the binding but keeps its room membership; it is reported in the
    /// outcome.
    pub async fn join(
        &self,
        identity: &str,
        connection_id: ConnectionId,
        room: &str,
    ) -> JoinOutcome {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let Some(record) = state.connections.get_mut(&connection_id) else {
            warn!(%connection_id, "join from connection that is not live");
            return JoinOutcome::NotLive;
        };

        // A connection re-joining under a new name releases the old one.
        if let Some(previous) = record.identity.take() {
            if state.identities.get(&previous) == Some(&connection_id) {
                state.identities.remove(&previous);
            }
        }
        record.identity = Some(identity.to_string());
        record.rooms.insert(room.to_string());

        let superseded = state
            .identities
            .insert(identity.to_string(), connection_id)
            .filter(|stale| *stale != connection_id);
        if let Some(stale) = superseded {
            if let Some(stale_record) = state.connections.get_mut(&stale) {
                stale_record.identity = None;
            }
            debug!(%identity, %stale, %connection_id, "identity rebound to newer connection");
        }

        state
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection_id);

        JoinOutcome::Joined { superseded }
    }

    pub async fn resolve_identity(&self, connection_id: ConnectionId) -> Option<String> {
        self.state
            .read()
            .await
            .connections
            .get(&connection_id)
            .and_then(|record| record.identity.clone())
    }

    pub async fn resolve_connection(&self, identity: &str) -> Option<ConnectionId> {
        self.state.read().await.identities.get(identity).copied()
    }

    /// Outbound queue of a live connection.
    pub async fn outbound(&self, connection_id: ConnectionId) -> Option<Outbound> {
        self.state
            .read()
            .await
            .connections
            .get(&connection_id)
            .map(|record| record.outbound.clone())
    }

    /// Every current member of `room` other than `except`.
    pub async fn room_peers(
        &self,
        room: &str,
        except: ConnectionId,
    ) -> Vec<(ConnectionId, Outbound)> {
        let state = self.state.read().await;
        let Some(members) = state.rooms.get(room) else {
            return Vec::new();
        };
        members
            .iter()
            .filter(|member| **member != except)
            .filter_map(|member| {
                state
                    .connections
                    .get(member)
                    .map(|record| (*member, record.outbound.clone()))
            })
            .collect()
    }

    /// Transport-level disconnect. Returns the identity that was bound, if any.
    pub async fn remove(&self, connection_id: ConnectionId) -> Option<String> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let record = state.connections.remove(&connection_id)?;

        if let Some(identity) = &record.identity {
            if state.identities.get(identity) == Some(&connection_id) {
                state.identities.remove(identity);
            }
        }

        for room in &record.rooms {
            if let Some(members) = state.rooms.get_mut(room) {
                members.remove(&connection_id);
                if members.is_empty() {
                    state.rooms.remove(room);
                    debug!(%room, "room emptied");
                }
            }
        }

        record.identity
    }

    pub async fn stats(&self) -> RegistryStats {
        let state = self.state.read().await;
        RegistryStats {
            connections: state.connections.len(),
            identities: state.identities.len(),
            rooms: state.rooms.len(),
        }
    }

    #[cfg(test)]
    async fn assert_consistent(&self) {
        let state = self.state.read().await;
        for (identity, connection_id) in &state.identities {
            let record = state
                .connections
                .get(connection_id)
                .expect("identity points at a live connection");
            assert_eq!(record.identity.as_deref(), Some(identity.as_str()));
        }
        for (connection_id, record) in &state.connections {
            if let Some(identity) = &record.identity {
                assert_eq!(state.identities.get(identity), Some(connection_id));
            }
            for room in &record.rooms {
                assert!(state.rooms.get(room).is_some_and(|m| m.contains(connection_id)));
            }
        }
        for (room, members) in &state.rooms {
            assert!(!members.is_empty(), "empty room {room} left behind");
            for member in members {
                assert!(state.connections.get(member).is_some_and(|r| r.rooms.contains(room)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn connected(registry: &ConnectionRegistry) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.connect(id, tx).await;
        (id, rx)
    }

    #[tokio::test]
    async fn test_join_binds_both_directions() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = connected(&registry).await;

        assert_eq!(registry.resolve_identity(a).await, None);
        assert_eq!(
            registry.join("a@x.com", a, "42").await,
            JoinOutcome::Joined { superseded: None }
        );

        assert_eq!(registry.resolve_identity(a).await.as_deref(), Some("a@x.com"));
        assert_eq!(registry.resolve_connection("a@x.com").await, Some(a));
        registry.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_last_join_wins() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = connected(&registry).await;
        let (second, _rx2) = connected(&registry).await;

        registry.join("a@x.com", first, "42").await;
        let superseded = registry.join("a@x.com", second, "42").await;

        assert_eq!(superseded, JoinOutcome::Joined { superseded: Some(first) });
        assert_eq!(registry.resolve_connection("a@x.com").await, Some(second));
        assert_eq!(registry.resolve_identity(first).await, None);
        // The stale connection is still a room member.
        let peers: Vec<_> = registry.room_peers("42", second).await.into_iter().map(|(id, _)| id).collect();
        assert_eq!(peers, vec![first]);
        registry.assert_consistent().await;

        // Disconnecting the stale connection must not unbind the newer one.
        assert_eq!(registry.remove(first).await, None);
        assert_eq!(registry.resolve_connection("a@x.com").await, Some(second));
        registry.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_rejoin_same_connection_new_identity() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = connected(&registry).await;

        registry.join("old@x.com", a, "1").await;
        assert_eq!(
            registry.join("new@x.com", a, "2").await,
            JoinOutcome::Joined { superseded: None }
        );

        assert_eq!(registry.resolve_connection("old@x.com").await, None);
        assert_eq!(registry.resolve_connection("new@x.com").await, Some(a));
        registry.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_remove_unknown_connection_is_noop() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = connected(&registry).await;

        // Never joined.
        assert_eq!(registry.remove(a).await, None);
        assert_eq!(registry.remove(a).await, None);
        assert_eq!(registry.remove(Uuid::new_v4()).await, None);
        assert_eq!(
            registry.stats().await,
            RegistryStats { connections: 0, identities: 0, rooms: 0 }
        );
    }

    #[tokio::test]
    async fn test_room_vanishes_when_empty() {
        let registry = ConnectionRegistry::new();
        let (a, _rxa) = connected(&registry).await;
        let (b, _rxb) = connected(&registry).await;

        registry.join("a@x.com", a, "42").await;
        registry.join("b@x.com", b, "42").await;
        assert_eq!(registry.stats().await.rooms, 1);

        assert_eq!(registry.remove(a).await.as_deref(), Some("a@x.com"));
        assert_eq!(registry.stats().await.rooms, 1);
        registry.remove(b).await;
        assert_eq!(registry.stats().await.rooms, 0);
        assert!(registry.room_peers("42", a).await.is_empty());
    }

    #[tokio::test]
    async fn test_join_requires_live_connection() {
        let registry = ConnectionRegistry::new();
        let ghost = Uuid::new_v4();
        assert_eq!(registry.join("ghost@x.com", ghost, "42").await, JoinOutcome::NotLive);
        assert_eq!(registry.resolve_connection("ghost@x.com").await, None);
        assert!(registry.room_peers("42", Uuid::new_v4()).await.is_empty());
        registry.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_tables_stay_inverse_under_mixed_operations() {
        let registry = ConnectionRegistry::new();
        let identities = ["a@x.com", "b@x.com", "c@x.com"];
        let rooms = ["1", "2"];
        let mut live: Vec<(ConnectionId, mpsc::UnboundedReceiver<ServerEvent>)> = Vec::new();

        // Deterministic LCG so failures reproduce.
        let mut seed: u64 = 0x5eed;
        let mut next = |bound: usize| {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((seed >> 33) as usize) % bound
        };

        for _ in 0..500 {
            match next(4) {
                0 => live.push(connected(&registry).await),
                1 | 2 if !live.is_empty() => {
                    let (id, _) = &live[next(live.len())];
                    registry
                        .join(identities[next(identities.len())], *id, rooms[next(rooms.len())])
                        .await;
                }
                3 if !live.is_empty() => {
                    let (id, _) = live.swap_remove(next(live.len()));
                    registry.remove(id).await;
                }
                _ => {}
            }
            registry.assert_consistent().await;
        }
    }

    #[tokio::test]
    async fn test_concurrent_disconnects_keep_tables_consistent() {
        let registry = std::sync::Arc::new(ConnectionRegistry::new());
        let mut ids = Vec::new();
        let mut receivers = Vec::new();
        for n in 0..32 {
            let (id, rx) = connected(&registry).await;
            registry.join(&format!("user{}@x.com", n % 8), id, "42").await;
            ids.push(id);
            receivers.push(rx);
        }

        let tasks: Vec<_> = ids
            .iter()
            .copied()
            .map(|id| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.remove(id).await })
            })
            .collect();
        for task in tasks {
            task.await.expect("remove task");
        }

        registry.assert_consistent().await;
        assert_eq!(
            registry.stats().await,
            RegistryStats { connections: 0, identities: 0, rooms: 0 }
        );
    }
}
