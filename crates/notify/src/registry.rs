//! Subscription registry — in-memory index of currently-connected subscribers.
//!
//! Process-wide state with an explicit lifecycle: constructed once at service
//! start, carried in the shared app state, and `drain`ed at shutdown so every
//! live stream terminates. Nothing here is persisted; a reconnecting client
//! gets a fresh connection id and recovers missed notifications from the
//! durable backlog.
//!
//! Sharded `DashMap`s keep register/unregister/lookup contention per-key
//! rather than behind one global lock. A connection id is only ever
//! registered and unregistered by its own stream task, so the primary map and
//! the two indices stay consistent for that id; readers racing an unregister
//! may briefly see an index entry whose primary entry is already gone, and
//! `send_to` treats that as a closed connection.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use crewflow_common::types::{Envelope, Role};

/// One live connection's registry entry: the identity snapshot taken at
/// connect time and the producer side of its outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub user_id: Uuid,
    pub roles: Vec<Role>,
    pub established_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    sender: broadcast::Sender<Envelope>,
}

/// In-memory index of live connections, keyed by connection id and
/// cross-indexed by user id and role membership.
pub struct SubscriptionRegistry {
    queue_capacity: usize,
    connections: DashMap<Uuid, ConnectionEntry>,
    by_user: DashMap<Uuid, HashSet<Uuid>>,
    by_role: DashMap<Role, HashSet<Uuid>>,
}

impl SubscriptionRegistry {
    /// `queue_capacity` bounds each connection's outbound queue; when the
    /// queue is full the oldest envelope is dropped (ring semantics) and the
    /// drain side observes the lag.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            connections: DashMap::new(),
            by_user: DashMap::new(),
            by_role: DashMap::new(),
        }
    }

    /// Add a connection under the given identity snapshot and return the
    /// consumer side of its outbound queue.
    pub fn register(
        &self,
        connection_id: Uuid,
        user_id: Uuid,
        roles: &[Role],
    ) -> broadcast::Receiver<Envelope> {
        let (sender, receiver) = broadcast::channel(self.queue_capacity);
        let now = Utc::now();

        self.connections.insert(
            connection_id,
            ConnectionEntry {
                user_id,
                roles: roles.to_vec(),
                established_at: now,
                last_activity_at: now,
                sender,
            },
        );
        self.by_user.entry(user_id).or_default().insert(connection_id);
        for role in roles {
            self.by_role.entry(*role).or_default().insert(connection_id);
        }

        tracing::debug!(
            connection_id = %connection_id,
            user_id = %user_id,
            ?roles,
            "Connection registered"
        );

        receiver
    }

    /// Remove a connection from the primary map and both indices. No-op if
    /// the connection was already removed.
    pub fn unregister(&self, connection_id: Uuid) {
        let Some((_, entry)) = self.connections.remove(&connection_id) else {
            return;
        };

        if let Some(mut conns) = self.by_user.get_mut(&entry.user_id) {
            conns.remove(&connection_id);
            let empty = conns.is_empty();
            drop(conns);
            if empty {
                self.by_user.remove_if(&entry.user_id, |_, v| v.is_empty());
            }
        }
        for role in &entry.roles {
            if let Some(mut conns) = self.by_role.get_mut(role) {
                conns.remove(&connection_id);
                let empty = conns.is_empty();
                drop(conns);
                if empty {
                    self.by_role.remove_if(role, |_, v| v.is_empty());
                }
            }
        }

        tracing::debug!(
            connection_id = %connection_id,
            user_id = %entry.user_id,
            "Connection unregistered"
        );
    }

    /// All connection ids held by a user.
    pub fn lookup_by_user(&self, user_id: Uuid) -> HashSet<Uuid> {
        self.by_user
            .get(&user_id)
            .map(|conns| conns.clone())
            .unwrap_or_default()
    }

    /// All connection ids held by any user with the role.
    pub fn lookup_by_role(&self, role: Role) -> HashSet<Uuid> {
        self.by_role
            .get(&role)
            .map(|conns| conns.clone())
            .unwrap_or_default()
    }

    /// Enqueue an envelope on one connection's outbound queue. Returns false
    /// if the connection is gone or its consumer has stopped receiving.
    pub fn send_to(&self, connection_id: Uuid, envelope: Envelope) -> bool {
        match self.connections.get(&connection_id) {
            Some(entry) => entry.sender.send(envelope).is_ok(),
            None => false,
        }
    }

    /// Refresh a connection's activity timestamp.
    pub fn touch(&self, connection_id: Uuid) {
        if let Some(mut entry) = self.connections.get_mut(&connection_id) {
            entry.last_activity_at = Utc::now();
        }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Drop every entry, closing all outbound queues. Each live stream then
    /// ends and its own teardown runs `unregister` (a no-op by that point).
    /// Called once at shutdown.
    pub fn drain(&self) {
        let drained = self.connections.len();
        self.connections.clear();
        self.by_user.clear();
        self.by_role.clear();
        if drained > 0 {
            tracing::info!(connections = drained, "Subscription registry drained");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crewflow_common::types::NotificationKind;

    fn envelope(message: &str) -> Envelope {
        Envelope {
            id: Uuid::new_v4(),
            kind: NotificationKind::TaskAssigned,
            message: message.to_string(),
            payload: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_register_indexes_user_and_roles() {
        let registry = SubscriptionRegistry::new(16);
        let user_id = Uuid::new_v4();
        let connection_id = Uuid::new_v4();

        let _rx = registry.register(connection_id, user_id, &[Role::Employee, Role::Supervisor]);

        assert!(registry.lookup_by_user(user_id).contains(&connection_id));
        assert!(registry.lookup_by_role(Role::Employee).contains(&connection_id));
        assert!(registry.lookup_by_role(Role::Supervisor).contains(&connection_id));
        assert!(registry.lookup_by_role(Role::Admin).is_empty());
        assert_eq!(registry.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_unregister_leaves_no_residual_entries() {
        let registry = SubscriptionRegistry::new(16);
        let user_id = Uuid::new_v4();
        let connection_id = Uuid::new_v4();

        let _rx = registry.register(connection_id, user_id, &[Role::Employee]);
        registry.unregister(connection_id);

        assert!(registry.lookup_by_user(user_id).is_empty());
        assert!(registry.lookup_by_role(Role::Employee).is_empty());
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_unregister_twice_is_noop() {
        let registry = SubscriptionRegistry::new(16);
        let connection_id = Uuid::new_v4();

        let _rx = registry.register(connection_id, Uuid::new_v4(), &[Role::Admin]);
        registry.unregister(connection_id);
        registry.unregister(connection_id);

        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_multiple_connections_same_user() {
        let registry = SubscriptionRegistry::new(16);
        let user_id = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        let _rx1 = registry.register(first, user_id, &[Role::Employee]);
        let _rx2 = registry.register(second, user_id, &[Role::Employee]);

        let conns = registry.lookup_by_user(user_id);
        assert_eq!(conns.len(), 2);
        assert!(conns.contains(&first));
        assert!(conns.contains(&second));

        registry.unregister(first);
        let conns = registry.lookup_by_user(user_id);
        assert_eq!(conns.len(), 1);
        assert!(conns.contains(&second));
    }

    #[tokio::test]
    async fn test_send_to_delivers() {
        let registry = SubscriptionRegistry::new(16);
        let connection_id = Uuid::new_v4();
        let mut rx = registry.register(connection_id, Uuid::new_v4(), &[Role::Employee]);

        let sent = envelope("hello");
        assert!(registry.send_to(connection_id, sent.clone()));

        let received = rx.recv().await.unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_send_to_unknown_connection() {
        let registry = SubscriptionRegistry::new(16);
        assert!(!registry.send_to(Uuid::new_v4(), envelope("nobody home")));
    }

    #[tokio::test]
    async fn test_send_to_after_receiver_dropped() {
        let registry = SubscriptionRegistry::new(16);
        let connection_id = Uuid::new_v4();
        let rx = registry.register(connection_id, Uuid::new_v4(), &[Role::Employee]);
        drop(rx);

        assert!(!registry.send_to(connection_id, envelope("gone")));
    }

    #[tokio::test]
    async fn test_drain_clears_everything() {
        let registry = SubscriptionRegistry::new(16);
        let user_id = Uuid::new_v4();
        for _ in 0..3 {
            let _rx = registry.register(Uuid::new_v4(), user_id, &[Role::Supervisor]);
        }
        assert_eq!(registry.connection_count(), 3);

        registry.drain();

        assert_eq!(registry.connection_count(), 0);
        assert!(registry.lookup_by_user(user_id).is_empty());
        assert!(registry.lookup_by_role(Role::Supervisor).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_register_unregister() {
        let registry = std::sync::Arc::new(SubscriptionRegistry::new(16));
        let mut handles = Vec::new();

        for _ in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let connection_id = Uuid::new_v4();
                let _rx = registry.register(connection_id, Uuid::new_v4(), &[Role::Employee]);
                registry.unregister(connection_id);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.connection_count(), 0);
        assert!(registry.lookup_by_role(Role::Employee).is_empty());
    }
}
