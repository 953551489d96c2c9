use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc};
use uuid::Uuid;

use rodnya_types::events::ServerEvent;

/// A live socket bound to a logged-in username.
struct Registered {
    username: String,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

/// Manages all connected sockets: presence bookkeeping, broadcast fan-out
/// and targeted delivery.
///
/// Every socket is tracked independently, so a user with several open tabs
/// appears once in the presence list but a targeted message reaches only one
/// of their sockets.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Broadcast channel; all connected clients receive these events.
    broadcast_tx: broadcast::Sender<ServerEvent>,

    /// conn_id -> (username, targeted sender)
    connections: RwLock<HashMap<Uuid, Registered>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to broadcast events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to all connected clients.
    pub fn broadcast(&self, event: ServerEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Register a logged-in socket with the sender side of its targeted
    /// channel. Returns its connection id.
    pub async fn register(
        &self,
        username: &str,
        tx: mpsc::UnboundedSender<ServerEvent>,
    ) -> Uuid {
        let conn_id = Uuid::new_v4();
        self.inner.connections.write().await.insert(
            conn_id,
            Registered {
                username: username.to_string(),
                tx,
            },
        );
        conn_id
    }

    /// Remove a socket. Returns `(username, was_last)` where `was_last`
    /// means no other socket of the same user remains.
    pub async fn unregister(&self, conn_id: Uuid) -> Option<(String, bool)> {
        let mut connections = self.inner.connections.write().await;
        let removed = connections.remove(&conn_id)?;
        let was_last = !connections
            .values()
            .any(|c| c.username == removed.username);
        Some((removed.username, was_last))
    }

    /// Deliver an event to one socket of the named user, if any is live.
    pub async fn send_to_user(&self, username: &str, event: ServerEvent) -> bool {
        let connections = self.inner.connections.read().await;
        for conn in connections.values() {
            if conn.username == username {
                return conn.tx.send(event).is_ok();
            }
        }
        false
    }

    pub async fn is_online(&self, username: &str) -> bool {
        self.inner
            .connections
            .read()
            .await
            .values()
            .any(|c| c.username == username)
    }

    /// Sorted, deduplicated usernames with at least one live socket.
    pub async fn online_users(&self) -> Vec<String> {
        let connections = self.inner.connections.read().await;
        let set: BTreeSet<&str> = connections.values().map(|c| c.username.as_str()).collect();
        set.into_iter().map(String::from).collect()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping(username: &str) -> ServerEvent {
        ServerEvent::UserStatus {
            username: username.to_string(),
            online: true,
        }
    }

    async fn connect(d: &Dispatcher, username: &str) -> (uuid::Uuid, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = d.register(username, tx).await;
        (conn_id, rx)
    }

    #[tokio::test]
    async fn presence_list_dedupes_multi_tab_users() {
        let d = Dispatcher::new();
        let (_c1, _rx1) = connect(&d, "alice").await;
        let (_c2, _rx2) = connect(&d, "alice").await;
        let (_c3, _rx3) = connect(&d, "bob").await;

        assert_eq!(d.online_users().await, vec!["alice", "bob"]);
        assert!(d.is_online("alice").await);
        assert!(!d.is_online("carol").await);
    }

    #[tokio::test]
    async fn targeted_send_reaches_exactly_one_socket() {
        let d = Dispatcher::new();
        let (_c1, mut rx1) = connect(&d, "alice").await;
        let (_c2, mut rx2) = connect(&d, "alice").await;

        assert!(d.send_to_user("alice", ping("x")).await);

        let got_first = rx1.try_recv().is_ok();
        let got_second = rx2.try_recv().is_ok();
        assert!(got_first ^ got_second, "exactly one tab should receive it");

        assert!(!d.send_to_user("nobody", ping("x")).await);
    }

    #[tokio::test]
    async fn unregister_reports_last_socket() {
        let d = Dispatcher::new();
        let (c1, _rx1) = connect(&d, "alice").await;
        let (c2, _rx2) = connect(&d, "alice").await;

        assert_eq!(d.unregister(c1).await, Some(("alice".to_string(), false)));
        assert_eq!(d.unregister(c2).await, Some(("alice".to_string(), true)));
        assert_eq!(d.unregister(c2).await, None);
        assert!(d.online_users().await.is_empty());
    }

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers() {
        let d = Dispatcher::new();
        let mut rx_a = d.subscribe();
        let mut rx_b = d.subscribe();

        d.broadcast(ping("alice"));

        assert!(matches!(rx_a.recv().await, Ok(ServerEvent::UserStatus { .. })));
        assert!(matches!(rx_b.recv().await, Ok(ServerEvent::UserStatus { .. })));
    }
}
