// Registre des abonnements: clé -> ensemble de connexions.
// Le registre ne possède pas le cycle de vie des connexions; il ne garde que
// des handles indexés par `ConnectionId` pour la recherche et l'envoi.
use crate::error::HubError;
use crate::models::{CacheKey, Category};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// Trames en attente pour la tâche d'écriture d'une connexion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(Arc<str>),
    // Sonde de vivacité.
    Ping,
    Close,
}

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, sender: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id,
            sender,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    // Vrai dès que la session propriétaire a commencé sa fermeture.
    pub fn is_closing(&self) -> bool {
        !self.open.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn send(&self, frame: Outbound) -> Result<(), HubError> {
        if !self.is_open() {
            return Err(HubError::Transport(self.id));
        }
        self.sender
            .send(frame)
            .map_err(|_| HubError::Transport(self.id))
    }
}

#[derive(Default)]
struct Subscriptions {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    by_key: HashMap<CacheKey, HashSet<ConnectionId>>,
    by_connection: HashMap<ConnectionId, HashSet<CacheKey>>,
}

impl Subscriptions {
    fn detach(&mut self, key: &CacheKey, conn: ConnectionId) -> bool {
        let removed = match self.by_key.get_mut(key) {
            Some(set) => {
                let removed = set.remove(&conn);
                // Jamais d'ensemble vide: `active_keys` ne rend que du travail réel.
                if set.is_empty() {
                    self.by_key.remove(key);
                }
                removed
            }
            None => false,
        };
        if let Some(keys) = self.by_connection.get_mut(&conn) {
            keys.remove(key);
        }
        removed
    }
}

pub struct SubscriptionRegistry {
    inner: RwLock<Subscriptions>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Subscriptions::default()),
        }
    }

    // Rend une connexion adressable. Appelé à l'acceptation.
    pub async fn register(&self, handle: ConnectionHandle) {
        let mut inner = self.inner.write().await;
        inner.by_connection.entry(handle.id()).or_default();
        inner.connections.insert(handle.id(), handle);
    }

    // Idempotent. Retourne `true` si l'abonnement est nouveau.
    pub async fn subscribe(&self, key: CacheKey, conn: ConnectionId) -> Result<bool, HubError> {
        let mut inner = self.inner.write().await;
        match inner.connections.get(&conn) {
            Some(handle) if handle.is_open() => {}
            _ => return Err(HubError::Transport(conn)),
        }

        let added = inner.by_key.entry(key.clone()).or_default().insert(conn);
        inner.by_connection.entry(conn).or_default().insert(key.clone());
        if added {
            debug!(key = %key, conn = %conn, "Subscribed");
        }
        Ok(added)
    }

    pub async fn unsubscribe(&self, key: &CacheKey, conn: ConnectionId) -> bool {
        let removed = self.inner.write().await.detach(key, conn);
        if removed {
            debug!(key = %key, conn = %conn, "Unsubscribed");
        }
        removed
    }

    // Purge une connexion de tous les ensembles et oublie son handle.
    // Sans effet pour une connexion inconnue ou jamais abonnée.
    pub async fn unsubscribe_all(&self, conn: ConnectionId) -> usize {
        let mut inner = self.inner.write().await;
        inner.connections.remove(&conn);
        let keys = inner.by_connection.remove(&conn).unwrap_or_default();
        let mut removed = 0;
        for key in &keys {
            if inner.detach(key, conn) {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(conn = %conn, removed, "Dropped all subscriptions");
        }
        removed
    }

    // Copie des abonnés de `key`, prise sous le verrou en lecture.
    pub async fn subscribers_of(&self, key: &CacheKey) -> Vec<ConnectionHandle> {
        let inner = self.inner.read().await;
        inner
            .by_key
            .get(key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.connections.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    // Clés ayant au moins un abonné, éventuellement restreintes à une catégorie.
    pub async fn active_keys(&self, category: Option<Category>) -> Vec<CacheKey> {
        let inner = self.inner.read().await;
        let mut keys: Vec<CacheKey> = inner
            .by_key
            .keys()
            .filter(|key| category.map_or(true, |c| key.category == c))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub async fn is_subscribed(&self, key: &CacheKey, conn: ConnectionId) -> bool {
        self.inner
            .read()
            .await
            .by_key
            .get(key)
            .is_some_and(|ids| ids.contains(&conn))
    }

    pub async fn active_key_set(&self) -> HashSet<CacheKey> {
        self.inner.read().await.by_key.keys().cloned().collect()
    }

    pub async fn subscriptions_of(&self, conn: ConnectionId) -> Vec<CacheKey> {
        let inner = self.inner.read().await;
        let mut keys: Vec<CacheKey> = inner
            .by_connection
            .get(&conn)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(id: u64) -> (ConnectionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(ConnectionId(id), tx), rx)
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        let (handle, _rx) = connection(1);
        registry.register(handle).await;
        let key = CacheKey::new(Category::Match, "45678");

        assert!(registry.subscribe(key.clone(), ConnectionId(1)).await.unwrap());
        assert!(!registry.subscribe(key.clone(), ConnectionId(1)).await.unwrap());
        assert_eq!(registry.subscribers_of(&key).await.len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_all_prunes_keys() {
        let registry = SubscriptionRegistry::new();
        let (handle, _rx) = connection(1);
        registry.register(handle).await;
        let key = CacheKey::new(Category::Match, "45678");

        registry.subscribe(key.clone(), ConnectionId(1)).await.unwrap();
        assert_eq!(registry.unsubscribe_all(ConnectionId(1)).await, 1);

        assert!(registry.subscribers_of(&key).await.is_empty());
        assert!(registry.active_keys(None).await.is_empty());
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_all_for_unknown_connection_is_safe() {
        let registry = SubscriptionRegistry::new();
        let (handle, _rx) = connection(7);
        registry.register(handle).await;

        assert_eq!(registry.unsubscribe_all(ConnectionId(7)).await, 0);
        assert_eq!(registry.unsubscribe_all(ConnectionId(7)).await, 0);
        assert_eq!(registry.unsubscribe_all(ConnectionId(99)).await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_one_keeps_other_subscribers() {
        let registry = SubscriptionRegistry::new();
        let (a, _rx_a) = connection(1);
        let (b, _rx_b) = connection(2);
        registry.register(a).await;
        registry.register(b).await;
        let standings = CacheKey::new(Category::Standings, "2024");
        let list = CacheKey::list();

        registry.subscribe(standings.clone(), ConnectionId(1)).await.unwrap();
        registry.subscribe(standings.clone(), ConnectionId(2)).await.unwrap();
        registry.subscribe(list.clone(), ConnectionId(1)).await.unwrap();

        assert!(registry.unsubscribe(&standings, ConnectionId(1)).await);
        assert!(!registry.unsubscribe(&standings, ConnectionId(1)).await);

        let remaining: Vec<ConnectionId> = registry
            .subscribers_of(&standings)
            .await
            .iter()
            .map(ConnectionHandle::id)
            .collect();
        assert_eq!(remaining, vec![ConnectionId(2)]);
        assert!(registry.is_subscribed(&standings, ConnectionId(2)).await);
        assert!(!registry.is_subscribed(&standings, ConnectionId(1)).await);
        assert_eq!(registry.subscriptions_of(ConnectionId(1)).await, vec![list]);
    }

    #[tokio::test]
    async fn test_active_keys_by_category() {
        let registry = SubscriptionRegistry::new();
        let (handle, _rx) = connection(1);
        registry.register(handle).await;
        registry
            .subscribe(CacheKey::new(Category::Match, "1"), ConnectionId(1))
            .await
            .unwrap();
        registry
            .subscribe(CacheKey::new(Category::Match, "2"), ConnectionId(1))
            .await
            .unwrap();
        registry
            .subscribe(CacheKey::new(Category::Standings, "2024"), ConnectionId(1))
            .await
            .unwrap();

        let matches = registry.active_keys(Some(Category::Match)).await;
        assert_eq!(
            matches,
            vec![
                CacheKey::new(Category::Match, "1"),
                CacheKey::new(Category::Match, "2")
            ]
        );
        assert!(registry.active_keys(Some(Category::Commentary)).await.is_empty());
        assert_eq!(registry.active_keys(None).await.len(), 3);
    }

    #[tokio::test]
    async fn test_closed_connection_cannot_subscribe() {
        let registry = SubscriptionRegistry::new();
        let (handle, rx) = connection(3);
        registry.register(handle.clone()).await;
        drop(rx);

        assert!(!handle.is_open());
        assert!(matches!(
            registry
                .subscribe(CacheKey::new(Category::Match, "1"), ConnectionId(3))
                .await,
            Err(HubError::Transport(ConnectionId(3)))
        ));
        assert!(registry
            .subscribe(CacheKey::new(Category::Match, "1"), ConnectionId(4))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_handle_send_fails_after_close() {
        let (handle, mut rx) = connection(5);
        handle.send(Outbound::Ping).unwrap();
        assert_eq!(rx.recv().await, Some(Outbound::Ping));

        handle.mark_closed();
        assert!(handle.send(Outbound::Ping).is_err());
    }
}
