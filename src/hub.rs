// Le hub de synchronisation: un contexte explicite qui possède le cache, le
// coordinateur de fetch et le registre d'abonnements, et qui est passé à
// chaque composant qui en a besoin.
use crate::cache::{TtlCache, TtlPolicy};
use crate::config::HubConfig;
use crate::coordinator::{FetchCoordinator, FetchOutcome};
use crate::error::HubError;
use crate::fetcher::Fetcher;
use crate::models::{CacheKey, Category, Envelope, HubStats};
use crate::registry::{ConnectionHandle, ConnectionId, Outbound, SubscriptionRegistry};
use serde_json::Value;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub struct Hub {
    config: HubConfig,
    cache: Arc<TtlCache>,
    coordinator: FetchCoordinator,
    registry: SubscriptionRegistry,
    next_connection: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl Hub {
    pub fn new(config: HubConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        let cache = Arc::new(TtlCache::new(TtlPolicy::new(config.ttls.clone())));
        let coordinator = FetchCoordinator::new(cache.clone(), fetcher, config.fetch_timeout);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            cache,
            coordinator,
            registry: SubscriptionRegistry::new(),
            next_connection: AtomicU64::new(1),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn cache(&self) -> &TtlCache {
        &self.cache
    }

    pub fn coordinator(&self) -> &FetchCoordinator {
        &self.coordinator
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    // Alloue un handle pour une connexion tout juste acceptée.
    pub async fn connect(&self) -> (ConnectionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(id, tx);
        self.registry.register(handle.clone()).await;
        debug!(conn = %id, "Connection registered");
        (handle, rx)
    }

    // Enregistre l'abonnement puis pousse un instantané. Retourne `true` si
    // l'instantané a été livré; un échec du fetch initial laisse l'abonnement
    // en place et le prochain tick réessaie.
    pub async fn subscribe(&self, conn: &ConnectionHandle, key: CacheKey) -> Result<bool, HubError> {
        self.add_subscription(conn, key.clone()).await?;
        self.send_snapshot(conn, &key).await
    }

    // Registre seul, sans I/O amont.
    pub async fn add_subscription(
        &self,
        conn: &ConnectionHandle,
        key: CacheKey,
    ) -> Result<bool, HubError> {
        self.registry.subscribe(key, conn.id()).await
    }

    // Instantané initial d'un abonnement déjà enregistré. Rien n'est envoyé si
    // la connexion s'est désabonnée ou fermée pendant le fetch.
    pub async fn send_snapshot(
        &self,
        conn: &ConnectionHandle,
        key: &CacheKey,
    ) -> Result<bool, HubError> {
        match self.coordinator.resolve(key, false).await {
            Ok(record) => {
                if conn.is_closing() || !self.registry.is_subscribed(key, conn.id()).await {
                    debug!(key = %key, conn = %conn.id(), "Snapshot no longer wanted");
                    return Ok(false);
                }
                let text = envelope_text(key.category, &record);
                conn.send(Outbound::Text(text))?;
                Ok(true)
            }
            Err(failure) => {
                warn!(key = %key, conn = %conn.id(), reason = %failure, "Initial snapshot unavailable");
                Ok(false)
            }
        }
    }

    pub async fn unsubscribe(&self, conn: &ConnectionHandle, key: &CacheKey) -> bool {
        self.registry.unsubscribe(key, conn.id()).await
    }

    // Marque la connexion fermée et la purge de tous les ensembles d'abonnés.
    pub async fn disconnect(&self, conn: &ConnectionHandle) -> usize {
        conn.mark_closed();
        self.registry.unsubscribe_all(conn.id()).await
    }

    // Lecture à la demande, hors du mécanisme d'abonnement.
    pub async fn query(&self, category: Category, id: &str, force_fresh: bool) -> FetchOutcome {
        let key = match category {
            Category::List => CacheKey::list(),
            _ => CacheKey::new(category, id),
        };
        self.coordinator.resolve(&key, force_fresh).await
    }

    // Envoie `record` à chaque abonné ouvert de `key`. Retourne le nombre de
    // connexions servies.
    pub async fn publish(&self, key: &CacheKey, record: &Value) -> usize {
        let subscribers = self.registry.subscribers_of(key).await;
        if subscribers.is_empty() {
            return 0;
        }

        let text = envelope_text(key.category, record);
        let mut delivered = 0;
        for conn in subscribers {
            // La vivacité a pu évincer la connexion depuis la copie des abonnés.
            if conn.is_closing() {
                debug!(key = %key, conn = %conn.id(), "Skipping closed connection");
                continue;
            }
            match conn.send(Outbound::Text(text.clone())) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    // La purge revient à la session, qui sort au prochain battement.
                    warn!(key = %key, error = %e, "Marking broken connection closed");
                    conn.mark_closed();
                }
            }
        }
        delivered
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    // Demande à chaque session de se fermer; chacune purge ses propres abonnements.
    pub fn begin_shutdown(&self) {
        info!("Hub shutting down");
        self.shutdown_tx.send_replace(true);
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            cached_entries: self.cache.len().await,
            in_flight: self.coordinator.in_flight_count(),
            connections: self.registry.connection_count().await,
            active_keys: self
                .registry
                .active_keys(None)
                .await
                .iter()
                .map(CacheKey::to_string)
                .collect(),
        }
    }
}

fn envelope_text(category: Category, record: &Value) -> Arc<str> {
    // Sérialiser une `Value` ne peut pas échouer: les clés sont des chaînes.
    let text = serde_json::to_string(&Envelope::update(category, record))
        .unwrap_or_else(|_| format!(r#"{{"type":"{}","data":null}}"#, category.update_type()));
    Arc::from(text)
}

// Attend l'arrêt demandé. Le `Ref` de `wait_for` est relâché ici, ce qui garde
// `Send` les boucles `select!` qui l'utilisent.
pub async fn stop_requested(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|stop| *stop).await;
}


#[cfg(test)]
mod tests {
    use super::testing::{drain, hub_with, text};
    use super::*;
    use crate::fetcher::stub::StubFetcher;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribe_sends_one_snapshot() {
        let fetcher = Arc::new(StubFetcher::new());
        let key = CacheKey::new(Category::Match, "45678");
        fetcher.respond(&key, json!({"id": "45678"}));
        let hub = hub_with(fetcher.clone());
        let (conn, mut rx) = hub.connect().await;

        assert!(hub.subscribe(&conn, key.clone()).await.unwrap());

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(text(&frames[0]), json!({"type": "match_update", "data": {"id": "45678"}}));
        assert_eq!(hub.registry().active_keys(None).await, vec![key]);
    }

    #[tokio::test]
    async fn test_failed_seed_keeps_subscription() {
        let fetcher = Arc::new(StubFetcher::new());
        let key = CacheKey::new(Category::Commentary, "9");
        fetcher.fail(&key, "upstream down");
        let hub = hub_with(fetcher);
        let (conn, mut rx) = hub.connect().await;

        assert!(!hub.subscribe(&conn, key.clone()).await.unwrap());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(hub.registry().subscribers_of(&key).await.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_then_disconnect_leaves_nothing_behind() {
        let fetcher = Arc::new(StubFetcher::new());
        let key = CacheKey::new(Category::Match, "1");
        fetcher.respond(&key, json!({}));
        let hub = hub_with(fetcher);
        let (conn, _rx) = hub.connect().await;

        hub.subscribe(&conn, key.clone()).await.unwrap();
        assert_eq!(hub.disconnect(&conn).await, 1);

        assert!(hub.registry().subscribers_of(&key).await.is_empty());
        assert!(hub.registry().active_keys(None).await.is_empty());
        assert!(hub.subscribe(&conn, key).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_marks_broken_connection_closed() {
        let fetcher = Arc::new(StubFetcher::new());
        let key = CacheKey::new(Category::Match, "1");
        fetcher.respond(&key, json!({"v": 1}));
        let hub = hub_with(fetcher);
        let (alive, mut alive_rx) = hub.connect().await;
        let (broken, broken_rx) = hub.connect().await;
        hub.subscribe(&alive, key.clone()).await.unwrap();
        hub.subscribe(&broken, key.clone()).await.unwrap();
        drain(&mut alive_rx);
        drop(broken_rx);

        assert_eq!(hub.publish(&key, &json!({"v": 2})).await, 1);
        assert_eq!(text(&drain(&mut alive_rx)[0])["data"], json!({"v": 2}));

        // Marquée, pas purgée: la session fera l'unique `disconnect`.
        assert!(broken.is_closing());
        assert_eq!(hub.registry().subscribers_of(&key).await.len(), 2);
        assert_eq!(hub.registry().connection_count().await, 2);

        assert_eq!(hub.publish(&key, &json!({"v": 3})).await, 1);
        assert_eq!(hub.disconnect(&broken).await, 1);
        let remaining: Vec<ConnectionId> = hub
            .registry()
            .subscribers_of(&key)
            .await
            .iter()
            .map(ConnectionHandle::id)
            .collect();
        assert_eq!(remaining, vec![alive.id()]);
    }

    #[tokio::test]
    async fn test_snapshot_skipped_after_unsubscribe() {
        let fetcher = Arc::new(StubFetcher::new());
        let key = CacheKey::new(Category::Highlights, "7");
        fetcher.respond(&key, json!([{"title": "Six"}]));
        let hub = hub_with(fetcher);
        let (conn, mut rx) = hub.connect().await;

        assert!(hub.add_subscription(&conn, key.clone()).await.unwrap());
        assert!(hub.unsubscribe(&conn, &key).await);

        assert!(!hub.send_snapshot(&conn, &key).await.unwrap());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_query_passes_through_coordinator() {
        let fetcher = Arc::new(StubFetcher::new());
        fetcher.respond(&CacheKey::list(), json!([{"matchId": "1"}]));
        let hub = hub_with(fetcher.clone());

        let list = hub.query(Category::List, "ignored", false).await.unwrap();
        assert_eq!(*list, json!([{"matchId": "1"}]));
        hub.query(Category::List, "", false).await.unwrap();
        assert_eq!(fetcher.calls(), 1);

        hub.query(Category::List, "", true).await.unwrap();
        assert_eq!(fetcher.calls(), 2);

        let missing = hub.query(Category::Player, "404", false).await;
        assert!(missing.is_err());
    }
}
