use crate::cache::TtlCache;
use crate::error::FetchFailure;
use crate::fetcher::Fetcher;
use crate::models::CacheKey;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{debug, warn};

pub type FetchOutcome = Result<Arc<Value>, FetchFailure>;

// Chaque fetch en cours publie son résultat unique sur un canal `watch`;
// tous les appelants concurrents pour la même clé attendent ce même canal.
type Pending = watch::Receiver<Option<FetchOutcome>>;
type InFlightTable = Arc<Mutex<HashMap<CacheKey, Pending>>>;

// Sert les lectures depuis le cache et garantit au plus un fetch externe
// en cours par clé.
pub struct FetchCoordinator {
    cache: Arc<TtlCache>,
    fetcher: Arc<dyn Fetcher>,
    in_flight: InFlightTable,
    timeout: Duration,
}

impl FetchCoordinator {
    pub fn new(cache: Arc<TtlCache>, fetcher: Arc<dyn Fetcher>, timeout: Duration) -> Self {
        Self {
            cache,
            fetcher,
            in_flight: Arc::new(Mutex::new(HashMap::with_capacity(64))),
            timeout,
        }
    }

    // Sans `force_fresh`, une entrée fraîche est servie sans I/O. Sinon on se
    // greffe sur le fetch déjà en cours, ou on en démarre un. Les échecs ne
    // sont jamais mis en cache et ne sont pas réessayés ici.
    pub async fn resolve(&self, key: &CacheKey, force_fresh: bool) -> FetchOutcome {
        if !force_fresh {
            if let Some((entry, true)) = self.cache.get(key).await {
                return Ok(entry.record);
            }
        }

        let mut pending = {
            let mut table = lock(&self.in_flight);
            match table.get(key) {
                Some(rx) => {
                    debug!(key = %key, "Joining in-flight fetch");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    table.insert(key.clone(), rx.clone());
                    self.spawn_fetch(key.clone(), tx);
                    rx
                }
            }
        };

        // Le `Ref` emprunte `pending`: il doit être relâché avant la fin de la fonction.
        let outcome = match pending.wait_for(Option::is_some).await {
            Ok(settled) => (*settled)
                .clone()
                .unwrap_or_else(|| Err(FetchFailure::new("fetch settled without a result"))),
            // L'expéditeur a disparu sans publier: la tâche de fetch a paniqué.
            Err(_) => Err(FetchFailure::new(format!("fetch task for {} was aborted", key))),
        };
        outcome
    }

    // Le fetch tourne dans sa propre tâche: si tous les appelants abandonnent,
    // il termine quand même et son résultat reste en cache.
    fn spawn_fetch(&self, key: CacheKey, tx: watch::Sender<Option<FetchOutcome>>) {
        let cache = self.cache.clone();
        let fetcher = self.fetcher.clone();
        let limit = self.timeout;
        let guard = InFlightGuard {
            table: self.in_flight.clone(),
            key: key.clone(),
        };

        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let outcome = match tokio::time::timeout(limit, fetcher.fetch(key.category, &key.id)).await
            {
                Ok(Ok(record)) => {
                    let record = Arc::new(record);
                    cache.put(key.clone(), record.clone()).await;
                    Ok(record)
                }
                Ok(Err(failure)) => Err(failure),
                Err(_) => Err(FetchFailure::timeout(limit)),
            };

            match &outcome {
                Ok(_) => debug!(key = %key, elapsed = ?started.elapsed(), "Fetch settled"),
                Err(failure) => warn!(key = %key, reason = %failure, "Fetch failed"),
            }

            // Retire l'entrée avant de notifier; les attendants détiennent déjà leur récepteur.
            drop(guard);
            tx.send_replace(Some(outcome));
        });
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }
}

// Retire l'entrée en cours à la fin du fetch, y compris si la tâche panique.
struct InFlightGuard {
    table: InFlightTable,
    key: CacheKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.table).remove(&self.key);
    }
}

fn lock(table: &InFlightTable) -> MutexGuard<'_, HashMap<CacheKey, Pending>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlPolicy;
    use crate::fetcher::stub::StubFetcher;
    use crate::models::Category;
    use futures_util::future::join_all;
    use serde_json::json;

    fn setup(fetcher: Arc<StubFetcher>, timeout: Duration) -> (Arc<TtlCache>, FetchCoordinator) {
        let ttls = HashMap::from([
            (Category::Match, Duration::from_secs(10)),
            (Category::Standings, Duration::from_secs(3600)),
        ]);
        let cache = Arc::new(TtlCache::new(TtlPolicy::new(ttls)));
        let coordinator = FetchCoordinator::new(cache.clone(), fetcher, timeout);
        (cache, coordinator)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_resolves_trigger_one_fetch() {
        let fetcher = Arc::new(StubFetcher::with_delay(Duration::from_millis(500)));
        let key = CacheKey::new(Category::Match, "45678");
        fetcher.respond(&key, json!({"id": "45678", "status": "Live"}));
        let (_, coordinator) = setup(fetcher.clone(), Duration::from_secs(5));

        let results = join_all((0..32).map(|_| coordinator.resolve(&key, false))).await;

        assert_eq!(fetcher.calls(), 1);
        for result in results {
            assert_eq!(*result.unwrap(), json!({"id": "45678", "status": "Live"}));
        }
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_share_one_failure() {
        let fetcher = Arc::new(StubFetcher::with_delay(Duration::from_millis(200)));
        let key = CacheKey::new(Category::Match, "down");
        fetcher.fail(&key, "upstream unreachable");
        let (_, coordinator) = setup(fetcher.clone(), Duration::from_secs(5));

        let results = join_all((0..8).map(|_| coordinator.resolve(&key, false))).await;

        assert_eq!(fetcher.calls(), 1);
        for result in results {
            assert_eq!(result.unwrap_err().reason, "upstream unreachable");
        }
    }

    #[tokio::test]
    async fn test_failure_is_never_cached() {
        let fetcher = Arc::new(StubFetcher::new());
        let key = CacheKey::new(Category::Match, "1");
        fetcher.fail(&key, "bad page");
        let (cache, coordinator) = setup(fetcher.clone(), Duration::from_secs(5));

        assert!(coordinator.resolve(&key, false).await.is_err());
        assert!(cache.get(&key).await.is_none());
        assert!(coordinator.resolve(&key, false).await.is_err());
        assert_eq!(fetcher.calls(), 2);

        fetcher.respond(&key, json!({"ok": true}));
        assert_eq!(*coordinator.resolve(&key, false).await.unwrap(), json!({"ok": true}));
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_entry_served_without_io_until_ttl() {
        let fetcher = Arc::new(StubFetcher::new());
        let key = CacheKey::new(Category::Match, "2");
        fetcher.respond(&key, json!({"v": 1}));
        let (_, coordinator) = setup(fetcher.clone(), Duration::from_secs(5));

        coordinator.resolve(&key, false).await.unwrap();
        coordinator.resolve(&key, false).await.unwrap();
        assert_eq!(fetcher.calls(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        coordinator.resolve(&key, false).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_force_fresh_bypasses_ttl() {
        let fetcher = Arc::new(StubFetcher::new());
        let key = CacheKey::new(Category::Standings, "2024");
        fetcher.respond(&key, json!([{"team": "A"}]));
        let (_, coordinator) = setup(fetcher.clone(), Duration::from_secs(5));

        coordinator.resolve(&key, false).await.unwrap();
        fetcher.respond(&key, json!([{"team": "B"}]));
        let refreshed = coordinator.resolve(&key, true).await.unwrap();

        assert_eq!(fetcher.calls(), 2);
        assert_eq!(*refreshed, json!([{"team": "B"}]));
        assert_eq!(*coordinator.resolve(&key, false).await.unwrap(), json!([{"team": "B"}]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_and_ttl_reads_share_in_flight_fetch() {
        let fetcher = Arc::new(StubFetcher::with_delay(Duration::from_secs(1)));
        let key = CacheKey::new(Category::Match, "3");
        fetcher.respond(&key, json!({}));
        let (_, coordinator) = setup(fetcher.clone(), Duration::from_secs(5));

        let (forced, lazy) = tokio::join!(
            coordinator.resolve(&key, true),
            coordinator.resolve(&key, false)
        );

        assert!(forced.is_ok() && lazy.is_ok());
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_fetch_times_out() {
        let fetcher = Arc::new(StubFetcher::with_delay(Duration::from_secs(30)));
        let key = CacheKey::new(Category::Match, "slow");
        fetcher.respond(&key, json!({}));
        let (cache, coordinator) = setup(fetcher.clone(), Duration::from_secs(2));

        let failure = coordinator.resolve(&key, false).await.unwrap_err();

        assert!(failure.reason.contains("timed out"));
        assert!(cache.get(&key).await.is_none());
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_completes_after_caller_gives_up() {
        let fetcher = Arc::new(StubFetcher::with_delay(Duration::from_secs(1)));
        let key = CacheKey::new(Category::Match, "orphan");
        fetcher.respond(&key, json!({"late": true}));
        let (cache, coordinator) = setup(fetcher.clone(), Duration::from_secs(5));

        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), coordinator.resolve(&key, false)).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let (entry, fresh) = cache.get(&key).await.unwrap();
        assert!(fresh);
        assert_eq!(*entry.record, json!({"late": true}));
    }
}
