use crate::models::{CacheKey, Category};
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

// Fenêtre de fraîcheur par catégorie.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    ttls: HashMap<Category, Duration>,
}

impl TtlPolicy {
    pub fn new(ttls: HashMap<Category, Duration>) -> Self {
        Self { ttls }
    }

    pub fn ttl(&self, category: Category) -> Duration {
        self.ttls.get(&category).copied().unwrap_or(Duration::ZERO)
    }

    pub fn is_fresh(&self, key: &CacheKey, fetched_at: Instant) -> bool {
        fetched_at.elapsed() < self.ttl(key.category)
    }
}

// Un enregistrement stocké: remplacé en bloc à chaque rafraîchissement, jamais modifié.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub record: Arc<Value>,
    pub fetched_at: Instant,
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    last_read: Instant,
}

#[derive(Debug)]
pub struct TtlCache {
    entries: RwLock<HashMap<CacheKey, Slot>>,
    policy: TtlPolicy,
}

impl TtlCache {
    pub fn new(policy: TtlPolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(256)),
            policy,
        }
    }

    // Rend l'entrée et indique si elle est encore dans le TTL de sa catégorie.
    pub async fn get(&self, key: &CacheKey) -> Option<(CacheEntry, bool)> {
        let mut entries = self.entries.write().await;
        let slot = entries.get_mut(key)?;
        slot.last_read = Instant::now();
        let fresh = self.policy.is_fresh(key, slot.entry.fetched_at);
        Some((slot.entry.clone(), fresh))
    }

    pub async fn put(&self, key: CacheKey, record: Arc<Value>) -> CacheEntry {
        let now = Instant::now();
        let entry = CacheEntry {
            record,
            fetched_at: now,
        };
        self.entries.write().await.insert(
            key,
            Slot {
                entry: entry.clone(),
                last_read: now,
            },
        );
        entry
    }

    // Insère un enregistrement récupéré il y a `age`, par exemple relu depuis le disque.
    pub async fn restore(&self, key: CacheKey, record: Arc<Value>, age: Duration) {
        let now = Instant::now();
        let fetched_at = now.checked_sub(age).unwrap_or(now);
        let mut entries = self.entries.write().await;
        // Un fetch réel déjà arrivé prime sur la copie restaurée.
        if entries.contains_key(&key) {
            return;
        }
        entries.insert(
            key,
            Slot {
                entry: CacheEntry { record, fetched_at },
                last_read: now,
            },
        );
    }

    pub async fn invalidate(&self, key: &CacheKey) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    // Supprime les entrées sans abonné et non lues depuis `horizon`.
    pub async fn sweep(&self, horizon: Duration, active: &HashSet<CacheKey>) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, slot| active.contains(key) || slot.last_read.elapsed() < horizon);
        let dropped = before - entries.len();
        if dropped > 0 {
            debug!(dropped, remaining = entries.len(), "Cache sweep");
        }
        dropped
    }

    // Copie des entrées dont la catégorie satisfait `filter`.
    pub async fn entries_where<F>(&self, filter: F) -> Vec<(CacheKey, CacheEntry)>
    where
        F: Fn(Category) -> bool,
    {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|(key, _)| filter(key.category))
            .map(|(key, slot)| (key.clone(), slot.entry.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
