// Persistance des catégories lentes (classements, joueurs) dans SQLite.
// Les données de match en direct ne sont jamais écrites sur disque.
use crate::error::HubError;
use crate::hub::{stop_requested, Hub};
use crate::models::{CacheKey, Category};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

struct Migration {
    version: i32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_snapshots",
        sql: include_str!("../migrations/001_create_snapshots.sql"),
    },
    Migration {
        version: 2,
        name: "snapshot_age_index",
        sql: include_str!("../migrations/002_snapshot_age_index.sql"),
    },
];

// Taille maximale d'un lot d'écritures avant vidage immédiat.
const BATCH_CAPACITY: usize = 500;
const FLUSH_INTERVAL_MS: u64 = 20;

pub async fn init_database(db_file: &str) -> Result<SqlitePool, HubError> {
    // Une base `:memory:` n'existe que dans sa connexion: une seule connexion, jamais recyclée.
    let in_memory = db_file == ":memory:";
    let pool = SqlitePoolOptions::new()
        .max_connections(if in_memory { 1 } else { 8 })
        .idle_timeout(None)
        .max_lifetime(None)
        .connect(&format!("sqlite:{}?mode=rwc", db_file))
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous = NORMAL").execute(&pool).await?;
    sqlx::query("PRAGMA temp_store = MEMORY").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at REAL NOT NULL
        )",
    )
    .execute(&pool)
    .await?;

    for migration in MIGRATIONS {
        let applied =
            sqlx::query_as::<_, (i32,)>("SELECT version FROM schema_migrations WHERE version = ?")
                .bind(migration.version)
                .fetch_optional(&pool)
                .await?
                .is_some();

        if applied {
            continue;
        }

        info!("Running migration {}: {}", migration.version, migration.name);

        // Chaque migration s'applique dans sa propre transaction.
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
            .bind(migration.version)
            .bind(migration.name)
            .bind(current_timestamp())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }

    info!("Database initialization complete");
    Ok(pool)
}

// Une ligne de la table `snapshots`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSnapshot {
    pub key: CacheKey,
    pub record: serde_json::Value,
    pub fetched_at: f64,
}

enum DbCommand {
    SaveSnapshot {
        category: Category,
        entity_id: String,
        record: String,
        fetched_at: f64,
    },
    // Vide le lot courant puis acquitte.
    Flush(oneshot::Sender<()>),
}

// Magasin des instantanés. Les écritures passent par un worker qui les
// regroupe en transactions.
#[derive(Clone)]
pub struct SnapshotStore {
    db: SqlitePool,
    db_tx: mpsc::UnboundedSender<DbCommand>,
}

impl SnapshotStore {
    pub fn new(db: SqlitePool) -> Self {
        let (db_tx, mut db_rx) = mpsc::unbounded_channel::<DbCommand>();
        let worker_db = db.clone();

        tokio::spawn(async move {
            let mut batch = Vec::with_capacity(BATCH_CAPACITY);
            let mut interval = tokio::time::interval(Duration::from_millis(FLUSH_INTERVAL_MS));

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !batch.is_empty() {
                            Self::flush_batch(&worker_db, &mut batch).await;
                        }
                    }
                    cmd = db_rx.recv() => match cmd {
                        Some(DbCommand::Flush(ack)) => {
                            Self::flush_batch(&worker_db, &mut batch).await;
                            let _ = ack.send(());
                        }
                        Some(cmd) => {
                            batch.push(cmd);
                            if batch.len() >= BATCH_CAPACITY {
                                Self::flush_batch(&worker_db, &mut batch).await;
                            }
                        }
                        None => {
                            Self::flush_batch(&worker_db, &mut batch).await;
                            break;
                        }
                    }
                }
            }
        });

        Self { db, db_tx }
    }

    // Un lot = une transaction: tout est validé, ou rien.
    async fn flush_batch(db: &SqlitePool, batch: &mut Vec<DbCommand>) {
        if batch.is_empty() {
            return;
        }

        let mut tx = match db.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                error!("Impossible de démarrer une transaction: {}", e);
                batch.clear();
                return;
            }
        };

        let mut has_error = false;
        for cmd in batch.drain(..) {
            let result = match cmd {
                DbCommand::SaveSnapshot {
                    category,
                    entity_id,
                    record,
                    fetched_at,
                } => {
                    sqlx::query("INSERT OR REPLACE INTO snapshots (category, entity_id, record, fetched_at) VALUES (?, ?, ?, ?)")
                        .bind(category.as_str())
                        .bind(entity_id)
                        .bind(record)
                        .bind(fetched_at)
                        .execute(&mut *tx)
                        .await
                }
                DbCommand::Flush(ack) => {
                    let _ = ack.send(());
                    continue;
                }
            };

            if let Err(e) = result {
                error!("Erreur lors de l'écriture d'un instantané: {}", e);
                has_error = true;
                break;
            }
        }

        if has_error {
            if let Err(e) = tx.rollback().await {
                error!("Erreur lors du rollback de la transaction: {}", e);
            } else {
                warn!("Transaction annulée suite à une erreur");
            }
        } else if let Err(e) = tx.commit().await {
            error!("Erreur lors du commit de la transaction: {}", e);
        }
    }

    // Met en file les entrées persistables du cache. Retourne leur nombre.
    pub async fn persist(&self, hub: &Hub) -> usize {
        let now = current_timestamp();
        let entries = hub.cache().entries_where(Category::is_persistable).await;
        let mut queued = 0;

        for (key, entry) in entries {
            let cmd = DbCommand::SaveSnapshot {
                category: key.category,
                entity_id: key.id,
                record: entry.record.to_string(),
                fetched_at: now - entry.fetched_at.elapsed().as_secs_f64(),
            };
            if self.db_tx.send(cmd).is_ok() {
                queued += 1;
            }
        }
        queued
    }

    // Attend que toutes les écritures en file soient validées.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.db_tx.send(DbCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    // Lit les instantanés plus jeunes que `max_age`. Les lignes illisibles sont ignorées.
    pub async fn load(&self, max_age: Duration) -> Result<Vec<StoredSnapshot>, HubError> {
        let cutoff = current_timestamp() - max_age.as_secs_f64();
        let rows = sqlx::query_as::<_, (String, String, String, f64)>(
            "SELECT category, entity_id, record, fetched_at FROM snapshots WHERE fetched_at >= ?",
        )
        .bind(cutoff)
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(category, entity_id, record, fetched_at)| {
                let category = category.parse::<Category>().ok()?;
                if !category.is_persistable() {
                    return None;
                }
                let record = serde_json::from_str(&record).ok()?;
                Some(StoredSnapshot {
                    key: CacheKey::new(category, entity_id),
                    record,
                    fetched_at,
                })
            })
            .collect())
    }

    // Recharge le cache au démarrage en conservant l'âge de chaque entrée.
    pub async fn warm_cache(&self, hub: &Hub, max_age: Duration) -> Result<usize, HubError> {
        let now = current_timestamp();
        let snapshots = self.load(max_age).await?;
        let count = snapshots.len();

        for snapshot in snapshots {
            let age = Duration::from_secs_f64((now - snapshot.fetched_at).max(0.0));
            hub.cache()
                .restore(snapshot.key, Arc::new(snapshot.record), age)
                .await;
        }

        info!(restored = count, "Cache warmed from snapshots");
        Ok(count)
    }

    // Supprime les instantanés plus vieux que `max_age`.
    pub async fn purge_older_than(&self, max_age: Duration) -> Result<u64, HubError> {
        let cutoff = current_timestamp() - max_age.as_secs_f64();
        let result = sqlx::query("DELETE FROM snapshots WHERE fetched_at < ?")
            .bind(cutoff)
            .execute(&self.db)
            .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!("Purge: supprimé {} anciens instantanés", deleted);
        }
        Ok(deleted)
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }
}

// Tâche de fond: instantané périodique, purge, et un dernier passage à l'arrêt.
pub fn spawn_snapshot_task(
    hub: Arc<Hub>,
    store: SnapshotStore,
    mut stop_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = hub.config().snapshot_interval;
        let max_age = hub.config().snapshot_max_age;
        let mut interval = tokio::time::interval(period);
        // Pas d'instantané au démarrage: le cache vient d'être rechargé.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    store.persist(&hub).await;
                    if let Err(e) = store.purge_older_than(max_age).await {
                        error!("Erreur lors de la purge des instantanés: {}", e);
                    }
                }
                _ = stop_requested(&mut stop_rx) => break,
            }
        }

        let queued = store.persist(&hub).await;
        store.flush().await;
        info!(queued, "Final snapshot written");
    })
}

fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
