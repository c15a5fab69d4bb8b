use crate::hub::{stop_requested, Hub};
use crate::models::{CacheKey, Category};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

// Bilan d'un tick de diffusion pour une catégorie.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub refreshed: usize,
    pub failed: usize,
    pub delivered: usize,
}

// Un timer périodique indépendant par catégorie, plus le balayage du cache.
// Les timers tournent de `start` à `stop`; il n'y a pas d'état en pause.
pub struct BroadcastScheduler {
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BroadcastScheduler {
    pub fn start(hub: Arc<Hub>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let mut tasks = Vec::with_capacity(Category::ALL.len() + 1);

        for category in Category::ALL {
            let cadence = hub.config().cadence(category);
            let hub = hub.clone();
            let stop_rx = stop_tx.subscribe();
            tasks.push(tokio::spawn(category_timer(hub, category, cadence, stop_rx)));
            info!(category = %category, cadence = ?cadence, "Broadcast timer started");
        }

        let sweep_hub = hub.clone();
        let stop_rx = stop_tx.subscribe();
        tasks.push(tokio::spawn(sweep_timer(sweep_hub, stop_rx)));

        Self { stop_tx, tasks }
    }

    // Arrête tous les timers. Un tick en cours se termine d'abord.
    pub async fn stop(self) {
        self.stop_tx.send_replace(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Broadcast timers stopped");
    }
}

async fn category_timer(
    hub: Arc<Hub>,
    category: Category,
    cadence: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    // L'abonnement fournit déjà l'instantané; le premier tick vient une cadence plus tard.
    let mut interval = interval_at(Instant::now() + cadence, cadence);
    // Le tick suivant attend que le précédent soit terminé.
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = run_tick(&hub, category).await;
                if report.refreshed + report.failed > 0 {
                    debug!(
                        category = %category,
                        refreshed = report.refreshed,
                        failed = report.failed,
                        delivered = report.delivered,
                        "Broadcast tick"
                    );
                }
            }
            _ = stop_requested(&mut stop_rx) => break,
        }
    }
}

async fn sweep_timer(hub: Arc<Hub>, mut stop_rx: watch::Receiver<bool>) {
    let period = hub.config().sweep_interval;
    let horizon = hub.config().cold_horizon;
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let active = hub.registry().active_key_set().await;
                hub.cache().sweep(horizon, &active).await;
            }
            _ = stop_requested(&mut stop_rx) => break,
        }
    }
}

// Rafraîchit chaque clé abonnée de `category` et pousse les résultats.
// Les lectures de diffusion ignorent toujours le TTL. Une clé en échec est
// journalisée puis sautée sans retenir les autres, et réessayée au tick
// suivant, sans backoff.
pub async fn run_tick(hub: &Hub, category: Category) -> TickReport {
    let keys = hub.registry().active_keys(Some(category)).await;
    let mut report = TickReport::default();

    #[cfg(not(feature = "sequential-refresh"))]
    let outcomes = futures_util::future::join_all(keys.iter().map(|key| refresh_key(hub, key))).await;

    #[cfg(feature = "sequential-refresh")]
    let outcomes = {
        let mut outcomes = Vec::with_capacity(keys.len());
        for key in &keys {
            outcomes.push(refresh_key(hub, key).await);
        }
        outcomes
    };

    for outcome in outcomes {
        match outcome {
            Some(delivered) => {
                report.refreshed += 1;
                report.delivered += delivered;
            }
            None => report.failed += 1,
        }
    }
    report
}

async fn refresh_key(hub: &Hub, key: &CacheKey) -> Option<usize> {
    match hub.coordinator().resolve(key, true).await {
        Ok(record) => Some(hub.publish(key, &record).await),
        Err(failure) => {
            warn!(key = %key, reason = %failure, "Broadcast refresh failed, skipping key");
            None
        }
    }
}
