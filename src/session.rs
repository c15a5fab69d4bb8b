// Une connexion spectateur, indépendante de la bibliothèque de socket: les
// messages du client arrivent en trames `Inbound` et les réponses repartent
// par la file sortante de la connexion.
use crate::error::HubError;
use crate::hub::{stop_requested, Hub};
use crate::liveness::{LivenessMonitor, Verdict};
use crate::models::{Action, CacheKey, ClientMessage};
use crate::registry::{ConnectionHandle, Outbound};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Pong,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    LivenessTimeout,
    TransportError,
    Shutdown,
}

// Pilote une connexion jusqu'à sa fermeture, puis purge ses abonnements.
// Toutes les sorties passent par l'unique `disconnect` de la fin; le timer de
// battement disparaît avec la boucle.
pub async fn run_session(
    hub: Arc<Hub>,
    handle: ConnectionHandle,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
) -> CloseReason {
    let conn = handle.id();
    let mut liveness = LivenessMonitor::new(hub.config().heartbeat_interval);
    let mut shutdown = hub.shutdown_signal();
    // Instantanés initiaux en cours: un fetch lent ne bloque ni les pongs ni l'arrêt.
    let mut seeds = JoinSet::new();
    info!(conn = %conn, "Client connected");

    let reason = loop {
        tokio::select! {
            frame = inbound.recv() => match frame {
                Some(Inbound::Text(text)) => {
                    if let Err(e) = handle_client_message(&hub, &handle, &text, &mut seeds).await {
                        match e {
                            HubError::Transport(_) => break CloseReason::TransportError,
                            other => warn!(conn = %conn, error = %other, "Ignoring client message"),
                        }
                    }
                }
                Some(Inbound::Pong) => liveness.record_pong(),
                Some(Inbound::Close) | None => break CloseReason::ClientClosed,
            },
            verdict = liveness.tick() => match verdict {
                Verdict::Probe => {
                    if handle.send(Outbound::Ping).is_err() {
                        break CloseReason::TransportError;
                    }
                }
                Verdict::Expired => {
                    warn!(
                        conn = %conn,
                        since_last_pong = ?liveness.last_pong_at().elapsed(),
                        "Heartbeat unanswered"
                    );
                    break CloseReason::LivenessTimeout;
                }
            },
            Some(_) = seeds.join_next(), if !seeds.is_empty() => {}
            _ = stop_requested(&mut shutdown) => break CloseReason::Shutdown,
        }
    };

    seeds.abort_all();
    let _ = handle.send(Outbound::Close);
    let dropped = hub.disconnect(&handle).await;
    info!(conn = %conn, reason = ?reason, subscriptions = dropped, "Client disconnected");
    reason
}

pub fn parse_client_message(text: &str) -> Result<(Action, CacheKey), HubError> {
    let message: ClientMessage = serde_json::from_str(text)
        .map_err(|e| HubError::InvalidSubscription(format!("malformed message: {}", e)))?;
    let key = message.key().map_err(HubError::InvalidSubscription)?;
    Ok((message.action, key))
}

async fn handle_client_message(
    hub: &Arc<Hub>,
    handle: &ConnectionHandle,
    text: &str,
    seeds: &mut JoinSet<()>,
) -> Result<(), HubError> {
    let (action, key) = parse_client_message(text)?;
    match action {
        Action::Subscribe => {
            hub.add_subscription(handle, key.clone()).await?;
            let hub = hub.clone();
            let handle = handle.clone();
            seeds.spawn(async move {
                match hub.send_snapshot(&handle, &key).await {
                    Ok(seeded) => info!(conn = %handle.id(), key = %key, seeded, "Subscribed"),
                    Err(e) => {
                        // Le prochain battement constatera la fermeture.
                        debug!(conn = %handle.id(), key = %key, error = %e, "Snapshot not delivered");
                        handle.mark_closed();
                    }
                }
            });
        }
        Action::Unsubscribe => {
            let removed = hub.unsubscribe(handle, &key).await;
            debug!(conn = %handle.id(), key = %key, removed, "Unsubscribe request");
        }
    }
    Ok(())
}
