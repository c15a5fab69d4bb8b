use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

// Ce que doit faire une connexion quand son timer de battement se déclenche.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    // La sonde précédente a reçu sa réponse: en envoyer une nouvelle.
    Probe,
    // La sonde précédente est restée sans réponse: fermer la connexion.
    Expired,
}

// État de battement d'une connexion. Le timer vit dans le moniteur: le
// relâcher en fin de session suffit à l'arrêter.
pub struct LivenessMonitor {
    timer: Interval,
    waiting: bool,
    last_pong_at: Instant,
}

impl LivenessMonitor {
    pub fn new(period: Duration) -> Self {
        let now = Instant::now();
        // La première sonde part une période complète après l'acceptation.
        let mut timer = interval_at(now + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            timer,
            waiting: false,
            last_pong_at: now,
        }
    }

    // Attend le prochain battement et décide du sort de la connexion.
    // Annulable sans perte: utilisable comme branche de `tokio::select!`.
    pub async fn tick(&mut self) -> Verdict {
        self.timer.tick().await;
        if self.waiting {
            Verdict::Expired
        } else {
            self.waiting = true;
            Verdict::Probe
        }
    }

    pub fn record_pong(&mut self) {
        self.waiting = false;
        self.last_pong_at = Instant::now();
    }

    pub fn last_pong_at(&self) -> Instant {
        self.last_pong_at
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting
    }
}
