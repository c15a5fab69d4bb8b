// Configuration lue depuis les variables d'environnement, avec des valeurs
// par défaut adaptées à une instance locale unique.
use crate::error::HubError;
use crate::models::Category;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetcherKind {
    // Service JSON amont exposant les mêmes routes que l'API REST du hub.
    Http { base_url: String },
    // Extracteur externe: `<program> [args..] list` ou `<program> [args..] <match_id>`.
    Command { program: String, args: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub port: u16,
    pub database_file: String,
    pub fetch_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub sweep_interval: Duration,
    pub cold_horizon: Duration,
    pub snapshot_interval: Duration,
    pub snapshot_max_age: Duration,
    pub rate_limit_max: u32,
    pub rate_limit_window: Duration,
    pub ttls: HashMap<Category, Duration>,
    pub cadences: HashMap<Category, Duration>,
    pub fetcher: FetcherKind,
}

const DEFAULT_SCRAPER_COMMAND: &str = "python3 scraper.py";

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            database_file: ":memory:".to_string(),
            fetch_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(300),
            cold_horizon: Duration::from_secs(1800),
            snapshot_interval: Duration::from_secs(600),
            snapshot_max_age: Duration::from_secs(72 * 3600),
            // 100 requêtes par IP toutes les 15 minutes.
            rate_limit_max: 100,
            rate_limit_window: Duration::from_secs(15 * 60),
            ttls: Category::ALL
                .iter()
                .map(|c| (*c, default_ttl(*c)))
                .collect(),
            cadences: Category::ALL
                .iter()
                .map(|c| (*c, default_cadence(*c)))
                .collect(),
            fetcher: command_fetcher(DEFAULT_SCRAPER_COMMAND),
        }
    }
}

fn default_ttl(category: Category) -> Duration {
    match category {
        Category::List => Duration::from_secs(120),
        Category::Match | Category::Commentary => Duration::from_secs(10),
        Category::Highlights => Duration::from_secs(30),
        Category::Standings => Duration::from_secs(3600),
        Category::Player => Duration::from_secs(6 * 3600),
    }
}

fn default_cadence(category: Category) -> Duration {
    match category {
        Category::List => Duration::from_secs(60),
        Category::Match => Duration::from_secs(15),
        Category::Commentary => Duration::from_secs(12),
        Category::Highlights => Duration::from_secs(30),
        Category::Standings | Category::Player => Duration::from_secs(3600),
    }
}

fn command_fetcher(command: &str) -> FetcherKind {
    let mut parts = command.split_whitespace().map(str::to_string);
    FetcherKind::Command {
        program: parts.next().unwrap_or_else(|| "python3".to_string()),
        args: parts.collect(),
    }
}

impl HubConfig {
    // Variables reconnues:
    // PORT, DATABASE_FILE, FETCH_TIMEOUT_SECS, HEARTBEAT_INTERVAL_SECS,
    // CACHE_SWEEP_INTERVAL_SECS, CACHE_COLD_HORIZON_SECS, SNAPSHOT_INTERVAL_SECS,
    // SNAPSHOT_MAX_AGE_HOURS, RATE_LIMIT_MAX (0 désactive), RATE_LIMIT_WINDOW_SECS,
    // TTL_<CATEGORY>_SECS, CADENCE_<CATEGORY>_SECS (ex: TTL_MATCH_SECS),
    // FETCHER (`command` par défaut, ou `http`), SCRAPER_COMMAND, UPSTREAM_BASE_URL.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let ttls = Category::ALL
            .iter()
            .map(|c| {
                let var = format!("TTL_{}_SECS", c.as_str().to_ascii_uppercase());
                (*c, env_secs(&var).unwrap_or(defaults.ttls[c]))
            })
            .collect();

        let cadences = Category::ALL
            .iter()
            .map(|c| {
                let var = format!("CADENCE_{}_SECS", c.as_str().to_ascii_uppercase());
                (*c, env_secs(&var).unwrap_or(defaults.cadences[c]))
            })
            .collect();

        let fetcher = match std::env::var("FETCHER").ok().as_deref() {
            // Pas d'URL par défaut: aucun service amont n'est fourni avec le hub.
            Some("http") => FetcherKind::Http {
                base_url: std::env::var("UPSTREAM_BASE_URL")
                    .map(|s| s.trim().trim_end_matches('/').to_string())
                    .unwrap_or_default(),
            },
            _ => command_fetcher(
                &std::env::var("SCRAPER_COMMAND")
                    .unwrap_or_else(|_| DEFAULT_SCRAPER_COMMAND.to_string()),
            ),
        };

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            database_file: std::env::var("DATABASE_FILE").unwrap_or(defaults.database_file),
            fetch_timeout: env_secs("FETCH_TIMEOUT_SECS").unwrap_or(defaults.fetch_timeout),
            heartbeat_interval: env_secs("HEARTBEAT_INTERVAL_SECS")
                .unwrap_or(defaults.heartbeat_interval),
            sweep_interval: env_secs("CACHE_SWEEP_INTERVAL_SECS")
                .unwrap_or(defaults.sweep_interval),
            cold_horizon: env_secs("CACHE_COLD_HORIZON_SECS").unwrap_or(defaults.cold_horizon),
            snapshot_interval: env_secs("SNAPSHOT_INTERVAL_SECS")
                .unwrap_or(defaults.snapshot_interval),
            snapshot_max_age: std::env::var("SNAPSHOT_MAX_AGE_HOURS")
                .ok()
                .and_then(|s| parse_hours(&s))
                .unwrap_or(defaults.snapshot_max_age),
            rate_limit_max: std::env::var("RATE_LIMIT_MAX")
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.rate_limit_max),
            rate_limit_window: env_secs("RATE_LIMIT_WINDOW_SECS")
                .unwrap_or(defaults.rate_limit_window),
            ttls,
            cadences,
            fetcher,
        }
    }

    // Refuse les combinaisons qui casseraient le hub au démarrage plutôt qu'en production.
    pub fn validate(&self) -> Result<(), HubError> {
        // Un fetch plus long qu'un battement ferait expirer les spectateurs qui attendent leur instantané.
        if self.fetch_timeout >= self.heartbeat_interval {
            return Err(HubError::Config(format!(
                "FETCH_TIMEOUT_SECS ({:?}) must be shorter than HEARTBEAT_INTERVAL_SECS ({:?})",
                self.fetch_timeout, self.heartbeat_interval
            )));
        }
        if let FetcherKind::Http { base_url } = &self.fetcher {
            if base_url.is_empty() {
                return Err(HubError::Config(
                    "FETCHER=http requires UPSTREAM_BASE_URL".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn ttl(&self, category: Category) -> Duration {
        self.ttls
            .get(&category)
            .copied()
            .unwrap_or_else(|| default_ttl(category))
    }

    pub fn cadence(&self, category: Category) -> Duration {
        self.cadences
            .get(&category)
            .copied()
            .unwrap_or_else(|| default_cadence(category))
    }
}

fn env_secs(var: &str) -> Option<Duration> {
    std::env::var(var)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

fn parse_hours(raw: &str) -> Option<Duration> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|hours| *hours > 0)
        .and_then(|hours| hours.checked_mul(3600))
        .map(Duration::from_secs)
}
