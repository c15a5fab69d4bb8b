use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// Famille de ressources suivies; chacune a son propre TTL et sa propre cadence de diffusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Match,
    Commentary,
    Highlights,
    Standings,
    Player,
    List,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Match,
        Category::Commentary,
        Category::Highlights,
        Category::Standings,
        Category::Player,
        Category::List,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Match => "match",
            Category::Commentary => "commentary",
            Category::Highlights => "highlights",
            Category::Standings => "standings",
            Category::Player => "player",
            Category::List => "list",
        }
    }

    // Type de l'enveloppe poussée aux abonnés, ex: `match_update`.
    pub fn update_type(self) -> String {
        format!("{}_update", self.as_str())
    }

    // Seules les tables lentes survivent à un redémarrage.
    pub fn is_persistable(self) -> bool {
        matches!(self, Category::Standings | Category::Player)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "match" => Ok(Category::Match),
            "commentary" => Ok(Category::Commentary),
            "highlights" => Ok(Category::Highlights),
            "standings" => Ok(Category::Standings),
            "player" => Ok(Category::Player),
            "list" => Ok(Category::List),
            other => Err(format!("unknown category '{}'", other)),
        }
    }
}

// Identifie une ressource cachable et abonnable.
// Les ressources globales à une catégorie (la liste des matchs en direct) ont un id vide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub category: Category,
    pub id: String,
}

impl CacheKey {
    pub fn new(category: Category, id: impl Into<String>) -> Self {
        Self {
            category,
            id: id.into(),
        }
    }

    pub fn list() -> Self {
        Self::new(Category::List, "")
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id.is_empty() {
            write!(f, "{}:*", self.category)
        } else {
            write!(f, "{}:{}", self.category, self.id)
        }
    }
}

// Trame poussée aux abonnés: `{"type": "<category>_update", "data": ...}`.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<'a> {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: &'a serde_json::Value,
}

impl<'a> Envelope<'a> {
    pub fn update(category: Category, data: &'a serde_json::Value) -> Self {
        Self {
            event_type: category.update_type(),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Subscribe,
    Unsubscribe,
}

// Message envoyé par un spectateur sur la WebSocket.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    pub action: Action,
    pub category: Option<String>,
    pub match_id: Option<String>,
    pub tournament_id: Option<String>,
    pub player_id: Option<String>,
}

impl ClientMessage {
    // Sans catégorie explicite: `matchId` seul désigne un match, `tournamentId` seul un classement.
    pub fn key(&self) -> Result<CacheKey, String> {
        let category = match self.category.as_deref() {
            Some(raw) => raw.parse::<Category>()?,
            None if present(&self.match_id).is_some() => Category::Match,
            None if present(&self.tournament_id).is_some() => Category::Standings,
            None => return Err("missing category".to_string()),
        };

        let id = match category {
            Category::Match | Category::Commentary | Category::Highlights => present(&self.match_id),
            Category::Standings => present(&self.tournament_id),
            Category::Player => present(&self.player_id),
            Category::List => return Ok(CacheKey::list()),
        };

        id.map(|id| CacheKey::new(category, id))
            .ok_or_else(|| format!("missing id for category '{}'", category))
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: f64,
    pub cached_entries: usize,
    pub active_keys: usize,
    pub connections: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub cached_entries: usize,
    pub in_flight: usize,
    pub connections: usize,
    pub active_keys: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FreshQuery {
    #[serde(default)]
    pub fresh: bool,
}
