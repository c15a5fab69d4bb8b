// Adaptateurs qui récupèrent les enregistrements depuis la source amont.
// Le hub ne dépend que du trait `Fetcher`: service HTTP, processus extracteur
// ou bouchon de test restent derrière.

use crate::config::FetcherKind;
use crate::error::FetchFailure;
use crate::models::Category;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/96.0.4664.110 Safari/537.36";

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, category: Category, id: &str) -> Result<Value, FetchFailure>;
}

pub fn from_config(kind: &FetcherKind, timeout: Duration) -> Result<Arc<dyn Fetcher>, reqwest::Error> {
    Ok(match kind {
        FetcherKind::Http { base_url } => Arc::new(HttpFetcher::new(base_url.clone(), timeout)?),
        FetcherKind::Command { program, args } => {
            Arc::new(CommandFetcher::new(program.clone(), args.clone()))
        }
    })
}

// Transforme la sortie brute de l'amont en enregistrement.
// Les extracteurs signalent leurs échecs dans le flux, `{"error": "..."}` ou un
// tableau d'un seul objet de ce type; ils ne deviennent jamais des enregistrements.
pub fn interpret_payload(raw: &str) -> Result<Value, FetchFailure> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(FetchFailure::new("upstream returned an empty response"));
    }

    let value: Value = serde_json::from_str(trimmed).map_err(|e| {
        FetchFailure::with_raw_output(format!("unparseable upstream payload: {}", e), raw)
    })?;

    let reported = match &value {
        Value::Object(map) => map.get("error"),
        Value::Array(items) if items.len() == 1 => items[0].get("error"),
        _ => None,
    };

    if let Some(error) = reported {
        let reason = error
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(FetchFailure::with_raw_output(reason, raw));
    }

    Ok(value)
}

pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFetcher {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, category: Category, id: &str) -> String {
        match category {
            Category::List => format!("{}/matches/live", self.base_url),
            Category::Match => format!("{}/matches/{}", self.base_url, id),
            Category::Commentary => format!("{}/matches/{}/commentary", self.base_url, id),
            Category::Highlights => format!("{}/matches/{}/highlights", self.base_url, id),
            Category::Standings => format!("{}/series/{}/points", self.base_url, id),
            Category::Player => format!("{}/players/{}", self.base_url, id),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, category: Category, id: &str) -> Result<Value, FetchFailure> {
        let url = self.url_for(category, id);
        debug!(url = %url, "Fetching upstream record");

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| FetchFailure::new(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FetchFailure::new(format!("reading {} failed: {}", url, e)))?;

        if !status.is_success() {
            return Err(FetchFailure::with_raw_output(
                format!("upstream returned {}", status),
                body,
            ));
        }

        interpret_payload(&body)
    }
}

// Lance l'extracteur externe et lit un document JSON sur sa sortie standard.
// Le script ne connaît que deux formes: `<program> [args..] list` pour les matchs
// en direct et `<program> [args..] <match_id>` pour le détail d'un match.
pub struct CommandFetcher {
    program: String,
    args: Vec<String>,
}

impl CommandFetcher {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

#[async_trait]
impl Fetcher for CommandFetcher {
    async fn fetch(&self, category: Category, id: &str) -> Result<Value, FetchFailure> {
        let argument = extractor_argument(category, id)?;
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg(argument);
        // Le timeout du coordinateur abandonne ce futur: le processus fils part avec lui.
        command.kill_on_drop(true);

        let output = command
            .output()
            .await
            .map_err(|e| FetchFailure::new(format!("failed to run {}: {}", self.program, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FetchFailure::with_raw_output(
                format!("{} exited with {}", self.program, output.status),
                format!("{}{}", stdout, stderr),
            ));
        }

        interpret_payload(&stdout)
    }
}

fn extractor_argument(category: Category, id: &str) -> Result<&str, FetchFailure> {
    match category {
        Category::List => Ok("list"),
        // `list` est réservé: un id identique serait lu comme la liste.
        Category::Match if !id.is_empty() && id != "list" => Ok(id),
        Category::Match => Err(FetchFailure::new(format!("invalid match id '{}'", id))),
        other => Err(FetchFailure::new(format!(
            "category '{}' is not served by the extractor command",
            other
        ))),
    }
}

#[cfg(test)]
pub mod stub {
    use super::*;
    use crate::models::CacheKey;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    // Fetcher scripté: compte les appels et peut simuler de la latence.
    #[derive(Default)]
    pub struct StubFetcher {
        responses: Mutex<HashMap<CacheKey, Result<Value, FetchFailure>>>,
        calls: Mutex<HashMap<CacheKey, usize>>,
        total: AtomicUsize,
        delay: Duration,
    }

    impl StubFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        pub fn respond(&self, key: &CacheKey, record: Value) {
            self.responses
                .lock()
                .unwrap()
                .insert(key.clone(), Ok(record));
        }

        pub fn fail(&self, key: &CacheKey, reason: &str) {
            self.responses
                .lock()
                .unwrap()
                .insert(key.clone(), Err(FetchFailure::new(reason)));
        }

        pub fn calls(&self) -> usize {
            self.total.load(Ordering::SeqCst)
        }

        pub fn calls_for(&self, key: &CacheKey) -> usize {
            self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(&self, category: Category, id: &str) -> Result<Value, FetchFailure> {
            let key = CacheKey::new(category, id);
            self.total.fetch_add(1, Ordering::SeqCst);
            *self.calls.lock().unwrap().entry(key.clone()).or_default() += 1;

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            self.responses
                .lock()
                .unwrap()
                .get(&key)
                .cloned()
                .unwrap_or_else(|| Err(FetchFailure::new(format!("no scripted response for {}", key))))
        }
    }
}
