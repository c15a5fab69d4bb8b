// Routes REST de consultation: une fine couche au-dessus de `Hub::query`.
use crate::app_state::AppState;
use crate::error::FetchFailure;
use crate::models::{Category, FreshQuery, HealthStatus, HubStats};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::Value;
use std::time::SystemTime;
use tracing::warn;

// Toutes les routes de données partagent ce chemin: cache frais, sinon fetch dédupliqué.
async fn query_json(
    state: &AppState,
    category: Category,
    id: &str,
    fresh: bool,
) -> Result<Json<Value>, FetchFailure> {
    match state.hub.query(category, id, fresh).await {
        Ok(record) => Ok(Json(Value::clone(&record))),
        Err(failure) => {
            warn!(category = %category, id, reason = %failure, "Query failed");
            Err(failure)
        }
    }
}

// GET `/api/matches/live`
pub async fn live_matches_handler(
    State(state): State<AppState>,
    Query(params): Query<FreshQuery>,
) -> Result<Json<Value>, FetchFailure> {
    query_json(&state, Category::List, "", params.fresh).await
}

// GET `/api/matches/{id}`
pub async fn match_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<FreshQuery>,
) -> Result<Json<Value>, FetchFailure> {
    query_json(&state, Category::Match, &id, params.fresh).await
}

// GET `/api/matches/{id}/commentary`
pub async fn commentary_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<FreshQuery>,
) -> Result<Json<Value>, FetchFailure> {
    query_json(&state, Category::Commentary, &id, params.fresh).await
}

// GET `/api/matches/{id}/highlights`
pub async fn highlights_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<FreshQuery>,
) -> Result<Json<Value>, FetchFailure> {
    query_json(&state, Category::Highlights, &id, params.fresh).await
}

// GET `/api/series/{id}/points`
pub async fn standings_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<FreshQuery>,
) -> Result<Json<Value>, FetchFailure> {
    query_json(&state, Category::Standings, &id, params.fresh).await
}

// GET `/api/players/{id}`
pub async fn player_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<FreshQuery>,
) -> Result<Json<Value>, FetchFailure> {
    query_json(&state, Category::Player, &id, params.fresh).await
}

// GET `/api/stats`
pub async fn stats_handler(State(state): State<AppState>) -> Json<HubStats> {
    Json(state.hub.stats().await)
}

// GET `/health`: le service est sain si la base répond.
pub async fn health_check(State(state): State<AppState>) -> Result<Json<HealthStatus>, StatusCode> {
    match state.store.db().acquire().await {
        Ok(_) => {
            let stats = state.hub.stats().await;
            Ok(Json(HealthStatus {
                status: "healthy".to_string(),
                timestamp: current_timestamp(),
                cached_entries: stats.cached_entries,
                active_keys: stats.active_keys.len(),
                connections: stats.connections,
            }))
        }
        Err(e) => {
            tracing::error!("Health check failed: DB acquire error: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
