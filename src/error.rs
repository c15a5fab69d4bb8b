use crate::registry::ConnectionId;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::time::Duration;
use thiserror::Error;

// La source amont est injoignable ou a rendu des données inutilisables.
// Clonable: un même échec est remis à tous les appelants en attente.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct FetchFailure {
    pub reason: String,
    pub raw_output: Option<String>,
}

impl FetchFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            raw_output: None,
        }
    }

    pub fn with_raw_output(reason: impl Into<String>, raw_output: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            raw_output: Some(raw_output.into()),
        }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(format!("fetch timed out after {:?}", limit))
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("invalid subscription: {0}")]
    InvalidSubscription(String),

    #[error("connection {0} is closed")]
    Transport(ConnectionId),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl IntoResponse for FetchFailure {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": "Data temporarily unavailable",
            "reason": self.reason,
        }));
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    }
}
