use std::time::Duration;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use duel_core::HardBlock;
use duel_core::protocol::{ErrorKind, ServerMessage};

#[derive(Debug, Error)]
pub enum DuelError {
    #[error("{0}")]
    Validation(#[from] HardBlock),

    #[error("Already in the matchmaking queue")]
    AlreadyQueued,

    #[error("Already in a match")]
    AlreadyInMatch,

    #[error("Not a participant of this match")]
    NotInMatch,

    #[error("Match has not started yet")]
    NotActive,

    #[error("No accepted solve of the assigned problem since the match started")]
    StaleSubmission { retry_after: Duration },

    #[error("Link a LeetCode account before submitting")]
    MissingHandle,

    #[error("External service unavailable: {0}")]
    ExternalService(String),

    #[error("Match already resolved")]
    AlreadyResolved,

    #[error("Invalid message: {0}")]
    Malformed(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Unknown player")]
    UnknownPlayer,

    #[error("Not found")]
    NotFound,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl DuelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DuelError::Validation(_) | DuelError::MissingHandle => ErrorKind::Validation,
            DuelError::AlreadyQueued => ErrorKind::AlreadyQueued,
            DuelError::AlreadyInMatch => ErrorKind::AlreadyInMatch,
            DuelError::NotInMatch => ErrorKind::NotInMatch,
            DuelError::NotActive => ErrorKind::NotActive,
            DuelError::StaleSubmission { .. } => ErrorKind::StaleSubmission,
            DuelError::ExternalService(_) | DuelError::Database(_) => ErrorKind::ExternalService,
            DuelError::AlreadyResolved => ErrorKind::AlreadyResolved,
            DuelError::Malformed(_) => ErrorKind::Malformed,
            DuelError::RateLimited => ErrorKind::RateLimited,
            DuelError::UnknownPlayer => ErrorKind::UnknownPlayer,
            DuelError::NotFound => ErrorKind::NotFound,
        }
    }

    /// Errors that describe a state the player is simply not in. They are
    /// reported but never logged as failures.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            DuelError::AlreadyQueued
                | DuelError::AlreadyInMatch
                | DuelError::NotInMatch
                | DuelError::AlreadyResolved
        )
    }

    pub fn to_message(&self) -> ServerMessage {
        let retry_after_ms = match self {
            DuelError::StaleSubmission { retry_after } => Some(retry_after.as_millis() as u64),
            _ => None,
        };
        ServerMessage::Error {
            kind: self.kind(),
            message: self.to_string(),
            retry_after_ms,
        }
    }
}

impl IntoResponse for DuelError {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            ErrorKind::Validation | ErrorKind::Malformed => StatusCode::BAD_REQUEST,
            ErrorKind::UnknownPlayer | ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::ExternalService => StatusCode::BAD_GATEWAY,
            _ => StatusCode::CONFLICT,
        };

        let body = Json(json!({
            "kind": self.kind(),
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}
