use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

use relay_engine::RelayError;
use relay_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid event id: {0}")]
    InvalidId(String),

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidId(_) => StatusCode::BAD_REQUEST,
            Self::Relay(e) => match e {
                RelayError::NotRunning
                | RelayError::AlreadyStarted
                | RelayError::NotAbandonable { .. } => StatusCode::CONFLICT,
                RelayError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
                e if e.is_fatal() => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Io(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
