use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use serde_json::json;
use thiserror::Error;

/// Failures surfaced by the chat core.
///
/// Durable-layer failures always propagate to the caller as request
/// failures; only per-subscriber broadcast errors are handled locally.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<mongodb::error::Error> for ChatError {
    fn from(err: mongodb::error::Error) -> Self {
        ChatError::Storage(err.to_string())
    }
}

impl From<mongodb::bson::ser::Error> for ChatError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        ChatError::Storage(err.to_string())
    }
}

impl actix_web::ResponseError for ChatError {
    fn status_code(&self) -> StatusCode {
        match self {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::InvalidState(_) => StatusCode::CONFLICT,
            ChatError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "message": self.to_string() }))
    }
}
