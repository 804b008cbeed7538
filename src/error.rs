//! The HTTP-facing error type shared by every axum handler.

use crate::api::types::ErrorResponse;
use crate::db::DbError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}

impl From<DbError> for AppError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::QueueEntryNotFound(id) => AppError::NotFound(format!("queue entry not found: {id}")),
            DbError::CallStateNotFound(id) => AppError::NotFound(format!("call state not found: {id}")),
            other => AppError::Internal(other.to_string()),
        }
    }
}
