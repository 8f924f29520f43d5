use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failure kinds shared by the store, the lifecycle operations and the
/// management API.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("URL not found")]
    NotFound,

    #[error("Shortened URL must be unique")]
    DuplicateKey,

    #[error("URL has already been deleted")]
    AlreadyDeleted,

    #[error("URL is past the recovery window or not marked as deleted")]
    RecoveryWindowExpired,

    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Storage error: {0}")]
    Storage(sqlx::Error),
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => AppError::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => AppError::DuplicateKey,
            _ => AppError::Storage(err),
        }
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::DuplicateKey
            | AppError::AlreadyDeleted
            | AppError::RecoveryWindowExpired
            | AppError::MissingField(_)
            | AppError::InvalidField { .. } => StatusCode::BAD_REQUEST,
            AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Storage(e) => {
                // Detail stays in the log.
                tracing::error!("Storage error: {:?}", e);
                "Server error".to_owned()
            }
            other => other.to_string(),
        };

        (status, Json(json!({ "message": message }))).into_response()
    }
}
