use crate::services::storage_service::StorageError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// An HTTP-facing error: a status plus a message rendered as JSON.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 415 Unsupported Media Type
    pub fn unsupported_media(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNSUPPORTED_MEDIA_TYPE, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::TooLarge { .. } => AppError::new(StatusCode::PAYLOAD_TOO_LARGE, err.to_string()),
            StorageError::InvalidSegment(_)
            | StorageError::InvalidPath
            | StorageError::Interrupted(_) => AppError::bad_request(err.to_string()),
            StorageError::NotFound(_) => AppError::not_found(err.to_string()),
            StorageError::NamesExhausted(_) => {
                tracing::error!("{}", err);
                AppError::internal("could not allocate a unique file name")
            }
            StorageError::Io(io_err) => {
                tracing::error!("storage failure: {}", io_err);
                AppError::internal("failed to save file")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn storage_errors_map_to_statuses() {
        let cases = [
            (StorageError::TooLarge { limit_mb: 25 }, StatusCode::PAYLOAD_TOO_LARGE),
            (StorageError::InvalidSegment("..".into()), StatusCode::BAD_REQUEST),
            (StorageError::NotFound("a/b.jpg".into()), StatusCode::NOT_FOUND),
            (
                StorageError::Io(io::Error::new(io::ErrorKind::StorageFull, "disk full")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn io_details_are_not_leaked_to_clients() {
        let err = AppError::from(StorageError::Io(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "/secret/path denied",
        )));
        assert!(!err.message.contains("/secret"));
    }
}
