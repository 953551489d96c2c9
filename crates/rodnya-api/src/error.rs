use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

/// Error type of the HTTP file routes. Everything renders as
/// `{ "error": message }` JSON with a matching status code.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("no file was uploaded")]
    MissingFile,

    #[error("invalid filename")]
    BadFilename,

    #[error("file not found")]
    NotFound,

    #[error("requested range not satisfiable")]
    BadRange,

    #[error("malformed multipart body")]
    Multipart(#[from] axum::extract::multipart::MultipartError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::MissingFile | Self::BadFilename | Self::Multipart(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::BadRange => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::Io(_) | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
