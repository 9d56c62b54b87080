use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown object: {0}")]
    ObjUnknown(String),

    #[error("malformed object structure: {0}")]
    StructFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rule generation failed for {failed} object(s)")]
    Emit { failed: usize },

    #[error("network lookup: {0}")]
    Net(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed")]
    Auth,
}

pub type Result<T> = std::result::Result<T, Error>;

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            Error::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            Error::Json(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Error::ObjUnknown(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Error::StructFailed(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            Error::Emit { .. } => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            Error::Net(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            Error::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            Error::Auth => (StatusCode::UNAUTHORIZED, self.to_string()),
        };

        let body = json!({ "error": message });
        (status, Json(body)).into_response()
    }
}
