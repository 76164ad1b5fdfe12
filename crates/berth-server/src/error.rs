use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Error kinds surfaced by the supervisor core. The control API maps these to
/// HTTP status codes; background loops log and continue instead of
/// propagating.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("no free port in range {start}..={end}")]
    Exhausted { start: u16, end: u16 },

    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("workspace seed failed: {0}")]
    SeedFailed(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::BackendUnavailable(_) => StatusCode::BAD_GATEWAY,
            Error::Exhausted { .. }
            | Error::SpawnFailed(_)
            | Error::SeedFailed(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_expected_status_codes() {
        assert_eq!(
            Error::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::Conflict("already running".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::InvalidInput("name is required".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::BackendUnavailable("connect refused".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            Error::Exhausted {
                start: 8500,
                end: 8999
            }
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            Error::SpawnFailed("no such binary".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn exhausted_message_names_the_range() {
        let e = Error::Exhausted {
            start: 8500,
            end: 8999,
        };
        assert_eq!(e.to_string(), "no free port in range 8500..=8999");
    }
}
