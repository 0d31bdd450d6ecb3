use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use thiserror::Error;

/// Per-call outcomes surfaced to the caller. Everything except `Transport`
/// is terminal for the request; the client re-fetches state and decides.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotAuthorized(String),
    #[error("{0}")]
    InvalidTransition(String),
    #[error("offer has already been resolved")]
    AlreadyResolved,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("database error: {0}")]
    Database(String),
}

impl actix_web::ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotAuthorized(_) => StatusCode::FORBIDDEN,
            Self::InvalidTransition(_) | Self::AlreadyResolved => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(serde_json::json!({ "detail": self.to_string() }))
    }
}

impl From<diesel::result::Error> for ServiceError {
    fn from(e: diesel::result::Error) -> Self {
        match e {
            diesel::result::Error::NotFound => Self::NotFound("record"),
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
