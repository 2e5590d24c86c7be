use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("missing bearer token")]
    AuthMissing,
    #[error("invalid bearer token")]
    AuthInvalid,
    #[error("model not found: {model}")]
    ModelNotFound { model: String },
    #[error("group {group} does not accept {requested} requests")]
    ProtocolMismatch { group: String, requested: String },
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error("all providers failed: {last_error}")]
    AllProvidersFailed { last_error: String },
    #[error("api error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("invalid endpoint url: {0}")]
    InvalidEndpoint(String),
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

impl RelayError {
    /// HTTP status the gateway answers with for this error class.
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::AuthMissing | RelayError::AuthInvalid => StatusCode::UNAUTHORIZED,
            RelayError::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            RelayError::ProtocolMismatch { .. } => StatusCode::BAD_REQUEST,
            RelayError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            RelayError::AllProvidersFailed { .. }
            | RelayError::Api { .. }
            | RelayError::InvalidEndpoint(_)
            | RelayError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RelayError::AuthMissing => "missing_token",
            RelayError::AuthInvalid => "invalid_token",
            RelayError::ModelNotFound { .. } => "model_not_found",
            RelayError::ProtocolMismatch { .. } => "protocol_mismatch",
            RelayError::BodyTooLarge { .. } => "body_too_large",
            RelayError::AllProvidersFailed { .. } => "all_providers_failed",
            RelayError::Api { .. } | RelayError::Upstream(_) => "upstream_error",
            RelayError::InvalidEndpoint(_) => "invalid_endpoint",
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
