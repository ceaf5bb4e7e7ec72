//! Error taxonomy shared by the key store, translator, relay and handlers.
//!
//! Every variant maps to a stable HTTP status. How the error is rendered
//! depends on the caller's wire format (see `util::format_error_response`).

use http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("No API keys available")]
    NoKeysAvailable,

    #[error("Invalid API key: {0}")]
    InvalidKey(String),

    #[error("Key index {index} out of range for {len} keys")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid password")]
    Unauthorized,
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidKey(_)
            | ProxyError::IndexOutOfRange { .. }
            | ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyError::NoKeysAvailable | ProxyError::ServiceUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::Upstream(_) | ProxyError::Persistence(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message that is safe to hand back to a client.
    ///
    /// Upstream and storage details stay in the server log.
    pub fn client_message(&self) -> String {
        match self {
            ProxyError::NoKeysAvailable | ProxyError::ServiceUnavailable(_) => {
                "No API keys configured".to_string()
            }
            ProxyError::InvalidKey(_) => "API key is required".to_string(),
            ProxyError::IndexOutOfRange { .. } => "Invalid key index".to_string(),
            ProxyError::InvalidRequest(msg) => msg.clone(),
            ProxyError::Upstream(_) | ProxyError::Persistence(_) => {
                "Internal server error".to_string()
            }
            ProxyError::Unauthorized => "Invalid password".to_string(),
        }
    }

    /// Error `type` string used by both OpenAI and Anthropic envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::InvalidKey(_)
            | ProxyError::IndexOutOfRange { .. }
            | ProxyError::InvalidRequest(_) => "invalid_request_error",
            ProxyError::Unauthorized => "authentication_error",
            ProxyError::NoKeysAvailable | ProxyError::ServiceUnavailable(_) => "api_error",
            ProxyError::Upstream(_) | ProxyError::Persistence(_) => "api_error",
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::Upstream(err.to_string())
    }
}
