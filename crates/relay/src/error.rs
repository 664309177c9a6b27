use axum::http::StatusCode;
use thiserror::Error;

/// Gateway error kinds. The variant decides both the HTTP status surfaced
/// to the client and how the pipeline reacts (fail over, abort, log).
#[derive(Debug, Error, Clone)]
pub enum RelayError {
    /// Malformed client input.
    #[error("bad request: {0}")]
    BadWire(String),

    /// Incoming credential collection failed.
    #[error("authentication error: {0}")]
    AuthFailed(String),

    /// A named router is missing or the gateway is misconfigured.
    #[error("router misconfigured: {0}")]
    RouterMisconfig(String),

    /// Upstream HTTP non-2xx or transport error; the next candidate
    /// provider is tried.
    #[error("provider error: {0}")]
    Provider(String),

    /// A response-carrying plugin hook failed.
    #[error("plugin {plugin} failed: {message}")]
    Plugin { plugin: String, message: String },

    /// The driver failed before producing the first stream chunk.
    #[error("stream start failed: {0}")]
    StreamStart(String),

    /// Emitting a response in the client wire format failed.
    #[error("response emission failed: {0}")]
    Emit(String),

    #[error("{0}")]
    Internal(String),
}

impl RelayError {
    pub fn plugin(plugin: impl Into<String>, message: impl std::fmt::Display) -> Self {
        RelayError::Plugin {
            plugin: plugin.into(),
            message: message.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::BadWire(_) => StatusCode::BAD_REQUEST,
            RelayError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            RelayError::RouterMisconfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Provider(_) | RelayError::StreamStart(_) => StatusCode::BAD_GATEWAY,
            RelayError::Plugin { .. } | RelayError::Emit(_) | RelayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(error: reqwest::Error) -> Self {
        RelayError::Provider(error.to_string())
    }
}
