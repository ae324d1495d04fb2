// Error handling module
// Typed failures returned by the request client

use serde_json::{json, Value};
use thiserror::Error;

/// Payload reported for requests that never received a response
pub const NO_RESPONSE_MESSAGE: &str = "No response received";

/// Failure of a token refresh
///
/// Cloned to every request waiting on the refresh, so it carries owned
/// strings rather than source errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RefreshError {
    /// No refresh token in the credential store
    #[error("No refresh token available")]
    MissingRefreshToken,

    /// Refresh endpoint unreachable
    #[error("Refresh request failed: {0}")]
    Transport(String),

    /// Refresh endpoint answered with a non-2xx HTTP status
    #[error("Refresh endpoint returned HTTP {status}")]
    Http { status: u16, body: Value },

    /// HTTP succeeded but the application status code was not 200
    #[error("Refresh rejected with status code {status_code}: {message}")]
    Rejected { status_code: u16, message: String },

    /// Body did not match the token envelope
    #[error("Invalid refresh response: {0}")]
    InvalidResponse(String),

    /// New credentials could not be persisted
    #[error("Failed to persist refreshed credentials: {0}")]
    Store(String),

    /// The refreshing request went away before the refresh settled
    #[error("Token refresh was abandoned")]
    Abandoned,
}

impl RefreshError {
    /// HTTP status of the refresh response, when there was one
    pub fn status(&self) -> Option<u16> {
        match self {
            RefreshError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Failures surfaced to application code by the request client
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    /// 401 on a request that was already replayed after a refresh
    #[error("Authentication expired: {status}")]
    AuthExpired { status: u16, body: Value },

    /// Token refresh failed; the session has been signed out
    #[error("Token refresh failed: {0}")]
    RefreshFailed(#[from] RefreshError),

    /// Non-2xx response from the API
    #[error("API error: {status} - {body}")]
    Server { status: u16, body: Value },

    /// No response was received
    #[error("Network error: {0}")]
    Network(String),

    /// The request could not be built
    #[error("Request setup error: {0}")]
    RequestSetup(String),

    /// Credentials could not be read or written
    #[error("Credential storage error: {0}")]
    Storage(String),
}

impl ApiError {
    /// HTTP status to report to the caller, `None` when no response applies
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::AuthExpired { status, .. } | ApiError::Server { status, .. } => Some(*status),
            ApiError::RefreshFailed(err) => err.status(),
            ApiError::Network(_) | ApiError::RequestSetup(_) | ApiError::Storage(_) => None,
        }
    }

    /// Error value exposed in the response envelope
    pub fn payload(&self) -> Value {
        match self {
            ApiError::AuthExpired { body, .. } | ApiError::Server { body, .. } => body.clone(),
            ApiError::RefreshFailed(err) => json!(err.to_string()),
            ApiError::Network(_) => json!(NO_RESPONSE_MESSAGE),
            ApiError::RequestSetup(msg) | ApiError::Storage(msg) => json!(msg),
        }
    }

    /// Whether the session was signed out as part of this failure
    pub fn is_session_expired(&self) -> bool {
        matches!(self, ApiError::RefreshFailed(_))
    }
}

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, ApiError>;
