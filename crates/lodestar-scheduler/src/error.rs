//! Error types for the scheduler.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use lodestar_state::StoreError;
use thiserror::Error;

/// Scheduler errors.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Storage failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The request is malformed or incomplete.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The named queue does not exist.
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// A concurrent update won repeatedly.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The request deadline elapsed.
    #[error("deadline exceeded")]
    Timeout,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SchedulerError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// HTTP status for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::QueueNotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Timeout | Self::Store(StoreError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            Self::Store(_) | Self::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for SchedulerError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let message = match &self {
            Self::InvalidArgument(_)
            | Self::QueueNotFound(_)
            | Self::Conflict(_)
            | Self::Timeout => self.to_string(),
            Self::Store(StoreError::Timeout) => "Store timeout".to_owned(),
            Self::Store(_) | Self::Config(_) => {
                tracing::error!(error = %self, "Request failed");
                "Internal server error".to_owned()
            }
        };

        (status, message).into_response()
    }
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;
