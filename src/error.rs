//! # Error Handling
//!
//! Crate-wide error aggregate. Each module keeps its own `thiserror` enum;
//! [`Error`] wraps them so callers can use one `Result` type and still map
//! failures to a stable error code and retry classification.

use thiserror::Error;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::connectors::{DriveError, EmailError, ErrorKind, ProviderError, SlackError};
use crate::db::DatabaseError;
use crate::sharing::PropagationError;
use crate::telemetry::TelemetryInitError;

/// Longest vendor body kept in error messages, in characters.
pub const BODY_SNIPPET_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryInitError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Drive(#[from] DriveError),
    #[error(transparent)]
    Email(#[from] EmailError),
    #[error(transparent)]
    Slack(#[from] SlackError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Propagation(#[from] PropagationError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Error code string (SCREAMING_SNAKE_CASE) for logs and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_INVALID",
            Error::Telemetry(_) => "TELEMETRY_INIT_FAILED",
            Error::Auth(_) => "UNAUTHORIZED",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Propagation(PropagationError::EmptyRoot) => "VALIDATION_FAILED",
            Error::Propagation(PropagationError::Incomplete { .. }) => "SHARE_INCOMPLETE",
            _ => match self.kind() {
                Some(ErrorKind::Unauthorized) => "UNAUTHORIZED",
                Some(ErrorKind::RateLimited { .. }) => "RATE_LIMITED",
                Some(ErrorKind::Transient) => "SERVICE_UNAVAILABLE",
                _ => "PROVIDER_ERROR",
            },
        }
    }

    /// Vendor classification, for errors that came from a remote API.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Drive(e) => Some(e.kind()),
            Error::Email(e) => Some(e.kind()),
            Error::Slack(e) => Some(e.kind()),
            Error::Provider(e) => Some(e.kind.clone()),
            Error::Auth(_) => Some(ErrorKind::Unauthorized),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_some_and(|k| k.is_retryable())
    }

    /// Suggested retry delay in seconds, when the vendor sent one.
    pub fn retry_after(&self) -> Option<u64> {
        self.kind().and_then(|k| k.retry_after_secs())
    }
}

/// Truncate a response body on a character boundary, marking the cut with `...`.
pub fn body_snippet(body: &str) -> String {
    if body.chars().count() > BODY_SNIPPET_CHARS {
        let truncated: String = body.chars().take(BODY_SNIPPET_CHARS).collect();
        format!("{}...", truncated)
    } else {
        body.to_string()
    }
}
