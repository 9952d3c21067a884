use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{DisconnectReason, SourceEvent};

/// Broad error category used for user-facing handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid request or endpoint configuration.
    Config,
    /// Authentication/authorization failure.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by the server.
    RateLimited,
    /// Malformed or unexpected stream content.
    Protocol,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable failure kinds reported by the connection manager.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StreamErrorKind {
    /// The transport reported a failure.
    SourceError,
    /// No `open` arrived within the connect budget.
    ConnectTimeout,
    /// No traffic arrived within the idle budget.
    IdleTimeout,
}

impl StreamErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            Self::SourceError => "source-error",
            Self::ConnectTimeout => "connect-timeout",
            Self::IdleTimeout => "idle-timeout",
        }
    }
}

/// Error notification published by the connection manager.
///
/// Every kind is non-fatal on its own; the client only settles in
/// `Stopped` once the reconnect policy is exhausted or disabled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{}: {message}", kind.code())]
pub struct StreamError {
    pub kind: StreamErrorKind,
    pub reason: DisconnectReason,
    pub category: ErrorCategory,
    pub message: String,
    /// HTTP status when the transport failed on a non-success response.
    pub status: Option<u16>,
}

impl StreamError {
    /// Map a transport error event to a `source-error`.
    pub fn from_source(event: &SourceEvent) -> Self {
        let message = event
            .message
            .as_deref()
            .map(str::trim)
            .filter(|message| !message.is_empty())
            .unwrap_or("event stream source error")
            .to_owned();

        Self {
            kind: StreamErrorKind::SourceError,
            reason: DisconnectReason::Error,
            category: event
                .status
                .map(classify_http_status)
                .unwrap_or(ErrorCategory::Network),
            message,
            status: event.status,
        }
    }

    pub fn connect_timeout() -> Self {
        Self {
            kind: StreamErrorKind::ConnectTimeout,
            reason: DisconnectReason::ConnectTimeout,
            category: ErrorCategory::Network,
            message: "event stream timed out before opening".to_owned(),
            status: None,
        }
    }

    pub fn idle_timeout() -> Self {
        Self {
            kind: StreamErrorKind::IdleTimeout,
            reason: DisconnectReason::IdleTimeout,
            category: ErrorCategory::Network,
            message: "event stream idle timeout reached".to_owned(),
            status: None,
        }
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> ErrorCategory {
    match status {
        401 | 403 => ErrorCategory::Auth,
        408 | 429 => ErrorCategory::RateLimited,
        400..=499 => ErrorCategory::Config,
        500..=599 => ErrorCategory::Network,
        _ => ErrorCategory::Internal,
    }
}
