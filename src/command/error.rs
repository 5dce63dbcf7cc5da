//! Error taxonomy of the command executor.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

// =============================================================================
// Remote Error
// =============================================================================

/// Transport-level failure reported by a [`RemoteCall`](super::RemoteCall).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// The server could not be reached.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The server answered with a non-2xx status.
    #[error("HTTP {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Server-provided message or canonical reason.
        message: String,
    },

    /// The response did not have the expected shape.
    #[error("unexpected response: {0}")]
    Decode(String),

    /// Any other transport failure (body read, TLS, redirect loop).
    #[error("transport error: {0}")]
    Transport(String),
}

impl RemoteError {
    /// Normalized kind of this failure.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout | Self::Connect(_) | Self::Transport(_) => ErrorKind::Network,
            Self::Decode(_) => ErrorKind::Validation,
            Self::Status { status, .. } => match *status {
                401 => ErrorKind::Unauthorized,
                400 | 409 | 422 => ErrorKind::Validation,
                500..=599 => ErrorKind::Server,
                _ => ErrorKind::Unknown,
            },
        }
    }
}

// =============================================================================
// Error Kind
// =============================================================================

/// Normalized failure category of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unreachable server, dropped connection or timeout. Transient.
    Network,
    /// The credential was rejected. Triggers session teardown.
    Unauthorized,
    /// The request or the response was malformed. Surfaced to the caller only.
    Validation,
    /// 5xx response. Transient.
    Server,
    /// Anything else.
    Unknown,
}

impl ErrorKind {
    /// Transient kinds are retried by the next poll tick or reconnect.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Network | Self::Server)
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Unauthorized => "unauthorized",
            Self::Validation => "validation",
            Self::Server => "server",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

// =============================================================================
// Command Error
// =============================================================================

/// Failure half of a [`CommandResult`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct CommandError {
    /// Normalized category.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl CommandError {
    /// Creates a command error.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<RemoteError> for CommandError {
    fn from(error: RemoteError) -> Self {
        Self::new(error.kind(), error.to_string())
    }
}

/// Uniform outcome of one remote call: the data, or a normalized error.
pub type CommandResult<T> = Result<T, CommandError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn status(code: u16) -> RemoteError {
        RemoteError::Status {
            status: code,
            message: "x".to_string(),
        }
    }

    #[rstest]
    #[case(RemoteError::Timeout, ErrorKind::Network)]
    #[case(RemoteError::Connect("refused".to_string()), ErrorKind::Network)]
    #[case(RemoteError::Transport("reset".to_string()), ErrorKind::Network)]
    #[case(RemoteError::Decode("missing tickets".to_string()), ErrorKind::Validation)]
    #[case(status(401), ErrorKind::Unauthorized)]
    #[case(status(400), ErrorKind::Validation)]
    #[case(status(422), ErrorKind::Validation)]
    #[case(status(409), ErrorKind::Validation)]
    #[case(status(500), ErrorKind::Server)]
    #[case(status(503), ErrorKind::Server)]
    #[case(status(403), ErrorKind::Unknown)]
    #[case(status(404), ErrorKind::Unknown)]
    fn test_remote_error_kind(#[case] error: RemoteError, #[case] expected: ErrorKind) {
        assert_eq!(error.kind(), expected);
    }

    #[rstest]
    fn test_command_error_from_remote_keeps_message() {
        let error = CommandError::from(status(503));

        assert_eq!(error.kind, ErrorKind::Server);
        assert_eq!(error.to_string(), "server: HTTP 503: x");
    }

    #[rstest]
    fn test_transient_kinds() {
        assert!(ErrorKind::Network.is_transient());
        assert!(ErrorKind::Server.is_transient());
        assert!(!ErrorKind::Unauthorized.is_transient());
        assert!(!ErrorKind::Validation.is_transient());
    }
}
