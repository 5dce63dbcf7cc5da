//! Uniform wrapper around exactly one remote call.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use super::error::{CommandError, CommandResult, ErrorKind, RemoteError};
use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::session::SessionContext;

// =============================================================================
// Remote Call
// =============================================================================

/// A reference to one remote operation.
///
/// Implementations perform the network round trip and decode the response
/// into typed data; they never retry and never enforce a timeout themselves.
pub trait RemoteCall: Send + Sync {
    /// Arguments of the call.
    type Args: Send + 'static;
    /// Decoded response.
    type Output: Send + 'static;

    /// Short name for logs (`"fetch tickets"`).
    fn name(&self) -> &str;

    /// Starts the call.
    fn call(&self, args: Self::Args) -> BoxFuture<'static, Result<Self::Output, RemoteError>>;
}

// =============================================================================
// Command Executor
// =============================================================================

/// Executes remote calls and normalizes their outcome into a [`CommandResult`].
///
/// - exactly one network operation per [`execute`](Self::execute), no retry
/// - a fixed timeout; expiry is reported as [`ErrorKind::Network`]
/// - an [`ErrorKind::Unauthorized`] outcome invalidates the session
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    session: Arc<SessionContext>,
    timeout: Duration,
}

impl CommandExecutor {
    /// Creates an executor with the default 10 second timeout.
    #[must_use]
    pub const fn new(session: Arc<SessionContext>) -> Self {
        Self::with_timeout(session, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Creates an executor with a custom timeout.
    #[must_use]
    pub const fn with_timeout(session: Arc<SessionContext>, timeout: Duration) -> Self {
        Self { session, timeout }
    }

    /// Timeout applied to every call.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Session this executor reports unauthorized responses to.
    #[must_use]
    pub const fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    /// Performs `call` once with `args`.
    ///
    /// # Errors
    ///
    /// Returns a [`CommandError`] whose kind is one of `network`,
    /// `unauthorized`, `validation`, `server` or `unknown`.
    #[allow(clippy::cast_possible_truncation)] // elapsed milliseconds fit in u64
    pub async fn execute<C>(&self, call: &C, args: C::Args) -> CommandResult<C::Output>
    where
        C: RemoteCall + ?Sized,
    {
        let started = tokio::time::Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, call.call(args)).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(error)) => Err(CommandError::from(error)),
            Err(_) => Err(CommandError::from(RemoteError::Timeout)),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            Ok(_) => tracing::debug!(call = call.name(), elapsed_ms, "command succeeded"),
            Err(error) if error.kind == ErrorKind::Unauthorized => {
                tracing::warn!(call = call.name(), elapsed_ms, error_kind = %error.kind, "command unauthorized");
                self.session.invalidate();
            }
            Err(error) => tracing::warn!(
                call = call.name(),
                elapsed_ms,
                error_kind = %error.kind,
                message = %error.message,
                "command failed"
            ),
        }
        outcome
    }
}
