//! `reqwest`-backed [`JsonTransport`].

use std::fmt;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use super::calls::{JsonTransport, Method};
use super::error::RemoteError;
use crate::fetch_key::FetchParams;
use crate::session::SessionContext;

// =============================================================================
// HTTP Transport
// =============================================================================

/// JSON over HTTP against the API base URL.
///
/// Every request carries the session's bearer token, read at send time so a
/// credential installed after startup is picked up. Timeouts are enforced by
/// the [`CommandExecutor`](super::CommandExecutor), not by the client.
#[derive(Clone)]
pub struct HttpTransport {
    /// HTTP client.
    client: reqwest::Client,
    /// Base URL, without trailing slash.
    base_url: String,
    /// Source of the bearer token.
    session: Arc<SessionContext>,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Creates a transport with a default client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - API base URL (`http://localhost:5000/api`).
    /// * `session` - Session providing the bearer token.
    #[must_use]
    pub fn new(base_url: impl Into<String>, session: Arc<SessionContext>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, session)
    }

    /// Creates a transport sharing an existing client.
    #[must_use]
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        session: Arc<SessionContext>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
        }
    }

    /// Base URL requests are resolved against.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.session.bearer_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl JsonTransport for HttpTransport {
    fn get_json(
        &self,
        path: &str,
        query: &FetchParams,
    ) -> BoxFuture<'static, Result<Value, RemoteError>> {
        let request = self.authorize(self.client.get(self.url(path)).query(query));
        async move {
            let response = request.send().await.map_err(map_request_error)?;
            read_json(response).await
        }
        .boxed()
    }

    fn send_json(
        &self,
        method: Method,
        path: &str,
        body: Value,
    ) -> BoxFuture<'static, Result<Value, RemoteError>> {
        let method = match method {
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };
        let request = self.authorize(self.client.request(method, self.url(path)).json(&body));
        async move {
            let response = request.send().await.map_err(map_request_error)?;
            read_json(response).await
        }
        .boxed()
    }
}

// =============================================================================
// Response Mapping
// =============================================================================

/// Maps a `reqwest` failure into the transport taxonomy.
pub(crate) fn map_request_error(error: reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        RemoteError::Timeout
    } else if error.is_connect() {
        RemoteError::Connect(error.to_string())
    } else if let Some(status) = error.status() {
        RemoteError::Status {
            status: status.as_u16(),
            message: error.to_string(),
        }
    } else {
        RemoteError::Transport(error.to_string())
    }
}

/// Converts a non-2xx response into [`RemoteError::Status`].
pub(crate) async fn reject_status(response: reqwest::Response) -> RemoteError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    RemoteError::Status {
        status: status.as_u16(),
        message: error_message(&text)
            .or_else(|| status.canonical_reason().map(str::to_string))
            .unwrap_or_else(|| status.to_string()),
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value, RemoteError> {
    if !response.status().is_success() {
        return Err(reject_status(response).await);
    }
    let text = response.text().await.map_err(map_request_error)?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|error| RemoteError::Decode(error.to_string()))
}

/// Extracts `message` or `error` from an error body.
fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["message", "error"]
        .iter()
        .find_map(|field| value.get(field).and_then(Value::as_str))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(r#"{ "message": "Ticket not found" }"#, Some("Ticket not found"))]
    #[case(r#"{ "error": "Invalid token" }"#, Some("Invalid token"))]
    #[case(r#"{ "message": "first", "error": "second" }"#, Some("first"))]
    #[case(r#"{ "detail": 3 }"#, None)]
    #[case("<html>Bad Gateway</html>", None)]
    fn test_error_message_extraction(#[case] body: &str, #[case] expected: Option<&str>) {
        assert_eq!(error_message(body).as_deref(), expected);
    }

    #[rstest]
    fn test_url_joins_base_and_path() {
        let transport = HttpTransport::new(
            "http://localhost:5000/api/",
            Arc::new(SessionContext::anonymous()),
        );

        assert_eq!(transport.base_url(), "http://localhost:5000/api");
        assert_eq!(transport.url("/tickets"), "http://localhost:5000/api/tickets");
    }

    #[rstest]
    #[tokio::test]
    async fn test_unreachable_server_is_a_network_failure() {
        let transport = HttpTransport::new(
            "http://127.0.0.1:9",
            Arc::new(SessionContext::anonymous()),
        );

        let error = transport
            .get_json("/tickets", &FetchParams::new())
            .await
            .unwrap_err();

        assert!(error.kind().is_transient(), "{error:?}");
    }
}
