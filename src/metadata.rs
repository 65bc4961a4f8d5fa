//! Request metadata and configuration types.

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Everything needed to issue one request.
///
/// Built fresh for every call. Per-request `timeout` and `max_attempts`
/// override the client defaults.
#[derive(Debug, Clone)]
pub struct RequestMetadata {
    /// The HTTP method (GET, POST, etc.).
    pub method: Method,

    /// The request path, appended verbatim to the base URL.
    pub path: String,

    /// Additional headers for this request.
    pub headers: HeaderMap,

    /// Query parameters for this request.
    pub query_params: HashMap<String, String>,

    /// JSON body, if any.
    pub body: Option<Value>,

    /// Per-attempt timeout override.
    pub timeout: Option<Duration>,

    /// Total attempt budget override.
    pub max_attempts: Option<usize>,

    /// Lets the caller abandon the request.
    pub cancel: Option<CancelToken>,
}

impl RequestMetadata {
    /// Creates a new `RequestMetadata` with the given method and path.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            query_params: HashMap::new(),
            body: None,
            timeout: None,
            max_attempts: None,
            cancel: None,
        }
    }

    /// Adds a header to the request.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn with_header(
        mut self,
        name: impl AsRef<str>,
        value: impl AsRef<str>,
    ) -> Result<Self, crate::Error> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| crate::Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| crate::Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Adds a query parameter to the request.
    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }

    /// Serializes `body` as the JSON request body.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::SerializationFailed`] if the body cannot be
    /// represented as JSON.
    pub fn with_body<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, crate::Error> {
        let value = serde_json::to_value(body)
            .map_err(|e| crate::Error::SerializationFailed(e.to_string()))?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl Default for RequestMetadata {
    fn default() -> Self {
        Self::new(Method::GET, "")
    }
}

/// A cloneable handle for cancelling a request from outside.
///
/// Cancelling ends the in-flight attempt and the retry loop with
/// [`crate::Error::Cancelled`]. Cancellation is sticky.
///
/// # Examples
///
/// ```no_run
/// use tartrack_net::{metadata::{CancelToken, RequestMetadata}, Client};
/// use http::Method;
///
/// # async fn example(client: Client) {
/// let token = CancelToken::new();
/// let metadata = RequestMetadata::new(Method::GET, "/rides")
///     .with_cancel_token(token.clone());
///
/// // e.g. the screen was closed
/// token.cancel();
/// assert!(client.call(metadata).await.is_err());
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`CancelToken::cancel`] has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
