//! Seams to the outside world: the HTTP transport and the auth token source.
//!
//! The client talks to both through traits so the app can plug in its own
//! session store, and tests can script socket-level failures that a real
//! server cannot produce on demand.

use crate::error::BoxError;
use crate::Result;
use async_trait::async_trait;
use http::{header::CONTENT_TYPE, HeaderMap, Method, StatusCode};
use url::Url;

/// A fully prepared outbound request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    /// JSON-serialized body, if any.
    pub body: Option<String>,
}

/// A response as read off the wire.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl HttpResponse {
    /// The `Content-Type` header, or an empty string when absent or not UTF-8.
    pub fn content_type(&self) -> &str {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }
}

/// Issues a single HTTP exchange.
///
/// Implementations do not retry and do not enforce timeouts; the client
/// wraps every call with both.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// The default [`Transport`], backed by a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds a transport with a fresh connection pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder().build().map_err(|e| {
            crate::Error::ConfigurationError(format!("Failed to build HTTP client: {}", e))
        })?;
        Ok(Self { client })
    }

    /// Wraps an already configured `reqwest::Client`.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Supplies the bearer token for outbound requests.
///
/// Called once per request. A failure is logged and the request goes out
/// without an `Authorization` header.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> std::result::Result<Option<String>, BoxError>;
}

/// A [`TokenProvider`] that always returns the same token.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    /// A provider with no token.
    pub fn none() -> Self {
        Self(None)
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> std::result::Result<Option<String>, BoxError> {
        Ok(self.0.clone())
    }
}
