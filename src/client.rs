//! The resilient request client.
//!
//! [`Client`] is the single entry point screens and services use to reach the
//! backend. Each call goes through the same pipeline:
//!
//! 1. Merge the fixed JSON headers, the client's default headers, the
//!    health-tracker headers, the caller's headers, and the bearer token.
//! 2. Send with a per-attempt timeout.
//! 3. On failure, classify the error. Timeouts, connection failures, socket
//!    errors, and 5xx responses are retried in-process with backoff.
//!    Socket-level failures that point at a broken pool go to the
//!    [`RecoveryCoordinator`], which owns the request from then on. Anything
//!    else (4xx, bad configuration) is returned at once.
//!
//! A fired [`CancelToken`] ends the call with [`Error::Cancelled`] at any of
//! these stages, including while it waits on a recovery.
//! 4. On success, normalize the body so callers always get structured data.

use crate::{
    classify::{ErrorClass, ErrorCounts, ErrorStats},
    health::{ConnectionHealth, HealthConfig},
    metadata::{CancelToken, RequestMetadata},
    normalize::{self, create_safe_response, ParsedBody},
    recovery::{
        HealthProbe, RecoveryConfig, RecoveryCoordinator, RecoveryStatus, Replay, ReplayFuture,
    },
    retry::RetryPolicy,
    transport::{HttpRequest, HttpResponse, ReqwestTransport, TokenProvider, Transport},
    Error, Response, Result,
};
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(35);

/// An HTTP client with retries, connection recovery, and response normalization.
///
/// Create one per app process and share it; clones share the same health and
/// recovery state.
///
/// # Examples
///
/// ```no_run
/// use tartrack_net::{Client, StaticToken};
/// use serde::Serialize;
/// use std::time::Duration;
///
/// #[derive(Serialize)]
/// struct NewBooking {
///     package_id: u64,
///     passengers: u8,
/// }
///
/// # async fn example() -> Result<(), tartrack_net::Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com/api")?
///     .timeout(Duration::from_secs(35))
///     .token_provider(StaticToken::new("session-token"))
///     .build()?;
///
/// let packages = client.get("/tour-packages/").await?;
/// println!("Packages: {}", packages.data);
///
/// let booking = NewBooking { package_id: 4, passengers: 2 };
/// let created = client.post("/bookings/", &booking).await?;
/// println!("Created: {} after {} attempt(s)", created.data, created.attempts);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    base_url: String,
    default_headers: HeaderMap,
    token_provider: Option<Arc<dyn TokenProvider>>,
    retry_policy: RetryPolicy,
    timeout: Duration,
    health: Arc<ConnectionHealth>,
    recovery: RecoveryCoordinator,
    stats: ErrorStats,
}

impl Client {
    /// Creates a new `ClientBuilder` for configuring a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Issues a request.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] when every attempt timed out.
    /// - [`Error::Http`] for a 4xx response (first occurrence) or a 5xx that
    ///   outlived the retry budget.
    /// - [`Error::RecoveryFailed`], [`Error::StillUnstable`], or
    ///   [`Error::RecoveryExhausted`] when connection recovery did not help.
    /// - [`Error::Cancelled`] if the request's [`CancelToken`] fired.
    pub async fn call(&self, metadata: RequestMetadata) -> Result<Response> {
        self.execute(metadata, true).await
    }

    async fn execute(&self, metadata: RequestMetadata, allow_recovery: bool) -> Result<Response> {
        let start_time = Instant::now();
        let url = self.url_for(&metadata)?;
        let body = metadata
            .body
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::SerializationFailed(e.to_string()))?;
        let headers = self.request_headers(&metadata).await;
        let timeout = metadata.timeout.unwrap_or(self.inner.timeout);
        let policy = RetryPolicy {
            max_attempts: metadata
                .max_attempts
                .unwrap_or(self.inner.retry_policy.max_attempts)
                .max(1),
            ..self.inner.retry_policy.clone()
        };
        let cancel = metadata.cancel.as_ref();

        let mut attempt = 0;
        loop {
            attempt += 1;

            tracing::debug!(
                method = %metadata.method,
                url = %url,
                attempt = attempt,
                "Executing HTTP request"
            );

            let request = HttpRequest {
                method: metadata.method.clone(),
                url: url.clone(),
                headers: headers.clone(),
                body: body.clone(),
            };

            let error = match self.send_attempt(request, timeout, cancel).await {
                Ok(response) if response.status.is_success() => {
                    self.inner.health.record_success();
                    return Ok(self.finish(response, start_time.elapsed(), attempt));
                }
                Ok(response) => http_error(response),
                Err(e) => e,
            };

            let class = error.class();
            self.inner.stats.record(class);

            tracing::warn!(
                error = %error,
                class = ?class,
                attempt = attempt,
                method = %metadata.method,
                path = %metadata.path,
                "Request failed"
            );

            match class {
                ErrorClass::RecoverableTransport if allow_recovery => {
                    // Recovery owns the request from here; no more local attempts.
                    let replay = self.replay(&metadata);
                    let recovery = self.inner.recovery.handle_connection_error(error, replay);
                    return tokio::select! {
                        biased;
                        _ = wait_for_cancel(cancel) => Err(Error::Cancelled),
                        outcome = recovery => outcome,
                    };
                }
                ErrorClass::RecoverableTransport | ErrorClass::Unknown => return Err(error),
                ErrorClass::Timeout => match policy.delay_after(class, attempt) {
                    Some(delay) => self.pause(delay, attempt, cancel).await?,
                    None => return Err(Error::Timeout),
                },
                ErrorClass::Connection | ErrorClass::Socket | ErrorClass::Server5xx => {
                    self.inner.health.record_failure();
                    match policy.delay_after(class, attempt) {
                        Some(delay) => {
                            self.pause(delay, attempt, cancel).await?;
                            if class == ErrorClass::Socket && attempt > 1 {
                                self.inner.health.force_reset();
                            }
                        }
                        None => return Err(error),
                    }
                }
            }
        }
    }

    /// Sends one attempt, bounded by `timeout` and the caller's cancel token.
    async fn send_attempt(
        &self,
        request: HttpRequest,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<HttpResponse> {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(Error::Cancelled);
        }

        let exchange = tokio::time::timeout(timeout, self.inner.transport.send(request));
        tokio::select! {
            biased;
            _ = wait_for_cancel(cancel) => Err(Error::Cancelled),
            outcome = exchange => outcome.unwrap_or_else(|_| Err(Error::Timeout)),
        }
    }

    async fn pause(
        &self,
        delay: Duration,
        attempt: usize,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        tracing::info!(
            delay_ms = delay.as_millis(),
            attempt = attempt,
            "Retrying request after delay"
        );

        tokio::select! {
            biased;
            _ = wait_for_cancel(cancel) => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Builds the thunk the recovery coordinator uses to re-issue a request.
    ///
    /// Replays run the full retry loop but never escalate to recovery again.
    fn replay(&self, metadata: &RequestMetadata) -> Replay {
        let client = self.clone();
        let metadata = metadata.clone();
        Box::new(move || -> ReplayFuture {
            Box::pin(async move { client.execute(metadata, false).await })
        })
    }

    fn url_for(&self, metadata: &RequestMetadata) -> Result<Url> {
        let mut url = Url::parse(&format!("{}{}", self.inner.base_url, metadata.path))?;
        if !metadata.query_params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &metadata.query_params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    async fn request_headers(&self, metadata: &RequestMetadata) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let health_headers = self.inner.health.headers();
        for source in [&self.inner.default_headers, &health_headers, &metadata.headers] {
            for (name, value) in source {
                headers.insert(name.clone(), value.clone());
            }
        }

        if let Some(provider) = &self.inner.token_provider {
            match provider.token().await {
                Ok(Some(token)) => match HeaderValue::from_str(&format!("Bearer {}", token)) {
                    Ok(mut value) => {
                        value.set_sensitive(true);
                        headers.insert(AUTHORIZATION, value);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Auth token is not a valid header value");
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Auth token provider failed, sending request without token"
                    );
                }
            }
        }

        headers
    }

    /// Turns a 2xx response into the uniform envelope.
    fn finish(&self, response: HttpResponse, latency: Duration, attempts: usize) -> Response {
        let data = match normalize::parse(&response.body, response.content_type()) {
            ParsedBody::Json(value @ Value::Object(_)) => value,
            ParsedBody::Json(value) => create_safe_response(value, true, None).into_value(),
            ParsedBody::Fallback(fallback) => fallback.into_value(),
        };

        tracing::info!(
            status = response.status.as_u16(),
            latency_ms = latency.as_millis(),
            attempts = attempts,
            "Received HTTP response"
        );

        Response {
            success: true,
            data,
            status: response.status,
            raw_body: response.body,
            headers: response.headers,
            latency,
            attempts,
        }
    }

    /// Makes a GET request to the specified path.
    pub async fn get(&self, path: impl Into<String>) -> Result<Response> {
        self.call(RequestMetadata::new(Method::GET, path)).await
    }

    /// Makes a POST request with a JSON body.
    pub async fn post<Req>(&self, path: impl Into<String>, body: &Req) -> Result<Response>
    where
        Req: Serialize + ?Sized,
    {
        self.call(RequestMetadata::new(Method::POST, path).with_body(body)?)
            .await
    }

    /// Makes a PUT request with a JSON body.
    pub async fn put<Req>(&self, path: impl Into<String>, body: &Req) -> Result<Response>
    where
        Req: Serialize + ?Sized,
    {
        self.call(RequestMetadata::new(Method::PUT, path).with_body(body)?)
            .await
    }

    /// Makes a PATCH request with a JSON body.
    pub async fn patch<Req>(&self, path: impl Into<String>, body: &Req) -> Result<Response>
    where
        Req: Serialize + ?Sized,
    {
        self.call(RequestMetadata::new(Method::PATCH, path).with_body(body)?)
            .await
    }

    /// Makes a DELETE request to the specified path.
    pub async fn delete(&self, path: impl Into<String>) -> Result<Response> {
        self.call(RequestMetadata::new(Method::DELETE, path)).await
    }

    /// Headers the health tracker would attach right now, for callers that
    /// talk to the backend without going through this client.
    pub fn connection_headers(&self) -> HeaderMap {
        self.inner.health.headers()
    }

    pub fn recovery_status(&self) -> RecoveryStatus {
        self.inner.recovery.status()
    }

    /// Failed attempts counted per classification since the last reset.
    pub fn error_stats(&self) -> ErrorCounts {
        self.inner.stats.snapshot()
    }

    pub fn health(&self) -> &ConnectionHealth {
        &self.inner.health
    }

    pub fn recovery(&self) -> &RecoveryCoordinator {
        &self.inner.recovery
    }

    /// Clears health, recovery, and counter state, e.g. on logout.
    ///
    /// Requests queued behind a recovery resolve with
    /// [`Error::RecoveryFailed`].
    pub fn reset(&self) {
        self.inner.recovery.reset();
        self.inner.health.reset();
        self.inner.stats.reset();
    }
}

async fn wait_for_cancel(token: Option<&CancelToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn http_error(response: HttpResponse) -> Error {
    let status = response.status;
    let message = match normalize::parse(&response.body, response.content_type()) {
        ParsedBody::Json(body) => ["error", "message"]
            .iter()
            .find_map(|field| body.get(field).and_then(Value::as_str).map(str::to_string)),
        ParsedBody::Fallback(_) => None,
    }
    .unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("Unknown error")
            .to_string()
    });

    if status.is_client_error() {
        tracing::error!(
            status = status.as_u16(),
            response = %response.body,
            "Client error (4xx)"
        );
    } else if status.is_server_error() {
        tracing::warn!(
            status = status.as_u16(),
            response = %response.body,
            "Server error (5xx)"
        );
    }

    Error::Http {
        status,
        message,
        raw_response: response.body,
        headers: response.headers,
    }
}

/// Builder for configuring and creating a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use tartrack_net::{ClientBuilder, RetryPolicy, recovery::RecoveryConfig};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), tartrack_net::Error> {
/// let client = ClientBuilder::new()
///     .base_url("https://api.example.com/api")?
///     .timeout(Duration::from_secs(20))
///     .retry_policy(RetryPolicy::default())
///     .recovery_config(RecoveryConfig {
///         probe_path: "/health/".to_string(),
///         ..Default::default()
///     })
///     .default_header("X-Client", "tartrack-mobile")?
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    base_url: Option<String>,
    default_headers: HeaderMap,
    retry_policy: RetryPolicy,
    timeout: Duration,
    transport: Option<Arc<dyn Transport>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    health_config: HealthConfig,
    recovery_config: RecoveryConfig,
}

impl ClientBuilder {
    /// Creates a new `ClientBuilder` with default settings.
    pub fn new() -> Self {
        Self {
            base_url: None,
            default_headers: HeaderMap::new(),
            retry_policy: RetryPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
            transport: None,
            token_provider: None,
            health_config: HealthConfig::default(),
            recovery_config: RecoveryConfig::default(),
        }
    }

    /// Sets the API origin. Request paths are appended to it verbatim.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        let url = url.as_ref();
        Url::parse(url)?;
        self.base_url = Some(url.to_string());
        Ok(self)
    }

    /// Adds a default header that will be included in all requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn default_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets the per-attempt timeout. Defaults to 35 seconds.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replaces the default reqwest-backed transport.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn token_provider(mut self, provider: impl TokenProvider + 'static) -> Self {
        self.token_provider = Some(Arc::new(provider));
        self
    }

    pub fn health_config(mut self, config: HealthConfig) -> Self {
        self.health_config = config;
        self
    }

    pub fn recovery_config(mut self, config: RecoveryConfig) -> Self {
        self.recovery_config = config;
        self
    }

    /// Builds the configured `Client`.
    ///
    /// # Errors
    ///
    /// Returns an error if no base URL was provided, the probe URL is invalid,
    /// or the default transport cannot be created.
    pub fn build(self) -> Result<Client> {
        let base_url = self
            .base_url
            .ok_or_else(|| Error::ConfigurationError("Base URL is required".to_string()))?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };

        let probe_url = Url::parse(&format!("{}{}", base_url, self.recovery_config.probe_path))?;
        let probe = HealthProbe::new(
            transport.clone(),
            probe_url,
            self.recovery_config.probe_timeout,
        );

        let health = Arc::new(ConnectionHealth::new(self.health_config));
        let recovery = RecoveryCoordinator::new(self.recovery_config, health.clone(), probe);

        Ok(Client {
            inner: Arc::new(ClientInner {
                transport,
                base_url,
                default_headers: self.default_headers,
                token_provider: self.token_provider,
                retry_policy: self.retry_policy,
                timeout: self.timeout,
                health,
                recovery,
                stats: ErrorStats::default(),
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
