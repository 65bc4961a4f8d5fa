//! The uniform success envelope returned by the client.
//!
//! Every successful call yields `{success, data, status}`, where `data` is the
//! normalized body. The raw body, headers, latency, and attempt count ride
//! along for debugging.

use crate::{Error, Result};
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

/// A successful response.
///
/// # Examples
///
/// ```no_run
/// use tartrack_net::Client;
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Earnings {
///     total: f64,
/// }
///
/// # async fn example() -> Result<(), tartrack_net::Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .build()?;
///
/// let response = client.get("/earnings/summary").await?;
/// println!("Status: {}, took {:?}", response.status, response.latency);
///
/// let earnings: Earnings = response.deserialize()?.data;
/// println!("Total: {}", earnings.total);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Response<T = Value> {
    /// Always `true`; failures are returned as [`Error`].
    pub success: bool,

    /// The normalized response data.
    pub data: T,

    /// The HTTP status code of the response.
    pub status: StatusCode,

    /// The raw response body as received.
    pub raw_body: String,

    /// The response headers.
    pub headers: HeaderMap,

    /// Time from the first attempt until the successful response, including
    /// backoff delays.
    pub latency: Duration,

    /// The number of attempts made by the request that produced this response.
    pub attempts: usize,
}

impl<T> Response<T> {
    /// Maps the response data to a different type, keeping the metadata.
    ///
    /// # Examples
    ///
    /// ```
    /// # use tartrack_net::Response;
    /// # use http::{HeaderMap, StatusCode};
    /// # use std::time::Duration;
    /// let response = Response {
    ///     success: true,
    ///     data: 42,
    ///     status: StatusCode::OK,
    ///     raw_body: "42".to_string(),
    ///     headers: HeaderMap::new(),
    ///     latency: Duration::from_millis(100),
    ///     attempts: 1,
    /// };
    ///
    /// let string_response = response.map(|n| n.to_string());
    /// assert_eq!(string_response.data, "42");
    /// ```
    pub fn map<U, F>(self, f: F) -> Response<U>
    where
        F: FnOnce(T) -> U,
    {
        Response {
            success: self.success,
            data: f(self.data),
            status: self.status,
            raw_body: self.raw_body,
            headers: self.headers,
            latency: self.latency,
            attempts: self.attempts,
        }
    }

    /// Returns `true` if the request required retries.
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }

    /// Returns a header value by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }
}

impl Response<Value> {
    /// Converts the normalized data into a caller type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeserializationFailed`] with the raw body attached if
    /// the data does not match `U`.
    pub fn deserialize<U: DeserializeOwned>(self) -> Result<Response<U>> {
        match serde_json::from_value::<U>(self.data.clone()) {
            Ok(data) => Ok(self.map(|_| data)),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    raw_response = %self.raw_body,
                    "Failed to deserialize response"
                );
                Err(Error::DeserializationFailed {
                    raw_response: self.raw_body,
                    serde_error: e.to_string(),
                    status: self.status,
                })
            }
        }
    }
}

impl<T> AsRef<T> for Response<T> {
    fn as_ref(&self) -> &T {
        &self.data
    }
}

impl<T> std::ops::Deref for Response<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}
