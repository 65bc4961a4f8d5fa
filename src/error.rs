//! Error types for requests issued through the resilient client.
//!
//! The `Display` text of the terminal variants is part of the public contract:
//! screens and services match on it to pick their own messaging, so these
//! strings are stable.

use crate::classify::ErrorClass;
use http::{HeaderMap, StatusCode};

/// A boxed error used for transport sources and auth-provider failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The main error type for requests.
///
/// # Examples
///
/// ```no_run
/// use tartrack_net::{Client, Error};
///
/// # async fn example() -> Result<(), Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .build()?;
///
/// match client.get("/bookings").await {
///     Ok(response) => println!("Bookings: {}", response.data),
///     Err(Error::Timeout) => eprintln!("The server took too long"),
///     Err(Error::Http { status, message, .. }) => {
///         eprintln!("Rejected with {}: {}", status, message);
///     }
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A transport-level failure (connection refused, reset, DNS, socket errors).
    ///
    /// `message` holds the whole source chain flattened into one line so that
    /// OS-level wording such as "connection reset by peer" is visible to the
    /// classifier.
    #[error("{message}")]
    Network {
        /// Flattened description of the failure
        message: String,
        /// The underlying error, if any
        #[source]
        source: Option<BoxError>,
    },

    /// The request did not complete within its timeout.
    #[error("Request timeout")]
    Timeout,

    /// The caller cancelled the request.
    #[error("Request cancelled")]
    Cancelled,

    /// The server returned a non-2xx status code.
    ///
    /// `message` is taken from the `error` or `message` field of the response
    /// body when present, otherwise the canonical status text.
    #[error("HTTP {}: {message}", status.as_u16())]
    Http {
        /// The HTTP status code
        status: StatusCode,
        /// Message extracted from the body or the status text
        message: String,
        /// The raw response body
        raw_response: String,
        /// The response headers
        headers: HeaderMap,
    },

    /// A recovery cycle was started but the health probe failed.
    #[error("Connection recovery failed")]
    RecoveryFailed,

    /// Recovery succeeded, but the replayed request hit another socket-level failure.
    #[error("Connection still unstable after recovery")]
    StillUnstable,

    /// The recovery attempt budget is spent; no further recovery is tried.
    #[error("Connection recovery failed after maximum attempts")]
    RecoveryExhausted,

    /// Failed to convert the normalized response data into the requested type.
    #[error("Failed to deserialize response (status {status}): {serde_error}")]
    DeserializationFailed {
        /// The raw response body
        raw_response: String,
        /// The serde error message
        serde_error: String,
        /// The HTTP status code
        status: StatusCode,
    },

    /// Failed to serialize the request body.
    #[error("Failed to serialize request: {0}")]
    SerializationFailed(String),

    /// Invalid configuration was provided.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// An invalid URL was provided or produced.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl Error {
    /// Creates a [`Error::Network`] from a plain message.
    ///
    /// Custom transports use this to report failures that have no richer source.
    pub fn network(message: impl Into<String>) -> Self {
        Error::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Returns the classification that drives retry and recovery decisions.
    pub fn class(&self) -> ErrorClass {
        ErrorClass::of(self)
    }

    /// Returns the HTTP status code if this error has one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Http { status, .. } => Some(*status),
            Error::DeserializationFailed { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns the raw response body if this error has one.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            Error::Http { raw_response, .. } => Some(raw_response),
            Error::DeserializationFailed { raw_response, .. } => Some(raw_response),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Error::Timeout;
        }

        // reqwest's top-level message ("error sending request for url ...") hides
        // the OS wording, which lives further down the source chain.
        let mut message = err.to_string();
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }

        Error::Network {
            message,
            source: Some(Box::new(err)),
        }
    }
}

/// A specialized `Result` type for requests.
pub type Result<T> = std::result::Result<T, Error>;
