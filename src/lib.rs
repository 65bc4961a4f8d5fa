//! # tartrack-net - resilient networking for the TarTrack mobile backend
//!
//! Every screen and service in the app reaches the REST backend through one
//! [`Client`]. The client keeps flaky mobile connections from turning into
//! crashes or blank screens:
//!
//! - **Local retries** - timeouts, dropped connections, socket errors, and 5xx
//!   responses are retried with capped exponential backoff. 4xx responses are
//!   returned on first sight.
//! - **Connection recovery** - OS-level socket failures ("connection forcibly
//!   closed", HTTP/2 stream errors) pause the request, reset connection state,
//!   probe the backend, and replay. Concurrent failures queue behind a single
//!   recovery instead of starting their own.
//! - **Health-aware headers** - a failure counter decides when to stop reusing
//!   connections and when to force a reset.
//! - **Response normalization** - empty, truncated, HTML-wrapped, or slightly
//!   malformed JSON bodies become structured data, never a parse error.
//!
//! ## Quick Start
//!
//! ```no_run
//! use tartrack_net::{Client, StaticToken};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tartrack_net::Error> {
//!     let client = Client::builder()
//!         .base_url("https://api.example.com/api")?
//!         .timeout(Duration::from_secs(35))
//!         .token_provider(StaticToken::new("session-token"))
//!         .build()?;
//!
//!     let rides = client.get("/rides/available/").await?;
//!     println!("Rides: {}", rides.data);
//!     println!("Request took {:?} over {} attempt(s)", rides.latency, rides.attempts);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Error Handling
//!
//! Failures that survive retries and recovery come back as [`Error`]. The
//! `Display` text of the terminal errors is stable:
//!
//! ```no_run
//! use tartrack_net::{Client, Error};
//!
//! # async fn example(client: Client) {
//! match client.get("/earnings/").await {
//!     Ok(response) => println!("Earnings: {}", response.data),
//!     Err(Error::Timeout) => eprintln!("Request timeout"),
//!     Err(e @ (Error::RecoveryFailed | Error::StillUnstable | Error::RecoveryExhausted)) => {
//!         eprintln!("Connection problem: {}", e);
//!     }
//!     Err(e) => eprintln!("Request failed: {}", e),
//! }
//! # }
//! ```
//!
//! Screens that prefer a result object over an error can use
//! [`normalize::handle_error`] to turn any error into a failed
//! [`normalize::NormalizedResponse`] with fallback data.

pub mod classify;
mod client;
mod error;
pub mod health;
pub mod metadata;
pub mod normalize;
pub mod recovery;
mod response;
pub mod retry;
pub mod transport;

pub use client::{Client, ClientBuilder};
pub use error::{BoxError, Error, Result};
pub use response::Response;
pub use retry::{Backoff, RetryPolicy};
pub use transport::{StaticToken, TokenProvider, Transport};
