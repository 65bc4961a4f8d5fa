//! Connection health tracking.
//!
//! Keeps a rolling count of connection-layer failures, forces a reset once
//! too many pile up, and produces request headers tuned to the current state.

use crate::classify::{matches_any, CONNECTION_PATTERNS};
use crate::Error;
use http::header::{CACHE_CONTROL, CONNECTION, EXPIRES, PRAGMA};
use http::{HeaderMap, HeaderName, HeaderValue};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
const CONNECTION_HEALTH: HeaderName = HeaderName::from_static("x-connection-health");

/// Thresholds for [`ConnectionHealth`].
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Failures that trigger an automatic forced reset.
    pub reset_threshold: u32,
    /// How long a failure stays relevant, and how long the aggressive headers
    /// stay on after a forced reset.
    pub reset_window: Duration,
    /// Error count above which the aggressive keep-alive-limiting headers are sent.
    pub degraded_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            reset_threshold: 5,
            reset_window: Duration::from_secs(30),
            degraded_threshold: 2,
        }
    }
}

#[derive(Debug, Default)]
struct HealthState {
    error_count: u32,
    last_error: Option<Instant>,
    last_reset: Option<Instant>,
}

/// Tracks connection-layer failures for one client.
#[derive(Debug, Default)]
pub struct ConnectionHealth {
    config: HealthConfig,
    state: Mutex<HealthState>,
}

impl ConnectionHealth {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HealthState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, HealthState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a connection failure; forces a reset at the threshold.
    pub fn record_failure(&self) {
        let error_count = {
            let mut state = self.state();
            state.error_count += 1;
            state.last_error = Some(Instant::now());
            state.error_count
        };

        tracing::debug!(error_count = error_count, "Connection failure recorded");

        if error_count >= self.config.reset_threshold {
            self.force_reset();
        }
    }

    /// Records a success. The error count drops by one and never below zero.
    pub fn record_success(&self) {
        let mut state = self.state();
        state.error_count = state.error_count.saturating_sub(1);
    }

    /// Returns `true` when failures are present and either the threshold is
    /// reached or the last failure is older than the reset window.
    pub fn should_reset(&self) -> bool {
        let state = self.state();
        if state.error_count == 0 {
            return false;
        }

        let stale = state
            .last_error
            .is_some_and(|at| at.elapsed() > self.config.reset_window);
        state.error_count >= self.config.reset_threshold || stale
    }

    /// Clears the failure count.
    pub fn force_reset(&self) {
        let mut state = self.state();
        tracing::warn!(
            error_count = state.error_count,
            "Forcing connection reset"
        );
        state.error_count = 0;
        state.last_error = None;
        state.last_reset = Some(Instant::now());
    }

    /// Returns to the initial state, dropping the post-reset header window too.
    pub fn reset(&self) {
        *self.state() = HealthState::default();
    }

    /// Current failure count.
    pub fn error_count(&self) -> u32 {
        self.state().error_count
    }

    /// When the most recent failure was recorded, if any since the last reset.
    pub fn last_error_at(&self) -> Option<Instant> {
        self.state().last_error
    }

    /// Returns `true` if the aggressive headers are in effect.
    pub fn is_degraded(&self) -> bool {
        let state = self.state();
        let recently_reset = state
            .last_reset
            .is_some_and(|at| at.elapsed() <= self.config.reset_window);
        state.error_count > self.config.degraded_threshold || recently_reset
    }

    /// Headers for the next request.
    ///
    /// Always asks for a fresh connection and disables caching. While degraded
    /// (see [`ConnectionHealth::is_degraded`]) it also limits keep-alive so a
    /// suspect socket is not reused.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        headers.insert(
            CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-store, must-revalidate"),
        );
        headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
        headers.insert(EXPIRES, HeaderValue::from_static("0"));

        if self.is_degraded() {
            headers.insert(KEEP_ALIVE, HeaderValue::from_static("timeout=1, max=1"));
            headers.insert(CONNECTION_HEALTH, HeaderValue::from_static("degraded"));
        }

        headers
    }

    /// Returns `true` if the error looks like a connection-layer failure.
    ///
    /// Timeouts and cancellations count, matching how aborted requests surface
    /// on the transport.
    pub fn is_connection_error(&self, error: &Error) -> bool {
        match error {
            Error::Timeout | Error::Cancelled => true,
            Error::Network { message, .. } => {
                matches_any(&message.to_lowercase(), CONNECTION_PATTERNS)
            }
            _ => false,
        }
    }
}
