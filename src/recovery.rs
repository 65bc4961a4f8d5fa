//! Connection recovery after socket-level failures.
//!
//! Some failures ("connection forcibly closed", HTTP/2 stream resets) mean the
//! connection pool itself is bad, and retrying right away tends to hit the
//! same dead socket. For those, the client hands the request to the
//! [`RecoveryCoordinator`], which pauses, probes the backend, and replays the
//! request once the probe succeeds.
//!
//! # States
//!
//! ```text
//! Idle -> Recovering -> Idle (probe ok, queue drained in FIFO order)
//!                    -> Idle (probe failed, queue kept for the next recovery
//!                             or failed once the budget is spent)
//! ```
//!
//! Only one recovery runs at a time. Requests that fail while a recovery is
//! in flight wait in the queue instead of starting a second one. When a failed
//! probe spends the last of the budget, the queue is answered with
//! [`Error::RecoveryExhausted`].

use crate::classify::ErrorClass;
use crate::health::ConnectionHealth;
use crate::transport::{HttpRequest, Transport};
use crate::{Error, Response, Result};
use http::header::CACHE_CONTROL;
use http::{HeaderMap, HeaderValue, Method};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use url::Url;

/// The future produced by a [`Replay`].
pub type ReplayFuture = Pin<Box<dyn Future<Output = Result<Response>> + Send>>;

/// Re-issues an original request from scratch.
pub type Replay = Box<dyn FnOnce() -> ReplayFuture + Send>;

/// Settings for [`RecoveryCoordinator`].
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Failed recoveries allowed before every recoverable error becomes terminal.
    pub max_attempts: u32,
    /// Pause between the forced reset and the health probe.
    pub settle_delay: Duration,
    /// Path probed with a GET, appended to the base URL.
    pub probe_path: String,
    /// Timeout of the probe request. The probe is never retried.
    pub probe_timeout: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            settle_delay: Duration::from_secs(2),
            probe_path: "/health".to_string(),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Diagnostic snapshot of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryStatus {
    pub is_recovering: bool,
    pub recovery_attempts: u32,
    pub queued_requests: usize,
}

/// A single lightweight GET used to check that the network path works again.
pub struct HealthProbe {
    transport: Arc<dyn Transport>,
    url: Url,
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(transport: Arc<dyn Transport>, url: Url, timeout: Duration) -> Self {
        Self {
            transport,
            url,
            timeout,
        }
    }

    /// Returns `true` if the backend answered in time with a non-5xx status.
    pub async fn check(&self) -> bool {
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        let request = HttpRequest {
            method: Method::GET,
            url: self.url.clone(),
            headers,
            body: None,
        };

        match tokio::time::timeout(self.timeout, self.transport.send(request)).await {
            Ok(Ok(response)) if !response.status.is_server_error() => true,
            Ok(Ok(response)) => {
                tracing::warn!(status = response.status.as_u16(), "Health probe rejected");
                false
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Health probe failed");
                false
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.timeout.as_millis(),
                    "Health probe timed out"
                );
                false
            }
        }
    }
}

struct Pending {
    replay: Replay,
    reply: oneshot::Sender<Result<Response>>,
    enqueued_at: Instant,
}

#[derive(Default)]
struct RecoveryState {
    attempt_count: u32,
    is_recovering: bool,
    pending: VecDeque<Pending>,
}

enum Admission {
    Recover(Replay, oneshot::Sender<Result<Response>>),
    Queued,
}

/// Serializes recovery attempts and replays queued requests.
///
/// Each recovery cycle runs on its own tokio task. Callers only wait for
/// their reply, so a caller that gives up (dropped future, timeout,
/// cancellation) leaves the cycle and the other waiters untouched.
///
/// Clones share the same state.
#[derive(Clone)]
pub struct RecoveryCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    config: RecoveryConfig,
    health: Arc<ConnectionHealth>,
    probe: HealthProbe,
    state: Mutex<RecoveryState>,
}

impl RecoveryCoordinator {
    pub fn new(config: RecoveryConfig, health: Arc<ConnectionHealth>, probe: HealthProbe) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                health,
                probe,
                state: Mutex::new(RecoveryState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RecoveryState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` if the error has an OS-socket-level signature.
    pub fn is_recoverable_error(&self, error: &Error) -> bool {
        error.class() == ErrorClass::RecoverableTransport
    }

    /// Runs one recovery cycle.
    ///
    /// Returns `false` straight away, without side effects, if a recovery is
    /// already running. Dropping the returned future does not stop the cycle.
    pub async fn attempt_recovery(&self) -> bool {
        {
            let mut state = self.state();
            if state.is_recovering {
                return false;
            }
            Self::begin(&mut state);
        }

        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.run_recovery().await })
            .await
            .unwrap_or(false)
    }

    fn begin(state: &mut RecoveryState) {
        state.is_recovering = true;
        state.attempt_count += 1;
    }

    async fn run_recovery(&self) -> bool {
        let attempt = self.state().attempt_count;
        tracing::warn!(
            attempt = attempt,
            max_attempts = self.inner.config.max_attempts,
            "Starting connection recovery"
        );

        self.inner.health.force_reset();
        tokio::time::sleep(self.inner.config.settle_delay).await;

        if !self.inner.probe.check().await {
            let exhausted = {
                let mut state = self.state();
                state.is_recovering = false;
                if state.attempt_count >= self.inner.config.max_attempts {
                    std::mem::take(&mut state.pending)
                } else {
                    VecDeque::new()
                }
            };
            tracing::error!(attempt = attempt, "Connection recovery failed");

            // No further recovery can start, so nothing would ever replay these.
            if !exhausted.is_empty() {
                tracing::error!(
                    queued_requests = exhausted.len(),
                    "Recovery budget spent, failing queued requests"
                );
            }
            for pending in exhausted {
                let _ = pending.reply.send(Err(Error::RecoveryExhausted));
            }
            return false;
        }

        let drained = {
            let mut state = self.state();
            state.attempt_count = 0;
            state.is_recovering = false;
            std::mem::take(&mut state.pending)
        };

        tracing::info!(
            queued_requests = drained.len(),
            "Connection recovered, replaying queued requests"
        );

        for pending in drained {
            tracing::debug!(
                waited_ms = pending.enqueued_at.elapsed().as_millis(),
                "Replaying queued request"
            );
            let result = self.settle_replay((pending.replay)().await);
            // The waiter may have given up; nothing to deliver then.
            let _ = pending.reply.send(result);
        }

        true
    }

    /// A replay that fails at the socket level again is terminal.
    fn settle_replay(&self, result: Result<Response>) -> Result<Response> {
        match result {
            Err(e) if self.is_recoverable_error(&e) => {
                tracing::error!(error = %e, "Connection still unstable after recovery");
                Err(Error::StillUnstable)
            }
            other => other,
        }
    }

    /// Takes over a request that failed with `error`.
    ///
    /// Non-recoverable errors are returned unchanged. Otherwise the request is
    /// either queued behind the running recovery or triggers a new one, and is
    /// replayed through `replay` once recovery succeeds.
    ///
    /// # Errors
    ///
    /// - [`Error::RecoveryExhausted`] once the recovery budget is spent,
    ///   including for requests still queued when the last probe fails.
    /// - [`Error::RecoveryFailed`] if the probe fails, or the queue is
    ///   discarded by [`RecoveryCoordinator::reset`].
    /// - [`Error::StillUnstable`] if the replay fails at the socket level again.
    pub async fn handle_connection_error(&self, error: Error, replay: Replay) -> Result<Response> {
        if !self.is_recoverable_error(&error) {
            return Err(error);
        }

        let (reply, receiver) = oneshot::channel();
        let admission = {
            let mut state = self.state();
            if state.attempt_count >= self.inner.config.max_attempts {
                tracing::error!(
                    attempts = state.attempt_count,
                    error = %error,
                    "Connection recovery failed after maximum attempts"
                );
                return Err(Error::RecoveryExhausted);
            }

            if state.is_recovering {
                state.pending.push_back(Pending {
                    replay,
                    reply,
                    enqueued_at: Instant::now(),
                });
                tracing::info!(
                    queued_requests = state.pending.len(),
                    "Recovery in progress, queueing request"
                );
                Admission::Queued
            } else {
                Self::begin(&mut state);
                Admission::Recover(replay, reply)
            }
        };

        if let Admission::Recover(replay, reply) = admission {
            let coordinator = self.clone();
            tokio::spawn(async move {
                let outcome = if coordinator.run_recovery().await {
                    coordinator.settle_replay(replay().await)
                } else {
                    Err(Error::RecoveryFailed)
                };
                let _ = reply.send(outcome);
            });
        }

        receiver.await.unwrap_or(Err(Error::RecoveryFailed))
    }

    /// Current recovery state.
    pub fn status(&self) -> RecoveryStatus {
        let state = self.state();
        RecoveryStatus {
            is_recovering: state.is_recovering,
            recovery_attempts: state.attempt_count,
            queued_requests: state.pending.len(),
        }
    }

    /// Returns to idle and discards the queue.
    ///
    /// Discarded requests resolve with [`Error::RecoveryFailed`]. Meant for
    /// logout and tests.
    pub fn reset(&self) {
        let mut state = self.state();
        state.attempt_count = 0;
        state.is_recovering = false;
        state.pending.clear();
    }
}
