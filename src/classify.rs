//! Error classification and per-class failure counters.
//!
//! Classification is substring matching on the flattened error message. It is
//! a heuristic: transports on different platforms word the same failure
//! differently, so the pattern lists cover the spellings seen in the field.

use crate::Error;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Socket-level failures that point at a broken connection pool rather than a
/// one-off blip. These are escalated to the recovery coordinator.
pub(crate) const RECOVERABLE_PATTERNS: &[&str] = &[
    "forcibly closed",
    "existing connection",
    "connection reset",
    "readerror",
    "http2",
    "stream_id",
    "wsaeconnreset",
    "wsaeconnaborted",
    "10054",
    "10053",
];

/// Connection-layer failures tracked by the health tracker.
pub(crate) const CONNECTION_PATTERNS: &[&str] = &[
    "connection terminated",
    "connection closed",
    "connection reset",
    "econnreset",
    "stream_id",
    "network request failed",
];

/// Platform socket errors that get the longer socket backoff.
pub(crate) const SOCKET_PATTERNS: &[&str] = &[
    "ewouldblock",
    "eagain",
    "resource temporarily unavailable",
    "wsaewouldblock",
    "10035",
];

const SERVER_ERROR_CODES: &[&str] = &["500", "502", "503", "504"];

/// The classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The attempt timed out.
    Timeout,
    /// A transient connection-layer failure.
    Connection,
    /// A platform socket error (`EWOULDBLOCK`, `EAGAIN`, ...).
    Socket,
    /// The server answered with a 5xx status.
    Server5xx,
    /// An OS-socket failure that warrants a recovery cycle.
    RecoverableTransport,
    /// Anything else, including 4xx responses. Never retried.
    Unknown,
}

impl ErrorClass {
    /// Classifies an error.
    ///
    /// Recoverable-transport signatures win over the plain connection
    /// patterns they overlap with ("connection reset", "stream_id").
    pub fn of(error: &Error) -> Self {
        match error {
            Error::Timeout => ErrorClass::Timeout,
            Error::Http { status, .. } if status.is_server_error() => ErrorClass::Server5xx,
            Error::Network { message, .. } => {
                let message = message.to_lowercase();
                if matches_any(&message, RECOVERABLE_PATTERNS) {
                    ErrorClass::RecoverableTransport
                } else if matches_any(&message, CONNECTION_PATTERNS) {
                    ErrorClass::Connection
                } else if matches_any(&message, SOCKET_PATTERNS) {
                    ErrorClass::Socket
                } else if matches_any(&message, SERVER_ERROR_CODES) {
                    ErrorClass::Server5xx
                } else {
                    ErrorClass::Unknown
                }
            }
            _ => ErrorClass::Unknown,
        }
    }
}

pub(crate) fn matches_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack.contains(p))
}

/// Counts failed attempts per [`ErrorClass`].
///
/// Purely diagnostic; nothing reads these counters to make decisions.
#[derive(Debug, Default)]
pub struct ErrorStats {
    timeout: AtomicU64,
    connection: AtomicU64,
    socket: AtomicU64,
    server_5xx: AtomicU64,
    recoverable_transport: AtomicU64,
    unknown: AtomicU64,
}

impl ErrorStats {
    /// Records one failure of the given class.
    pub fn record(&self, class: ErrorClass) {
        let counter = match class {
            ErrorClass::Timeout => &self.timeout,
            ErrorClass::Connection => &self.connection,
            ErrorClass::Socket => &self.socket,
            ErrorClass::Server5xx => &self.server_5xx,
            ErrorClass::RecoverableTransport => &self.recoverable_transport,
            ErrorClass::Unknown => &self.unknown,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of the counters.
    pub fn snapshot(&self) -> ErrorCounts {
        ErrorCounts {
            timeout: self.timeout.load(Ordering::Relaxed),
            connection: self.connection.load(Ordering::Relaxed),
            socket: self.socket.load(Ordering::Relaxed),
            server_5xx: self.server_5xx.load(Ordering::Relaxed),
            recoverable_transport: self.recoverable_transport.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
        }
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        for counter in [
            &self.timeout,
            &self.connection,
            &self.socket,
            &self.server_5xx,
            &self.recoverable_transport,
            &self.unknown,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of [`ErrorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ErrorCounts {
    pub timeout: u64,
    pub connection: u64,
    pub socket: u64,
    pub server_5xx: u64,
    pub recoverable_transport: u64,
    pub unknown: u64,
}

impl ErrorCounts {
    /// Total failures across all classes.
    pub fn total(&self) -> u64 {
        self.timeout
            + self.connection
            + self.socket
            + self.server_5xx
            + self.recoverable_transport
            + self.unknown
    }
}
