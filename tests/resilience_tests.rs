//! Retry, recovery, and cancellation behaviour driven by a scripted transport.
//!
//! These run on tokio's paused clock, so backoff and settle delays complete
//! instantly while `Instant` still reports them.

mod common;

use async_trait::async_trait;
use common::{ScriptedTransport, Step, BASE_URL};
use http::{Method, StatusCode};
use serde_json::json;
use std::time::Duration;
use tartrack_net::metadata::{CancelToken, RequestMetadata};
use tartrack_net::recovery::RecoveryConfig;
use tartrack_net::{BoxError, Client, Error, TokenProvider};

const RESET: &str = "read: connection reset by peer";
const FORCIBLY_CLOSED: &str =
    "An existing connection was forcibly closed by the remote host. (os error 10054)";

fn client(transport: &ScriptedTransport) -> Client {
    common::init_tracing();
    Client::builder()
        .base_url(BASE_URL)
        .unwrap()
        .transport(transport.clone())
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retried_with_growing_delays() {
    let transport = ScriptedTransport::new([
        Step::Fail("Network request failed"),
        Step::Fail("Network request failed"),
    ]);
    let client = client(&transport);

    let response = client.get("/rides/").await.unwrap();

    assert_eq!(response.data, json!({"ok": true}));
    assert_eq!(response.attempts, 3);
    assert!(response.was_retried());

    let calls = transport.calls();
    assert_eq!(calls.len(), 3);
    let first_gap = calls[1].at - calls[0].at;
    let second_gap = calls[2].at - calls[1].at;
    assert_eq!(first_gap, Duration::from_secs(1));
    assert_eq!(second_gap, Duration::from_secs(2));
    assert!(response.latency >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_client_error_not_retried() {
    let transport =
        ScriptedTransport::new([Step::Json(400, r#"{"error":"Pickup date is in the past"}"#)]);
    let client = client(&transport);

    let err = client
        .post("/bookings/", &json!({"date": "2020-01-01"}))
        .await
        .unwrap_err();

    assert_eq!(transport.calls().len(), 1);
    assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));
    assert_eq!(err.to_string(), "HTTP 400: Pickup date is in the past");
    assert_eq!(client.health().error_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_error_message_falls_back_to_status_text() {
    let transport = ScriptedTransport::new([Step::Raw(403, "text/plain", "nope")]);
    let client = client(&transport);

    let err = client.get("/admin/").await.unwrap_err();
    assert_eq!(err.to_string(), "HTTP 403: Forbidden");
}

#[tokio::test(start_paused = true)]
async fn test_server_errors_exhaust_budget() {
    let transport = ScriptedTransport::new([
        Step::Json(503, r#"{"message":"maintenance"}"#),
        Step::Json(503, r#"{"message":"maintenance"}"#),
        Step::Json(503, r#"{"message":"maintenance"}"#),
    ]);
    let client = client(&transport);

    let err = client.get("/earnings/").await.unwrap_err();

    assert_eq!(transport.calls().len(), 3);
    assert_eq!(err.to_string(), "HTTP 503: maintenance");
    assert_eq!(client.health().error_count(), 3);
    assert_eq!(client.error_stats().server_5xx, 3);
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_normalized() {
    let transport = ScriptedTransport::new([Step::Hang, Step::Hang, Step::Hang]);
    let client = client(&transport);

    let metadata =
        RequestMetadata::new(Method::GET, "/rides/").with_timeout(Duration::from_secs(1));
    let err = client.call(metadata).await.unwrap_err();

    assert!(matches!(err, Error::Timeout));
    assert_eq!(err.to_string(), "Request timeout");

    let calls = transport.calls();
    assert_eq!(calls.len(), 3);
    // 1s timeout + 1s backoff, then 1s timeout + 2s backoff
    assert_eq!(calls[1].at - calls[0].at, Duration::from_secs(2));
    assert_eq!(calls[2].at - calls[1].at, Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_then_success() {
    let transport = ScriptedTransport::new([Step::Hang]);
    let client = client(&transport);

    let metadata =
        RequestMetadata::new(Method::GET, "/rides/").with_timeout(Duration::from_secs(5));
    let response = client.call(metadata).await.unwrap();

    assert_eq!(response.attempts, 2);
    assert_eq!(client.error_stats().timeout, 1);
}

#[tokio::test(start_paused = true)]
async fn test_socket_errors_back_off_and_reset() {
    let transport = ScriptedTransport::new([Step::Fail("EAGAIN"), Step::Fail("EAGAIN")]);
    let client = client(&transport);

    client.get("/chat/messages/").await.unwrap();

    let calls = transport.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[1].at - calls[0].at, Duration::from_secs(2));
    assert_eq!(calls[2].at - calls[1].at, Duration::from_secs(4));

    // The second socket failure forced a reset before the last attempt.
    assert_eq!(client.health().error_count(), 0);
    assert!(client.connection_headers().contains_key("keep-alive"));
    // Headers are merged once per call, before the first attempt.
    assert!(!calls[2].headers.contains_key("keep-alive"));
}

#[tokio::test(start_paused = true)]
async fn test_per_request_attempt_budget() {
    let transport = ScriptedTransport::new([Step::Fail("Network request failed")]);
    let client = client(&transport);

    let metadata = RequestMetadata::new(Method::GET, "/rides/").with_max_attempts(1);
    let err = client.call(metadata).await.unwrap_err();

    assert_eq!(err.to_string(), "Network request failed");
    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recoverable_error_replayed_after_probe() {
    let transport = ScriptedTransport::new([Step::Fail(FORCIBLY_CLOSED)]);
    let client = client(&transport);

    let start = tokio::time::Instant::now();
    let response = client.get("/bookings/").await.unwrap();

    assert_eq!(response.data, json!({"ok": true}));
    assert_eq!(
        transport.paths(),
        vec!["/api/bookings/", "/api/health", "/api/bookings/"]
    );
    assert!(start.elapsed() >= Duration::from_secs(2));

    let status = client.recovery_status();
    assert!(!status.is_recovering);
    assert_eq!(status.recovery_attempts, 0);
    assert_eq!(status.queued_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_failures_share_one_recovery() {
    let transport = ScriptedTransport::new([Step::Fail(RESET), Step::Fail(RESET)]);
    let client = client(&transport);

    let (first, second) = tokio::join!(client.get("/rides/first"), client.get("/rides/second"));

    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(transport.count("/health"), 1);

    // The queued request replays only after the probe settled.
    assert_eq!(
        transport.paths(),
        vec![
            "/api/rides/first",
            "/api/rides/second",
            "/api/health",
            "/api/rides/second",
            "/api/rides/first",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_probe_failure_fails_request() {
    let transport =
        ScriptedTransport::new([Step::Fail(RESET)]).with_probe([Step::Json(503, "{}")]);
    let client = client(&transport);

    let err = client.get("/rides/").await.unwrap_err();

    assert!(matches!(err, Error::RecoveryFailed));
    assert_eq!(err.to_string(), "Connection recovery failed");
    let status = client.recovery_status();
    assert!(!status.is_recovering);
    assert_eq!(status.recovery_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_budget_is_terminal() {
    let transport = ScriptedTransport::new([
        Step::Fail(RESET),
        Step::Fail(RESET),
        Step::Fail(RESET),
        Step::Fail(RESET),
    ])
    .with_probe([Step::Fail(RESET), Step::Fail(RESET), Step::Fail(RESET)]);
    let client = client(&transport);

    for _ in 0..3 {
        let err = client.get("/rides/").await.unwrap_err();
        assert!(matches!(err, Error::RecoveryFailed));
    }

    let err = client.get("/rides/").await.unwrap_err();
    assert!(matches!(err, Error::RecoveryExhausted));
    assert_eq!(
        err.to_string(),
        "Connection recovery failed after maximum attempts"
    );
    assert_eq!(transport.count("/health"), 3);

    client.reset();
    assert_eq!(client.recovery_status().recovery_attempts, 0);
    assert!(client.get("/rides/").await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_replay_failing_again_is_still_unstable() {
    let transport = ScriptedTransport::new([Step::Fail(RESET), Step::Fail("HTTP2 stream_id 7 reset")]);
    let client = client(&transport);

    let err = client.get("/rides/").await.unwrap_err();

    assert!(matches!(err, Error::StillUnstable));
    assert_eq!(err.to_string(), "Connection still unstable after recovery");
    assert_eq!(transport.count("/health"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_queue_kept_on_probe_failure_until_reset() {
    let transport = ScriptedTransport::new([Step::Fail(RESET), Step::Fail(RESET)])
        .with_probe([Step::Json(502, "{}")]);
    let client = client(&transport);

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.get("/rides/first").await }
    });
    let second = tokio::spawn({
        let client = client.clone();
        async move { client.get("/rides/second").await }
    });

    let first = first.await.unwrap();
    assert!(matches!(first, Err(Error::RecoveryFailed)));

    let status = client.recovery_status();
    assert!(!status.is_recovering);
    assert_eq!(status.queued_requests, 1);

    client.reset();
    let second = second.await.unwrap();
    assert!(matches!(second, Err(Error::RecoveryFailed)));
    assert_eq!(client.recovery_status().queued_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_spent_budget_fails_queued_requests() {
    let transport = ScriptedTransport::new([Step::Fail(RESET), Step::Fail(RESET)])
        .with_probe([Step::Json(503, "{}")]);
    common::init_tracing();
    let client = Client::builder()
        .base_url(BASE_URL)
        .unwrap()
        .transport(transport.clone())
        .recovery_config(RecoveryConfig {
            max_attempts: 1,
            ..Default::default()
        })
        .build()
        .unwrap();

    let (first, second) = tokio::join!(client.get("/rides/first"), client.get("/rides/second"));

    assert!(matches!(first, Err(Error::RecoveryFailed)));
    assert!(matches!(second, Err(Error::RecoveryExhausted)));

    let status = client.recovery_status();
    assert!(!status.is_recovering);
    assert_eq!(status.recovery_attempts, 1);
    assert_eq!(status.queued_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_survives_dropped_initiator() {
    let transport = ScriptedTransport::new([Step::Fail(RESET), Step::Fail(RESET)]);
    let client = client(&transport);

    // The first caller gives up during the settle delay.
    let abandoned =
        tokio::time::timeout(Duration::from_secs(1), client.get("/rides/first")).await;
    assert!(abandoned.is_err());
    assert!(client.recovery_status().is_recovering);

    let second =
        tokio::time::timeout(Duration::from_secs(60), client.get("/rides/second")).await;
    assert!(second.expect("queued request should resolve").is_ok());

    let status = client.recovery_status();
    assert!(!status.is_recovering);
    assert_eq!(status.queued_requests, 0);
    assert_eq!(transport.count("/health"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_recovery() {
    let transport = ScriptedTransport::new([Step::Fail(RESET)]).with_probe([Step::Hang]);
    let client = client(&transport);

    let token = CancelToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        }
    });

    let start = tokio::time::Instant::now();
    let metadata = RequestMetadata::new(Method::GET, "/rides/").with_cancel_token(token);
    let err = client.call(metadata).await.unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(start.elapsed() < Duration::from_secs(1));

    // The cycle finishes on its own once the probe times out.
    tokio::time::sleep(Duration::from_secs(10)).await;
    let status = client.recovery_status();
    assert!(!status.is_recovering);
    assert_eq!(status.recovery_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_recovery_is_exclusive() {
    let transport = ScriptedTransport::new([Step::Fail(RESET)]);
    let client = client(&transport);

    let request = tokio::spawn({
        let client = client.clone();
        async move { client.get("/rides/").await }
    });

    while !client.recovery_status().is_recovering {
        tokio::task::yield_now().await;
    }

    assert!(!client.recovery().attempt_recovery().await);
    assert_eq!(client.recovery_status().recovery_attempts, 1);

    assert!(request.await.unwrap().is_ok());
    assert_eq!(transport.count("/health"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_custom_recovery_config() {
    let transport = ScriptedTransport::new([Step::Fail(RESET)]);
    common::init_tracing();
    let client = Client::builder()
        .base_url(BASE_URL)
        .unwrap()
        .transport(transport.clone())
        .recovery_config(RecoveryConfig {
            settle_delay: Duration::from_millis(100),
            probe_path: "/status/ping".to_string(),
            ..Default::default()
        })
        .build()
        .unwrap();

    let start = tokio::time::Instant::now();
    client.get("/rides/").await.unwrap();

    assert_eq!(transport.count("/status/ping"), 1);
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_request() {
    let transport = ScriptedTransport::new([Step::Hang]);
    let client = client(&transport);

    let token = CancelToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        }
    });

    let metadata = RequestMetadata::new(Method::GET, "/rides/").with_cancel_token(token);
    let err = client.call(metadata).await.unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_backoff() {
    let transport = ScriptedTransport::new([Step::Fail("Network request failed")]);
    let client = client(&transport);

    let token = CancelToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            token.cancel();
        }
    });

    let metadata = RequestMetadata::new(Method::GET, "/rides/").with_cancel_token(token);
    let err = client.call(metadata).await.unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert_eq!(transport.calls().len(), 1);
}

struct BrokenSession;

#[async_trait]
impl TokenProvider for BrokenSession {
    async fn token(&self) -> Result<Option<String>, BoxError> {
        Err("session store unavailable".into())
    }
}

#[tokio::test(start_paused = true)]
async fn test_token_failure_does_not_abort_request() {
    let transport = ScriptedTransport::default();
    common::init_tracing();
    let client = Client::builder()
        .base_url(BASE_URL)
        .unwrap()
        .transport(transport.clone())
        .token_provider(BrokenSession)
        .build()
        .unwrap();

    client.get("/rides/").await.unwrap();

    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    assert!(!calls[0].headers.contains_key("authorization"));
    assert_eq!(calls[0].headers["content-type"], "application/json");
}

#[tokio::test(start_paused = true)]
async fn test_html_gateway_page_is_normalized() {
    let transport = ScriptedTransport::new([Step::Raw(
        200,
        "text/html",
        r#"<html>Error 502: {"error":"bad gateway"}</html>"#,
    )]);
    let client = client(&transport);

    let response = client.get("/rides/").await.unwrap();

    assert!(response.success);
    assert_eq!(response.data["error"], "bad gateway");
}
