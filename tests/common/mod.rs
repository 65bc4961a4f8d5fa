//! Shared helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, StatusCode};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tartrack_net::transport::{HttpRequest, HttpResponse, Transport};
use tartrack_net::Error;
use tokio::time::Instant;

pub const BASE_URL: &str = "http://tartrack.test/api";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One scripted outcome of a transport call.
#[derive(Debug, Clone)]
pub enum Step {
    Json(u16, &'static str),
    Raw(u16, &'static str, &'static str),
    Fail(&'static str),
    Hang,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub path: String,
    pub at: Instant,
    pub headers: HeaderMap,
}

#[derive(Default)]
struct Shared {
    script: Mutex<VecDeque<Step>>,
    probe_script: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<Call>>,
}

/// A transport that plays back scripted outcomes.
///
/// Requests to `/health` draw from the probe script, everything else from the
/// main script. An exhausted script answers `200 {"ok":true}`.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    shared: Arc<Shared>,
}

impl ScriptedTransport {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        let transport = Self::default();
        transport.shared.script.lock().unwrap().extend(steps);
        transport
    }

    pub fn with_probe(self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.shared.probe_script.lock().unwrap().extend(steps);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.shared.calls.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.path).collect()
    }

    pub fn count(&self, path: &str) -> usize {
        self.calls().iter().filter(|c| c.path.ends_with(path)).count()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> tartrack_net::Result<HttpResponse> {
        let path = request.url.path().to_string();
        self.shared.calls.lock().unwrap().push(Call {
            path: path.clone(),
            at: Instant::now(),
            headers: request.headers,
        });

        let script = if path.ends_with("/health") {
            &self.shared.probe_script
        } else {
            &self.shared.script
        };
        let step = script.lock().unwrap().pop_front();

        match step.unwrap_or(Step::Json(200, r#"{"ok":true}"#)) {
            Step::Json(status, body) => Ok(response(status, "application/json", body)),
            Step::Raw(status, content_type, body) => Ok(response(status, content_type, body)),
            Step::Fail(message) => Err(Error::network(message)),
            Step::Hang => std::future::pending().await,
        }
    }
}

fn response(status: u16, content_type: &'static str, body: &str) -> HttpResponse {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    HttpResponse {
        status: StatusCode::from_u16(status).unwrap(),
        headers,
        body: body.to_string(),
    }
}
