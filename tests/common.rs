// ABOUTME: Shared test utilities: quiet logging, in-memory stores, and a scripted token server
// ABOUTME: The mock server records request bodies and hit counts for flow assertions
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use forge_oauth::TokenStore;

static INIT_LOGGER: Once = Once::new();

/// Initialize quiet logging for tests (call once per test process)
pub fn init_test_logging() {
    INIT_LOGGER.call_once(|| {
        let log_level = match std::env::var("TEST_LOG").as_deref() {
            Ok("TRACE") => tracing::Level::TRACE,
            Ok("DEBUG") => tracing::Level::DEBUG,
            Ok("INFO") => tracing::Level::INFO,
            _ => tracing::Level::WARN,
        };
        tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_test_writer()
            .init();
    });
}

/// Standard in-memory store with encryption enabled.
pub async fn create_test_store() -> anyhow::Result<Arc<TokenStore>> {
    init_test_logging();
    let store = TokenStore::connect("sqlite::memory:")
        .await?
        .with_encryption_secret("test-encryption-secret");
    Ok(Arc::new(store))
}

/// One canned token-endpoint response.
#[derive(Clone)]
pub struct ScriptedResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: String,
}

impl ScriptedResponse {
    pub fn json_ok(body: &str) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "application/json",
            body: body.to_owned(),
        }
    }

    pub fn form_ok(body: &str) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "application/x-www-form-urlencoded",
            body: body.to_owned(),
        }
    }

    pub fn error(status: u16) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap(),
            content_type: "application/json",
            body: r#"{"error":"server_error"}"#.to_owned(),
        }
    }
}

struct ServerState {
    hits: AtomicUsize,
    last_body: Mutex<Option<String>>,
    script: Mutex<VecDeque<ScriptedResponse>>,
    fallback: ScriptedResponse,
}

/// A local token endpoint serving a scripted response sequence. Once the
/// script runs out, the last response repeats.
pub struct MockTokenServer {
    state: Arc<ServerState>,
    /// Full URL of the /token route.
    pub token_url: String,
}

impl MockTokenServer {
    /// Serve the given responses in order, repeating the final one.
    pub async fn start(mut responses: Vec<ScriptedResponse>) -> Self {
        init_test_logging();
        assert!(!responses.is_empty(), "mock server needs at least one response");
        let fallback = responses.last().unwrap().clone();
        responses.pop();
        let state = Arc::new(ServerState {
            hits: AtomicUsize::new(0),
            last_body: Mutex::new(None),
            script: Mutex::new(responses.into()),
            fallback,
        });

        let app = Router::new()
            .route("/token", post(serve_scripted))
            .with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            state,
            token_url: format!("http://{addr}/token"),
        }
    }

    /// Serve one response for every request.
    pub async fn always(response: ScriptedResponse) -> Self {
        Self::start(vec![response]).await
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    /// The form body of the most recent request, parsed into pairs.
    pub fn last_request_params(&self) -> Vec<(String, String)> {
        let body = self
            .state
            .last_body
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_default();
        url::form_urlencoded::parse(body.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    pub fn last_param(&self, key: &str) -> Option<String> {
        self.last_request_params()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}

async fn serve_scripted(State(state): State<Arc<ServerState>>, body: String) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    *state.last_body.lock().unwrap() = Some(body);
    let response = state
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| state.fallback.clone());
    (
        response.status,
        [(header::CONTENT_TYPE, response.content_type)],
        response.body,
    )
}
