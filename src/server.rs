//! HTTP/SSE facade over the gateway session
//!
//! Routes: `GET /health` (never authenticated), `GET /status`, and
//! `POST /message`, which starts a chat run and streams its deltas back as
//! SSE `data:` events terminated by a literal `[DONE]` marker. Once the
//! stream has begun the status code is fixed, so failures after that point
//! are reported in-band as `{"error": ...}` events.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::SecondsFormat;
use futures::stream::{self, Stream};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::lifecycle::Lifecycle;
use crate::session::{GatewaySession, RunStream};

/// Shared state for all routes
#[derive(Clone)]
pub struct AppState {
    /// Session handle used to start runs
    pub session: GatewaySession,
    /// Activity and shutdown tracker behind the status endpoint
    pub lifecycle: Arc<Lifecycle>,
    /// Bearer token required on non-health routes (None disables auth)
    pub auth_token: Option<SecretString>,
}

// ---- Error handling ----

/// Maps bridge errors onto HTTP responses (before streaming begins)
struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

// ---- Handlers ----

/// Liveness probe; bypasses authentication
async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Bridge status: uptime and last user-visible activity
async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "running",
        "uptime_seconds": state.lifecycle.uptime_seconds(),
        "last_activity_timestamp": state
            .lifecycle
            .last_activity()
            .to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

/// Start a chat run and stream its output as SSE
async fn post_message(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let message = body
        .get("message")
        .and_then(|m| m.as_str())
        .filter(|m| !m.is_empty())
        .map(str::to_string);
    let Some(message) = message else {
        return Err(ApiError(Error::InvalidInput(
            "Missing required field: message".to_string(),
        )));
    };

    state.lifecycle.record_activity();
    info!("Starting chat run for a {}-char message", message.len());

    let stream = run_event_stream(state.session.clone(), message);
    let mut response = Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(30))
                .text("keepalive"),
        )
        .into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    // Defeat proxy buffering between us and the client
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    Ok(response)
}

/// Per-response stream phases: start the run, relay deltas, end with [DONE]
enum StreamPhase {
    Start {
        session: GatewaySession,
        message: String,
    },
    Streaming(RunStream),
    /// Emit the error payload, then the terminal marker
    Fail(String),
    /// Emit the terminal marker, then end
    Finish,
    Done,
}

/// Lazy SSE event stream for one chat run.
///
/// The run starts only once the response body is polled; every failure from
/// that point on is delivered in-band. Dropping the stream mid-run detaches
/// the consumer without cancelling the run upstream.
fn run_event_stream(
    session: GatewaySession,
    message: String,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    stream::unfold(StreamPhase::Start { session, message }, |phase| async move {
        let mut phase = phase;
        loop {
            match phase {
                StreamPhase::Start { session, message } => {
                    match session.send_message(&message).await {
                        Ok(run) => phase = StreamPhase::Streaming(run),
                        Err(err) => {
                            warn!("Failed to start run: {}", err);
                            phase = StreamPhase::Fail(err.to_string());
                        }
                    }
                }
                StreamPhase::Streaming(mut run) => match run.next_delta().await {
                    Ok(Some(delta)) => {
                        return Some((Ok(content_event(&delta)), StreamPhase::Streaming(run)));
                    }
                    Ok(None) => {
                        debug!("Run {} completed", run.run_id());
                        phase = StreamPhase::Finish;
                    }
                    Err(err) => {
                        debug!("Run {} ended with error: {}", run.run_id(), err);
                        phase = StreamPhase::Fail(err.to_string());
                    }
                },
                StreamPhase::Fail(message) => {
                    return Some((Ok(error_event(&message)), StreamPhase::Finish));
                }
                StreamPhase::Finish => {
                    return Some((Ok(done_event()), StreamPhase::Done));
                }
                StreamPhase::Done => return None,
            }
        }
    })
}

fn content_event(delta: &str) -> Event {
    Event::default().data(json!({ "content": delta }).to_string())
}

fn error_event(message: &str) -> Event {
    Event::default().data(json!({ "error": message }).to_string())
}

fn done_event() -> Event {
    Event::default().data("[DONE]")
}

// ---- Auth middleware ----

/// Bearer-token check for every route except /health
async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }
    let Some(expected) = state.auth_token.as_ref() else {
        return next.run(request).await;
    };
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == format!("Bearer {}", expected.expose_secret()))
        .unwrap_or(false);
    if authorized {
        next.run(request).await
    } else {
        warn!("Rejected unauthorized request to {}", request.uri().path());
        ApiError(Error::Unauthorized).into_response()
    }
}

// ---- Router ----

/// Build the bridge router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/message", post(post_message))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
