//! HTTP front end for the relay
//!
//! Routes:
//! - `POST /v1/chat/completions`: relayed to the configured deployment
//! - `GET /healthz`: liveness probe

use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::StreamExt;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;

use super::error::ProxyError;
use super::session::RelaySession;
use super::sink::ChannelSink;
use super::upstream::{self, API_KEY_HEADER, UpstreamClient};
use crate::config::{Config, LoggingConfig, RelayConfig};
use crate::error::{RelayError, Result};

/// Headers whose values never reach the log
const SENSITIVE_HEADERS: &[&str] = &[API_KEY_HEADER, "authorization", "proxy-authorization"];

/// Shared application state for all handlers; read-only after startup
pub struct AppState {
    pub upstream: UpstreamClient,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
    /// Overall per-request budget, `None` for no limit
    pub timeout: Option<std::time::Duration>,
}

impl AppState {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            upstream: UpstreamClient::new(&config.upstream)?,
            relay: config.relay.clone(),
            logging: config.logging,
            timeout: config.upstream.timeout(),
        })
    }
}

/// The relay HTTP server
pub struct RelayServer {
    config: Config,
}

impl RelayServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Bind and serve until Ctrl+C or SIGTERM
    pub async fn serve(&self) -> Result<()> {
        let state = Arc::new(AppState::from_config(&self.config)?);

        let addr = self.config.server.listen_addr();

        tracing::info!("Relaying to: {}", state.upstream.url());
        match &self.config.upstream.proxy_url {
            Some(proxy) => tracing::info!("Using egress proxy: {proxy}"),
            None => tracing::info!("No egress proxy configured"),
        }
        match state.timeout {
            Some(timeout) => tracing::info!("Upstream timeout: {}s", timeout.as_secs()),
            None => tracing::info!("Upstream timeout: disabled"),
        }

        let app = create_router(state);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayError::Proxy(format!("Failed to bind to {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;

        tracing::info!("Starting relay on http://{local_addr}");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| RelayError::Proxy(format!("Server error: {e}")))?;

        tracing::info!("Relay shut down gracefully");
        Ok(())
    }
}

/// Create the router with all routes configured
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/healthz", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn chat_completions_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();

    if state.logging.log_headers {
        tracing::debug!("Incoming request headers: {:?}", redacted(&headers));
    }

    let request: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            tracing::error!("Invalid JSON received from client: {e}");
            return ProxyError::Request(format!("Invalid JSON in request body: {e}"))
                .into_response();
        }
    };
    let stream = request
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if state.logging.log_bodies {
        tracing::debug!("Incoming request body: {request}");
    }
    tracing::info!(stream, "Forwarding chat completion request");

    let response = match state.upstream.send(body, stream).await {
        Ok(response) => response,
        Err(e) => return e.into_response(),
    };

    let status = response.status();
    tracing::debug!(status = status.as_u16(), "Upstream responded");
    if state.logging.log_headers {
        tracing::debug!(
            "Upstream response headers: {:?}",
            redacted(response.headers())
        );
    }

    if !stream {
        return match relay_buffered(response, state.logging).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        };
    }

    if status != reqwest::StatusCode::OK {
        let detail = response.text().await.unwrap_or_default();
        tracing::error!(
            status = status.as_u16(),
            "Upstream returned non-200 for streaming request: {detail}"
        );
        return ProxyError::Upstream {
            status: to_axum_status(status),
            body: detail,
        }
        .into_response();
    }

    relay_stream(&state, response, started)
}

/// Non-streaming: upstream status and body, verbatim, as JSON
async fn relay_buffered(
    response: reqwest::Response,
    logging: LoggingConfig,
) -> std::result::Result<Response, ProxyError> {
    let status = to_axum_status(response.status());
    let body = response.bytes().await?;

    if logging.log_bodies {
        tracing::debug!("Upstream response body: {}", String::from_utf8_lossy(&body));
    }

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .map_err(|e| ProxyError::Internal(format!("Failed to build response: {e}")))
}

/// Streaming: hand the upstream body to a relay session on its own task and
/// return the session's frames as the response body.
fn relay_stream(state: &AppState, response: reqwest::Response, started: Instant) -> Response {
    let (sink, frames) = ChannelSink::new(state.relay.channel_capacity);
    let session = RelaySession::new(&state.relay, state.logging)
        .with_deadline(state.timeout.map(|timeout| started + timeout));
    tracing::debug!(session = %session.id(), "Opening SSE stream");

    tokio::spawn(session.run(upstream::byte_stream(response), sink));

    let body = Body::from_stream(frames.map(Ok::<_, Infallible>));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .body(body)
        .unwrap_or_else(|e| {
            ProxyError::Internal(format!("Failed to build SSE response: {e}")).into_response()
        })
}

fn to_axum_status(status: reqwest::StatusCode) -> StatusCode {
    StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY)
}

/// Header names and values for logging, with credentials masked
fn redacted(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = if SENSITIVE_HEADERS.contains(&name.as_str()) {
                "<redacted>".to_string()
            } else {
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            };
            (name.as_str().to_string(), value)
        })
        .collect()
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
