//! Health, Metrics and Stream Admin Endpoint
//!
//! HTTP endpoint for health checks, Prometheus metrics, and operator
//! control of the Finnhub stream.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health status
//! - `GET /healthz` - liveness probe (simple OK)
//! - `GET /readyz` - readiness probe (stream connected, or streaming off)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /admin/stream` - stream and registry status
//! - `POST /admin/stream/reconnect` - cancel pending backoff and connect now
//! - `POST /admin/stream/resync` - reconcile wire subscriptions with the registry
//! - `POST /admin/watchlist/add` - `{"ticker"}`: a watchlist entry was added
//! - `POST /admin/watchlist/remove` - `{"ticker"}`: a watchlist entry was removed
//! - `POST /admin/watchlist/rename` - `{"from","to"}`: an entry changed ticker
//!
//! The watchlist routes are the hook the watchlist service calls on every
//! mutation. They move registry references and report whether the wire
//! was touched. A blank ticker is 400. With streaming off they answer 200
//! with a `null` transition.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::application::services::SubscriptionRegistry;
use crate::domain::subscription::{SubscriptionStats, Transition};
use crate::domain::ticker::Ticker;
use crate::infrastructure::finnhub::{ConnectionState, StreamConnection, StreamStatus};
use crate::infrastructure::http::{HttpServerError, serve};
use crate::infrastructure::metrics::{self, get_metrics_handle};

// =============================================================================
// Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Stream and registry state.
    pub stream: StreamReport,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Stream connected, or streaming switched off.
    Healthy,
    /// Streaming on but no live session; webhook ingestion still works.
    Degraded,
    /// Shutting down.
    Unhealthy,
}

/// Stream status plus the registry's view of what should be subscribed.
#[derive(Debug, Clone, Serialize)]
pub struct StreamReport {
    /// Whether the upstream stream is configured to run.
    pub streaming_enabled: bool,
    /// Connection details, absent when streaming is off.
    #[serde(flatten)]
    pub connection: Option<StreamStatus>,
    /// Tickers with a positive reference count.
    pub wanted_tickers: Vec<Ticker>,
    /// Registry counts.
    pub registry: SubscriptionStats,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    stream: Option<Arc<StreamConnection>>,
    registry: Arc<SubscriptionRegistry>,
}

impl HealthServerState {
    /// Create new health server state. `stream` is `None` when streaming
    /// is disabled.
    #[must_use]
    pub fn new(
        version: String,
        stream: Option<Arc<StreamConnection>>,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            stream,
            registry,
        }
    }

    fn report(&self) -> StreamReport {
        StreamReport {
            streaming_enabled: self.stream.is_some(),
            connection: self.stream.as_ref().map(|s| s.status()),
            wanted_tickers: self.registry.wanted_tickers(),
            registry: self.registry.stats(),
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health, metrics and admin HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HttpServerError> {
        serve("health", self.port, router(self.state), self.cancel).await
    }
}

/// Routes served by [`HealthServer`].
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/admin/stream", get(stream_status_handler))
        .route("/admin/stream/reconnect", post(reconnect_handler))
        .route("/admin/stream/resync", post(resync_handler))
        .route("/admin/watchlist/add", post(watchlist_add_handler))
        .route("/admin/watchlist/remove", post(watchlist_remove_handler))
        .route("/admin/watchlist/rename", post(watchlist_rename_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let is_ready = state
        .stream
        .as_ref()
        .is_none_or(|s| s.state() == ConnectionState::Connected);

    if is_ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    metrics::set_registry_tickers(state.registry.stats().ticker_count);

    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

async fn stream_status_handler(State(state): State<Arc<HealthServerState>>) -> Json<StreamReport> {
    Json(state.report())
}

#[derive(Debug, Serialize)]
struct ReconnectResponse {
    started: bool,
    state: ConnectionState,
}

async fn reconnect_handler(State(state): State<Arc<HealthServerState>>) -> Response {
    let Some(stream) = state.stream.as_ref() else {
        return streaming_disabled();
    };
    let started = stream.reconnect_now();
    tracing::info!(started, "Admin requested stream reconnect");

    let status = if started {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(ReconnectResponse {
            started,
            state: stream.state(),
        }),
    )
        .into_response()
}

async fn resync_handler(State(state): State<Arc<HealthServerState>>) -> Response {
    let Some(stream) = state.stream.as_ref() else {
        return streaming_disabled();
    };
    if stream.state() != ConnectionState::Connected {
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "stream not connected" })),
        )
            .into_response();
    }
    Json(stream.resync()).into_response()
}

#[derive(Debug, Deserialize)]
struct TickerRequest {
    ticker: String,
}

#[derive(Debug, Deserialize)]
struct RenameRequest {
    from: String,
    to: String,
}

/// Registry view of one ticker after a watchlist mutation.
#[derive(Debug, Serialize)]
struct WatchlistChange {
    ticker: Ticker,
    transition: Option<Transition>,
    /// Whether a subscribe or unsubscribe went to the stream.
    wire: bool,
    count: usize,
}

impl WatchlistChange {
    fn new(registry: &SubscriptionRegistry, ticker: Ticker, transition: Option<Transition>) -> Self {
        let count = registry.count(ticker.as_str());
        Self {
            ticker,
            transition,
            wire: transition.is_some_and(Transition::touches_wire),
            count,
        }
    }
}

#[derive(Debug, Serialize)]
struct RenameResponse {
    from: WatchlistChange,
    to: WatchlistChange,
}

async fn watchlist_add_handler(
    State(state): State<Arc<HealthServerState>>,
    Json(request): Json<TickerRequest>,
) -> Response {
    let Some(ticker) = Ticker::parse(&request.ticker) else {
        return blank_ticker();
    };
    let transition = state.registry.register(ticker.as_str());
    Json(WatchlistChange::new(&state.registry, ticker, transition)).into_response()
}

async fn watchlist_remove_handler(
    State(state): State<Arc<HealthServerState>>,
    Json(request): Json<TickerRequest>,
) -> Response {
    let Some(ticker) = Ticker::parse(&request.ticker) else {
        return blank_ticker();
    };
    let transition = state.registry.unregister(ticker.as_str());
    Json(WatchlistChange::new(&state.registry, ticker, transition)).into_response()
}

async fn watchlist_rename_handler(
    State(state): State<Arc<HealthServerState>>,
    Json(request): Json<RenameRequest>,
) -> Response {
    let (Some(from), Some(to)) = (Ticker::parse(&request.from), Ticker::parse(&request.to)) else {
        return blank_ticker();
    };
    let (released, added) = state
        .registry
        .rename(from.as_str(), to.as_str())
        .unzip();
    Json(RenameResponse {
        from: WatchlistChange::new(&state.registry, from, released),
        to: WatchlistChange::new(&state.registry, to, added),
    })
    .into_response()
}

fn blank_ticker() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": "ticker must not be blank" })),
    )
        .into_response()
}

fn streaming_disabled() -> Response {
    (
        StatusCode::CONFLICT,
        Json(serde_json::json!({ "error": "streaming disabled" })),
    )
        .into_response()
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let stream = state.report();
    let status = determine_health_status(
        stream.streaming_enabled,
        stream.connection.as_ref().map(|c| c.state),
    );

    HealthResponse {
        status,
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        stream,
    }
}

const fn determine_health_status(
    streaming_enabled: bool,
    state: Option<ConnectionState>,
) -> HealthStatus {
    match (streaming_enabled, state) {
        (false, _) | (true, Some(ConnectionState::Connected)) => HealthStatus::Healthy,
        (true, Some(ConnectionState::Closing)) => HealthStatus::Unhealthy,
        (true, _) => HealthStatus::Degraded,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    use crate::application::ports::WireSubscriber;

    fn disabled_state() -> Arc<HealthServerState> {
        let registry = Arc::new(SubscriptionRegistry::disabled());
        Arc::new(HealthServerState::new("test".to_string(), None, registry))
    }

    #[derive(Default)]
    struct RecordingWire {
        calls: parking_lot::Mutex<Vec<String>>,
    }

    impl WireSubscriber for RecordingWire {
        fn subscribe(&self, ticker: &Ticker) {
            self.calls.lock().push(format!("+{ticker}"));
        }

        fn unsubscribe(&self, ticker: &Ticker) {
            self.calls.lock().push(format!("-{ticker}"));
        }
    }

    fn registry_state() -> (Arc<HealthServerState>, Arc<SubscriptionRegistry>, Arc<RecordingWire>) {
        let wire = Arc::new(RecordingWire::default());
        let registry = Arc::new(SubscriptionRegistry::new(wire.clone()));
        let state = Arc::new(HealthServerState::new(
            "test".to_string(),
            None,
            Arc::clone(&registry),
        ));
        (state, registry, wire)
    }

    async fn post_json(
        state: &Arc<HealthServerState>,
        path: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let response = router(Arc::clone(state))
            .oneshot(
                Request::post(path)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
    }

    #[test]
    fn status_matrix() {
        assert_eq!(determine_health_status(false, None), HealthStatus::Healthy);
        assert_eq!(
            determine_health_status(true, Some(ConnectionState::Connected)),
            HealthStatus::Healthy
        );
        assert_eq!(
            determine_health_status(true, Some(ConnectionState::Disconnected)),
            HealthStatus::Degraded
        );
        assert_eq!(
            determine_health_status(true, Some(ConnectionState::Connecting)),
            HealthStatus::Degraded
        );
        assert_eq!(
            determine_health_status(true, Some(ConnectionState::Closing)),
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn ready_when_streaming_disabled() {
        let response = router(disabled_state())
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn admin_actions_conflict_when_disabled() {
        for path in ["/admin/stream/reconnect", "/admin/stream/resync"] {
            let response = router(disabled_state())
                .oneshot(Request::post(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CONFLICT, "{path}");
        }
    }

    #[tokio::test]
    async fn admin_status_reports_disabled_stream() {
        let response = router(disabled_state())
            .oneshot(Request::get("/admin/stream").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["streaming_enabled"], false);
        assert!(json.get("state").is_none());
        assert_eq!(json["wanted_tickers"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn watchlist_edges_drive_the_wire() {
        let (state, registry, wire) = registry_state();

        let (status, first) = post_json(&state, "/admin/watchlist/add", json!({"ticker": "aapl"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["ticker"], "AAPL");
        assert_eq!(first["transition"], json!({"kind": "activated"}));
        assert_eq!(first["wire"], true);
        assert_eq!(first["count"], 1);

        let (_, second) = post_json(&state, "/admin/watchlist/add", json!({"ticker": "AAPL"})).await;
        assert_eq!(second["transition"], json!({"kind": "retained", "count": 2}));
        assert_eq!(second["wire"], false);

        let (_, removed) =
            post_json(&state, "/admin/watchlist/remove", json!({"ticker": " aapl "})).await;
        assert_eq!(removed["wire"], false);
        assert_eq!(removed["count"], 1);

        let (_, last) = post_json(&state, "/admin/watchlist/remove", json!({"ticker": "AAPL"})).await;
        assert_eq!(last["transition"], json!({"kind": "deactivated"}));
        assert_eq!(last["wire"], true);

        assert_eq!(registry.count("AAPL"), 0);
        assert_eq!(*wire.calls.lock(), vec!["+AAPL", "-AAPL"]);
    }

    #[tokio::test]
    async fn watchlist_rename_moves_a_reference() {
        let (state, registry, wire) = registry_state();
        registry.register("AAPL");

        let (status, body) = post_json(
            &state,
            "/admin/watchlist/rename",
            json!({"from": "aapl", "to": "msft"}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["from"]["ticker"], "AAPL");
        assert_eq!(body["from"]["transition"], json!({"kind": "deactivated"}));
        assert_eq!(body["to"]["ticker"], "MSFT");
        assert_eq!(body["to"]["count"], 1);
        assert_eq!(registry.wanted_tickers(), vec![Ticker::parse("MSFT").unwrap()]);
        assert_eq!(*wire.calls.lock(), vec!["+AAPL", "-AAPL", "+MSFT"]);
    }

    #[tokio::test]
    async fn blank_watchlist_ticker_is_bad_request() {
        let (state, registry, wire) = registry_state();

        for (path, body) in [
            ("/admin/watchlist/add", json!({"ticker": "  "})),
            ("/admin/watchlist/remove", json!({"ticker": ""})),
            ("/admin/watchlist/rename", json!({"from": "AAPL", "to": " "})),
        ] {
            let (status, _) = post_json(&state, path, body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{path}");
        }
        assert_eq!(registry.stats().ticker_count, 0);
        assert!(wire.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn watchlist_changes_are_noops_when_streaming_disabled() {
        let state = disabled_state();

        let (status, body) = post_json(&state, "/admin/watchlist/add", json!({"ticker": "AAPL"})).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body["transition"].is_null());
        assert_eq!(body["wire"], false);
        assert_eq!(body["count"], 0);
    }
}
