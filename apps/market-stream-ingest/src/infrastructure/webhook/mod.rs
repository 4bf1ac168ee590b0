//! Finnhub Webhook Ingestion
//!
//! `POST /webhooks/finnhub` receives the same trade batches the stream
//! delivers, pushed by Finnhub instead. Requests are checked in order:
//!
//! 1. `X-Finnhub-Secret` must equal the configured secret, else 401. The
//!    body is not read on this path.
//! 2. The body must be a JSON object, else 400.
//! 3. Bodies whose `event` is missing or not `trade` are acknowledged with
//!    200 and ignored, whatever their `data` holds.
//! 4. A `trade` event whose `data` is present but not an array is 400.
//!    Absent or `null` data is an empty batch. Each array element is
//!    validated on its own during ingestion.
//! 5. Trade batches are handed to the ingestion pipeline on a spawned
//!    task and the request returns 200 without waiting for storage.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::application::services::TradeIngestionPipeline;
use crate::domain::trade::{TradeRecord, TradeSource};
use crate::infrastructure::finnhub::messages::trade_records;
use crate::infrastructure::http::{HttpServerError, serve};
use crate::infrastructure::metrics::{self, WebhookOutcome};

/// Header carrying the shared secret.
pub const SECRET_HEADER: &str = "x-finnhub-secret";

/// Route path.
pub const WEBHOOK_PATH: &str = "/webhooks/finnhub";

/// Classified webhook body.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookPayload {
    /// A `trade` event and its records, possibly empty.
    Trades(Vec<TradeRecord>),
    /// Any other event. Empty when `event` is missing or not a string.
    Ignored(String),
}

/// Reasons a webhook body is refused with 400.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// Body is not JSON at all.
    #[error("body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Body is JSON but not an object.
    #[error("body is not a JSON object")]
    NotAnObject,

    /// `trade` event whose `data` is not an array.
    #[error("trade data is not an array")]
    DataNotArray,
}

impl WebhookPayload {
    /// Classify a raw body by `event` before looking at `data`.
    ///
    /// # Errors
    ///
    /// Returns `PayloadError` when the body is not a JSON object or a
    /// `trade` event carries a non-array `data`.
    pub fn parse(body: &[u8]) -> Result<Self, PayloadError> {
        let Value::Object(mut fields) = serde_json::from_slice(body)? else {
            return Err(PayloadError::NotAnObject);
        };
        match fields.remove("event") {
            Some(Value::String(event)) if event == "trade" => trade_records(fields.remove("data"))
                .map(Self::Trades)
                .map_err(|_| PayloadError::DataNotArray),
            Some(Value::String(event)) => Ok(Self::Ignored(event)),
            _ => Ok(Self::Ignored(String::new())),
        }
    }
}

/// Acknowledgement body.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookAck {
    /// Always `true` for 200 responses.
    pub accepted: bool,
    /// Records handed to the pipeline.
    pub queued: usize,
}

/// Shared state for the webhook route.
pub struct WebhookState {
    secret: Option<String>,
    pipeline: Arc<TradeIngestionPipeline>,
}

impl std::fmt::Debug for WebhookState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookState")
            .field("secret_configured", &self.secret.is_some())
            .finish_non_exhaustive()
    }
}

impl WebhookState {
    /// Create state. A `None` or empty secret rejects every request.
    #[must_use]
    pub fn new(secret: Option<String>, pipeline: Arc<TradeIngestionPipeline>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            pipeline,
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = self.secret.as_deref() else {
            return false;
        };
        headers
            .get(SECRET_HEADER)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|provided| provided == expected)
    }
}

/// Routes for the public listener.
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, post(webhook_handler))
        .with_state(state)
}

/// Public HTTP server hosting the webhook route.
pub struct WebhookServer {
    port: u16,
    state: Arc<WebhookState>,
    cancel: CancellationToken,
}

impl WebhookServer {
    /// Create a new webhook server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<WebhookState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError` if binding fails or the server stops
    /// with an I/O error.
    pub async fn run(self) -> Result<(), HttpServerError> {
        if self.state.secret.is_none() {
            tracing::warn!("FINNHUB_WEBHOOK_SECRET not set, webhook requests will be rejected");
        }
        serve("webhook", self.port, router(self.state), self.cancel).await
    }
}

async fn webhook_handler(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.authorized(&headers) {
        metrics::record_webhook_request(WebhookOutcome::Unauthorized);
        tracing::warn!("Webhook request rejected: bad or missing secret");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let records = match WebhookPayload::parse(&body) {
        Ok(WebhookPayload::Trades(records)) => records,
        Ok(WebhookPayload::Ignored(event)) => {
            metrics::record_webhook_request(WebhookOutcome::Ignored);
            tracing::debug!(event = %event, "Ignoring non-trade webhook event");
            return Json(WebhookAck {
                accepted: true,
                queued: 0,
            })
            .into_response();
        }
        Err(error) => {
            metrics::record_webhook_request(WebhookOutcome::BadRequest);
            tracing::warn!(error = %error, "Webhook body malformed");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "malformed payload" })),
            )
                .into_response();
        }
    };

    let queued = records.len();
    metrics::record_webhook_request(WebhookOutcome::Accepted);
    metrics::record_trades_received(TradeSource::Webhook, queued);

    if queued > 0 {
        let pipeline = Arc::clone(&state.pipeline);
        tokio::spawn(async move {
            let started = Instant::now();
            let summary = pipeline.ingest_batch(records, TradeSource::Webhook).await;
            metrics::record_batch(TradeSource::Webhook, &summary, started.elapsed());
        });
    }

    Json(WebhookAck {
        accepted: true,
        queued,
    })
    .into_response()
}
