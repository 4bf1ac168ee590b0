#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Stream Ingest - Real-time Price Ingestion
//!
//! Keeps one websocket session to Finnhub's trade stream subscribed to
//! every ticker on any watchlist, accepts the same trades pushed by
//! webhook, and funnels both channels into one ingestion pipeline that
//! writes price ticks, updates fundamentals snapshots, and triggers
//! throttled price notifications.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure types and rules
//!   - `ticker`: symbol normalization
//!   - `trade`: trade validation, ticks, snapshots, daily change
//!   - `subscription`: reference-count ledger
//!   - `notification`: per-ticker throttle and payload
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: tick store, fundamentals cache, notifications, watchlist, wire
//!   - `services`: subscription registry, trade ingestion pipeline
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `finnhub`: websocket client, codec, reconnect, heartbeat
//!   - `webhook`: `POST /webhooks/finnhub`
//!   - `persistence`, `notification`: in-memory and logging adapters
//!   - `config`, `telemetry`, `metrics`
//!   - `health`: probes, metrics, stream admin, watchlist mutation hooks
//!
//! # Data Flow
//!
//! ```text
//! /admin/watchlist/* ► SubscriptionRegistry ──► StreamHandle ──► Finnhub WS
//!
//! Finnhub WS ──────► StreamConnection ──┐
//!                                       ├──► TradeIngestionPipeline ──► ticks
//! Finnhub webhook ─► webhook router ────┘              │                snapshots
//!                                                      └──► throttle ──► notifications
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::notification::{NotificationThrottle, PriceUpdateNotification};
pub use domain::subscription::{SubscriptionStats, Transition};
pub use domain::ticker::Ticker;
pub use domain::trade::{
    FundamentalsSnapshot, PriceTick, PriceUpdate, RecordError, TradeEvent, TradeRecord,
    TradeSource,
};

// Application services
pub use application::services::{
    BatchSummary, IngestOutcome, IngestedTrade, SubscriptionRegistry, TradeIngestionPipeline,
};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, Credentials, IngestConfig, ServerSettings, StreamSettings,
};

// Stream client
pub use infrastructure::finnhub::{
    ConnectionState, StreamConfig, StreamConnection, StreamEvent, StreamHandle, StreamStatus,
};

// HTTP surfaces
pub use infrastructure::health::{HealthServer, HealthServerState};
pub use infrastructure::http::HttpServerError;
pub use infrastructure::webhook::{WebhookServer, WebhookState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
