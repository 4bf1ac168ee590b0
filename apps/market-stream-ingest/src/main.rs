//! Market Stream Ingest Binary
//!
//! Runs the Finnhub stream client, the webhook listener, and the health
//! and admin listener in one process.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-stream-ingest
//! ```
//!
//! # Environment Variables
//!
//! ## Required (when streaming is enabled)
//! - `FINNHUB_API_KEY`: Finnhub API token
//!
//! ## Optional
//! - `FINNHUB_WEBHOOK_SECRET`: shared secret for `X-Finnhub-Secret` (unset rejects all webhooks)
//! - `FINNHUB_STREAM_ENABLED`: run the websocket client (default: true)
//! - `FINNHUB_WEBSOCKET_URL`: stream endpoint (default: wss://ws.finnhub.io)
//! - `FINNHUB_MAX_SUBSCRIPTIONS`: upstream symbol cap (default: 50)
//! - `FINNHUB_RECONNECT_DELAY_SECS`: delay before reconnecting (default: 5)
//! - `FINNHUB_RECONNECT_JITTER`: random spread on each delay, 0.0 to 1.0 (default: 0.0)
//! - `HTTP_PORT`: webhook listener port (default: 8080)
//! - `HEALTH_PORT`: health, metrics and admin port (default: 8082)
//! - `NOTIFICATION_THROTTLE_SECS`: per-ticker notification gap (default: 60)
//! - `WATCHLIST_SEED_TICKERS`: comma-separated tickers to watch at startup
//! - `OTEL_ENABLED`: export spans over OTLP (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use market_stream_ingest::infrastructure::finnhub::forward_events;
use market_stream_ingest::infrastructure::notification::LoggingNotificationGateway;
use market_stream_ingest::infrastructure::persistence::{
    InMemoryFundamentalsCache, InMemoryPriceTickStore, InMemoryWatchlist,
};
use market_stream_ingest::infrastructure::telemetry;
use market_stream_ingest::{
    HealthServer, HealthServerState, IngestConfig, NotificationThrottle, StreamConfig,
    StreamConnection, SubscriptionRegistry, TradeIngestionPipeline, WebhookServer, WebhookState,
    init_metrics,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffered stream events between the socket reader and the pipeline.
const STREAM_EVENT_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider already installed");
    }

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting market stream ingest");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder unavailable, metrics disabled");
    }

    let config = IngestConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Stores
    let ticks = Arc::new(InMemoryPriceTickStore::new());
    let fundamentals = Arc::new(InMemoryFundamentalsCache::new());
    let watchlist = Arc::new(InMemoryWatchlist::new(config.seed_tickers.iter().cloned()));
    for raw in &config.seed_tickers {
        if !fundamentals.track(raw) {
            tracing::warn!(ticker = %raw, "Ignoring invalid seed ticker");
        }
    }

    // Pipeline
    let pipeline = Arc::new(
        TradeIngestionPipeline::new(ticks, fundamentals).with_notifications(
            Arc::new(LoggingNotificationGateway::new()),
            NotificationThrottle::new(config.notification_throttle),
        ),
    );

    // Stream
    let (connection, registry) = if config.is_streaming_enabled() {
        let stream_config = StreamConfig::from_settings(&config.stream, &config.credentials);
        let (event_tx, event_rx) = mpsc::channel(STREAM_EVENT_CAPACITY);
        let (connection, registry) =
            StreamConnection::with_registry(stream_config, event_tx, shutdown_token.child_token());

        match registry.bootstrap_from(watchlist.as_ref()).await {
            Ok(tickers) => tracing::info!(tickers, "Subscription registry bootstrapped"),
            Err(e) => tracing::warn!(error = %e, "Watchlist unavailable, starting empty"),
        }

        tokio::spawn(forward_events(event_rx, Arc::clone(&pipeline)));
        connection.connect();
        (Some(connection), registry)
    } else {
        tracing::info!("Finnhub streaming disabled, webhook ingestion only");
        (None, Arc::new(SubscriptionRegistry::disabled()))
    };

    // Listeners
    let webhook_state = Arc::new(WebhookState::new(
        config.credentials.webhook_secret().map(str::to_string),
        Arc::clone(&pipeline),
    ));
    let webhook_server = WebhookServer::new(
        config.server.http_port,
        webhook_state,
        shutdown_token.clone(),
    );
    let webhook_task = tokio::spawn(async move {
        if let Err(e) = webhook_server.run().await {
            tracing::error!(error = %e, "Webhook server error");
        }
    });

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        connection.clone(),
        Arc::clone(&registry),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Market stream ingest ready");

    await_shutdown(shutdown_token).await;

    let drain = async {
        if let Some(connection) = connection {
            connection.shutdown().await;
        }
        let _ = tokio::join!(webhook_task, health_task);
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("Shutdown timed out, exiting");
    }

    tracing::info!("Market stream ingest stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &IngestConfig) {
    tracing::info!(
        streaming_enabled = config.is_streaming_enabled(),
        http_port = config.server.http_port,
        health_port = config.server.health_port,
        max_subscriptions = config.stream.max_subscriptions,
        reconnect_delay_secs = config.stream.reconnect_delay.as_secs(),
        reconnect_jitter = config.stream.reconnect_jitter,
        seed_tickers = config.seed_tickers.len(),
        webhook_secret_set = config.credentials.webhook_secret().is_some(),
        "Configuration loaded"
    );
    tracing::debug!(url = %config.stream.url, "Finnhub endpoint");
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
