//! Finnhub Stream Connection
//!
//! One persistent websocket session to Finnhub's trade stream, driven as
//! an explicit state machine:
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──handshake──▶ Connected
//!      ▲                          │                        │
//!      └────── error / close ─────┴────────────────────────┘
//!
//! any state ──shutdown()──▶ Closing (terminal)
//! ```
//!
//! Each connect attempt runs as one session task. A failed or dropped
//! session schedules exactly one delayed reconnect task, which shutdown
//! cancels. On every successful connect the wire subscription set is
//! rebuilt from the [`SubscriptionRegistry`]; whatever the previous
//! session had subscribed is forgotten.
//!
//! Subscribe and unsubscribe requests from the registry go through
//! [`StreamHandle`], which owns the active-ticker set and a bounded
//! outbound queue drained by the session task.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::codec::{CodecError, FinnhubCodec};
use super::heartbeat::{HeartbeatConfig, HeartbeatError, LivenessMonitor};
use super::messages::{ControlMessage, InboundFrame};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::WireSubscriber;
use crate::application::services::{SubscriptionRegistry, TradeIngestionPipeline};
use crate::domain::ticker::Ticker;
use crate::domain::trade::{TradeRecord, TradeSource};
use crate::infrastructure::config::{Credentials, DEFAULT_WEBSOCKET_URL, StreamSettings};
use crate::infrastructure::metrics;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// Error Type
// =============================================================================

/// Reasons a session ended.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Handshake did not finish in time.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// No traffic within the idle timeout.
    #[error("connection idle: {0}")]
    Idle(#[from] HeartbeatError),

    /// Server closed the connection.
    #[error("connection closed by server")]
    ConnectionClosed,
}

// =============================================================================
// State and Events
// =============================================================================

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No session; a reconnect may be pending.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Session live.
    Connected,
    /// Shut down; never reconnects.
    Closing,
}

impl ConnectionState {
    /// Lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted to the owning task.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Session established and `restored` subscriptions re-sent.
    Connected {
        /// Subscribe frames sent during reconciliation.
        restored: usize,
    },
    /// Session ended.
    Disconnected {
        /// Why.
        reason: String,
    },
    /// A reconnect attempt was scheduled.
    Reconnecting {
        /// Attempt number since the last successful connect.
        attempt: u32,
        /// Wait before the attempt.
        delay: Duration,
    },
    /// A batch of raw trade records.
    Trades(Vec<TradeRecord>),
}

// =============================================================================
// Configuration
// =============================================================================

/// Everything one connection needs.
#[derive(Clone)]
pub struct StreamConfig {
    /// Endpoint without the token.
    pub url: String,
    api_key: String,
    /// Reconnect delay schedule.
    pub reconnect: ReconnectConfig,
    /// Liveness settings.
    pub heartbeat: HeartbeatConfig,
    /// Handshake timeout.
    pub connect_timeout: Duration,
    /// Upstream subscription cap.
    pub max_subscriptions: usize,
    /// Control-message queue capacity.
    pub outbound_capacity: usize,
}

impl std::fmt::Debug for StreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConfig")
            .field("url", &self.url)
            .field("api_key", &"[REDACTED]")
            .field("reconnect", &self.reconnect)
            .field("heartbeat", &self.heartbeat)
            .field("connect_timeout", &self.connect_timeout)
            .field("max_subscriptions", &self.max_subscriptions)
            .field("outbound_capacity", &self.outbound_capacity)
            .finish()
    }
}

impl StreamConfig {
    /// Configuration with default timings.
    #[must_use]
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let defaults = StreamSettings::default();
        Self {
            url: url.into(),
            api_key: api_key.into(),
            reconnect: ReconnectConfig::from_settings(&defaults),
            heartbeat: HeartbeatConfig::from_settings(&defaults),
            connect_timeout: defaults.connect_timeout,
            max_subscriptions: defaults.max_subscriptions,
            outbound_capacity: defaults.outbound_capacity,
        }
    }

    /// Build from loaded settings.
    #[must_use]
    pub fn from_settings(settings: &StreamSettings, credentials: &Credentials) -> Self {
        let url = if settings.url.is_empty() {
            DEFAULT_WEBSOCKET_URL.to_string()
        } else {
            settings.url.clone()
        };
        Self {
            url,
            api_key: credentials.api_key().to_string(),
            reconnect: ReconnectConfig::from_settings(settings),
            heartbeat: HeartbeatConfig::from_settings(settings),
            connect_timeout: settings.connect_timeout,
            max_subscriptions: settings.max_subscriptions.max(1),
            outbound_capacity: settings.outbound_capacity.max(1),
        }
    }

    /// Replace the reconnect schedule.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Replace the liveness settings.
    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Replace the subscription cap.
    #[must_use]
    pub fn with_max_subscriptions(mut self, max: usize) -> Self {
        self.max_subscriptions = max.max(1);
        self
    }

    /// Replace the outbound queue capacity.
    #[must_use]
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    /// Endpoint with the token appended.
    #[must_use]
    pub fn endpoint(&self) -> String {
        if self.api_key.is_empty() {
            return self.url.clone();
        }
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{separator}token={}", self.url, self.api_key)
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Result of a wire subscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// Frame queued; ticker marked active.
    Queued,
    /// Ticker already subscribed on this session.
    AlreadyActive,
    /// No live session; reconciliation on connect covers it.
    NotConnected,
    /// Upstream cap reached.
    LimitReached,
    /// Outbound queue full; frame dropped.
    QueueFull,
}

/// Result of a wire unsubscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// Frame queued; ticker no longer active.
    Queued,
    /// Ticker was not subscribed on this session.
    NotActive,
    /// No live session.
    NotConnected,
    /// Outbound queue full; ticker stays active.
    QueueFull,
}

/// Point-in-time view for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Whether a session is live.
    pub connected: bool,
    /// Symbols subscribed on the current session.
    pub active_subscriptions: usize,
    /// Upstream cap.
    pub max_subscriptions: usize,
    /// Cap minus active.
    pub remaining_slots: usize,
    /// Active symbols, sorted.
    pub active_tickers: Vec<Ticker>,
    /// Reconnects scheduled since start.
    pub reconnects: u64,
    /// Text frames received since start.
    pub frames_received: u64,
}

#[derive(Debug)]
struct Shared {
    state: RwLock<ConnectionState>,
    active: Mutex<HashSet<Ticker>>,
    outbound: mpsc::Sender<ControlMessage>,
    max_subscriptions: usize,
    reconnects: AtomicU64,
    frames_received: AtomicU64,
}

// Lock order when more than one is held: registry ledger, then `active`,
// then `state`.

/// Cloneable front door to the connection's wire state.
///
/// This is the [`WireSubscriber`] the registry drives. It never blocks:
/// frames go into a bounded queue that the live session drains.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    shared: Arc<Shared>,
}

impl StreamHandle {
    /// Create a handle and the receiving end of its outbound queue.
    #[must_use]
    pub fn channel(config: &StreamConfig) -> (Self, mpsc::Receiver<ControlMessage>) {
        let (outbound, rx) = mpsc::channel(config.outbound_capacity.max(1));
        let shared = Shared {
            state: RwLock::new(ConnectionState::Disconnected),
            active: Mutex::new(HashSet::new()),
            outbound,
            max_subscriptions: config.max_subscriptions.max(1),
            reconnects: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            rx,
        )
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Whether a session is live.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Upstream cap.
    #[must_use]
    pub fn max_subscriptions(&self) -> usize {
        self.shared.max_subscriptions
    }

    /// Symbols subscribed on the current session, sorted.
    #[must_use]
    pub fn active_tickers(&self) -> Vec<Ticker> {
        let mut tickers: Vec<_> = self.shared.active.lock().iter().cloned().collect();
        tickers.sort();
        tickers
    }

    /// Queue a subscribe frame if connected, not yet active and under the cap.
    pub fn request_subscribe(&self, ticker: &Ticker) -> SubscribeOutcome {
        let mut active = self.shared.active.lock();
        if *self.shared.state.read() != ConnectionState::Connected {
            tracing::debug!(ticker = %ticker, "Stream not connected, subscribe deferred");
            return SubscribeOutcome::NotConnected;
        }
        if active.contains(ticker) {
            return SubscribeOutcome::AlreadyActive;
        }
        if active.len() >= self.shared.max_subscriptions {
            tracing::warn!(
                ticker = %ticker,
                limit = self.shared.max_subscriptions,
                "Subscription limit reached, subscribe rejected"
            );
            return SubscribeOutcome::LimitReached;
        }

        match self
            .shared
            .outbound
            .try_send(ControlMessage::subscribe(ticker.clone()))
        {
            Ok(()) => {
                active.insert(ticker.clone());
                metrics::set_active_subscriptions(active.len());
                SubscribeOutcome::Queued
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(ticker = %ticker, "Outbound queue full, subscribe dropped");
                SubscribeOutcome::QueueFull
            }
            Err(TrySendError::Closed(_)) => SubscribeOutcome::NotConnected,
        }
    }

    /// Queue an unsubscribe frame if the ticker is active.
    pub fn request_unsubscribe(&self, ticker: &Ticker) -> UnsubscribeOutcome {
        let mut active = self.shared.active.lock();
        if *self.shared.state.read() != ConnectionState::Connected {
            tracing::debug!(ticker = %ticker, "Stream not connected, unsubscribe skipped");
            return UnsubscribeOutcome::NotConnected;
        }
        if !active.contains(ticker) {
            return UnsubscribeOutcome::NotActive;
        }

        match self
            .shared
            .outbound
            .try_send(ControlMessage::unsubscribe(ticker.clone()))
        {
            Ok(()) => {
                active.remove(ticker);
                metrics::set_active_subscriptions(active.len());
                UnsubscribeOutcome::Queued
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(ticker = %ticker, "Outbound queue full, unsubscribe dropped");
                UnsubscribeOutcome::QueueFull
            }
            Err(TrySendError::Closed(_)) => UnsubscribeOutcome::NotConnected,
        }
    }

    /// Snapshot for the admin surface.
    #[must_use]
    pub fn status(&self) -> StreamStatus {
        let active_tickers = self.active_tickers();
        let state = self.state();
        StreamStatus {
            state,
            connected: state == ConnectionState::Connected,
            active_subscriptions: active_tickers.len(),
            max_subscriptions: self.shared.max_subscriptions,
            remaining_slots: self
                .shared
                .max_subscriptions
                .saturating_sub(active_tickers.len()),
            active_tickers,
            reconnects: self.shared.reconnects.load(Ordering::Relaxed),
            frames_received: self.shared.frames_received.load(Ordering::Relaxed),
        }
    }
}

impl WireSubscriber for StreamHandle {
    fn subscribe(&self, ticker: &Ticker) {
        let _ = self.request_subscribe(ticker);
    }

    fn unsubscribe(&self, ticker: &Ticker) {
        let _ = self.request_unsubscribe(ticker);
    }
}

// =============================================================================
// Connection
// =============================================================================

/// Result of an admin resync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    /// Subscribe frames queued.
    pub subscribed: usize,
    /// Unsubscribe frames queued.
    pub unsubscribed: usize,
}

/// The process-wide Finnhub stream connection.
pub struct StreamConnection {
    config: StreamConfig,
    handle: StreamHandle,
    outbound: tokio::sync::Mutex<mpsc::Receiver<ControlMessage>>,
    registry: Arc<SubscriptionRegistry>,
    events: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    codec: FinnhubCodec,
    policy: Mutex<ReconnectPolicy>,
    reconnect_pending: AtomicBool,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    session_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("config", &self.config)
            .field("state", &self.handle.state())
            .finish_non_exhaustive()
    }
}

impl StreamConnection {
    /// Create a connection around an existing handle.
    ///
    /// `outbound` must be the receiver returned with `handle` by
    /// [`StreamHandle::channel`]. Nothing connects until
    /// [`connect`](Self::connect).
    #[must_use]
    pub fn new(
        config: StreamConfig,
        handle: StreamHandle,
        outbound: mpsc::Receiver<ControlMessage>,
        registry: Arc<SubscriptionRegistry>,
        events: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let policy = ReconnectPolicy::new(config.reconnect.clone());
        Arc::new(Self {
            config,
            handle,
            outbound: tokio::sync::Mutex::new(outbound),
            registry,
            events,
            cancel,
            codec: FinnhubCodec::new(),
            policy: Mutex::new(policy),
            reconnect_pending: AtomicBool::new(false),
            reconnect_task: Mutex::new(None),
            session_task: Mutex::new(None),
        })
    }

    /// Create a connection together with the registry that drives it.
    #[must_use]
    pub fn with_registry(
        config: StreamConfig,
        events: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> (Arc<Self>, Arc<SubscriptionRegistry>) {
        let (handle, outbound) = StreamHandle::channel(&config);
        let registry = Arc::new(SubscriptionRegistry::new(Arc::new(handle.clone())));
        let connection = Self::new(
            config,
            handle,
            outbound,
            Arc::clone(&registry),
            events,
            cancel,
        );
        (connection, registry)
    }

    /// Handle for status and wire requests.
    #[must_use]
    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    /// Start a connect attempt in the background.
    ///
    /// Only `Disconnected` moves to `Connecting`; a call while an attempt
    /// or session is in flight, or after shutdown, returns `false`.
    pub fn connect(self: &Arc<Self>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        {
            let mut state = self.handle.shared.state.write();
            if *state != ConnectionState::Disconnected {
                tracing::debug!(state = state.as_str(), "Connect ignored");
                return false;
            }
            *state = ConnectionState::Connecting;
        }

        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.run_session().await });
        *self.session_task.lock() = Some(task);
        true
    }

    /// Cancel any pending delayed reconnect and connect now.
    pub fn reconnect_now(self: &Arc<Self>) -> bool {
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
        self.reconnect_pending.store(false, Ordering::SeqCst);
        self.policy.lock().reset();
        self.connect()
    }

    /// Bring the wire subscription set in line with the registry.
    ///
    /// Does nothing unless connected.
    pub fn resync(&self) -> ResyncReport {
        if !self.handle.is_connected() {
            return ResyncReport::default();
        }

        self.registry.with_wanted_tickers(|wanted| {
            let active: HashSet<Ticker> = self.handle.shared.active.lock().clone();
            let wanted_set: HashSet<&Ticker> = wanted.iter().collect();
            let mut report = ResyncReport::default();

            let mut stale: Vec<_> = active.iter().filter(|t| !wanted_set.contains(t)).collect();
            stale.sort();
            for ticker in stale {
                if self.handle.request_unsubscribe(ticker) == UnsubscribeOutcome::Queued {
                    report.unsubscribed += 1;
                }
            }
            for ticker in wanted.iter().filter(|t| !active.contains(*t)) {
                if self.handle.request_subscribe(ticker) == SubscribeOutcome::Queued {
                    report.subscribed += 1;
                }
            }

            tracing::info!(
                subscribed = report.subscribed,
                unsubscribed = report.unsubscribed,
                "Stream subscriptions resynced"
            );
            report
        })
    }

    /// Snapshot for the admin surface.
    #[must_use]
    pub fn status(&self) -> StreamStatus {
        self.handle.status()
    }

    /// Close the session and cancel any pending reconnect.
    ///
    /// After this returns no reconnect fires. The registry is untouched.
    pub async fn shutdown(&self) {
        *self.handle.shared.state.write() = ConnectionState::Closing;
        self.cancel.cancel();

        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
        self.reconnect_pending.store(false, Ordering::SeqCst);

        let session = self.session_task.lock().take();
        if let Some(session) = session
            && tokio::time::timeout(SHUTDOWN_GRACE, session).await.is_err()
        {
            tracing::warn!("Finnhub session did not close within grace period");
        }

        self.handle.shared.active.lock().clear();
        metrics::set_stream_connected(false);
        metrics::set_active_subscriptions(0);
        tracing::info!("Finnhub stream shut down");
    }

    // -------------------------------------------------------------------------
    // Session
    // -------------------------------------------------------------------------

    async fn run_session(self: Arc<Self>) {
        match self.connect_and_run().await {
            Ok(()) => {
                let mut state = self.handle.shared.state.write();
                *state = ConnectionState::Closing;
                drop(state);
                tracing::info!("Finnhub session closed");
            }
            Err(error) => self.on_disconnected(&error).await,
        }
    }

    async fn connect_and_run(&self) -> Result<(), StreamError> {
        tracing::info!(url = %self.config.url, "Connecting to Finnhub stream");

        let endpoint = self.config.endpoint();
        let handshake = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            result = tokio::time::timeout(
                self.config.connect_timeout,
                tokio_tungstenite::connect_async(endpoint.as_str()),
            ) => result,
        };
        let (ws_stream, _response) =
            handshake.map_err(|_| StreamError::HandshakeTimeout(self.config.connect_timeout))??;
        let (mut write, mut read) = ws_stream.split();

        let mut outbound = self.outbound.lock().await;
        let stale = drain(&mut outbound);
        if stale > 0 {
            tracing::debug!(discarded = stale, "Discarded control messages from before connect");
        }

        let Some(restore) = self.on_connected() else {
            return Ok(());
        };
        for ticker in &restore {
            self.send_control(&mut write, &ControlMessage::subscribe(ticker.clone()))
                .await?;
        }
        tracing::info!(restored = restore.len(), "Connected to Finnhub stream");
        self.emit(StreamEvent::Connected {
            restored: restore.len(),
        })
        .await;

        let mut monitor = LivenessMonitor::new(self.config.heartbeat.clone());
        let mut ping_timer = monitor.ping_timer();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }

                _ = ping_timer.tick() => {
                    monitor.check()?;
                    write.send(Message::Ping(Vec::new().into())).await?;
                }

                Some(control) = outbound.recv() => {
                    self.send_control(&mut write, &control).await?;
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            monitor.record_activity();
                            self.handle_text(&text).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            monitor.record_activity();
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(?frame, "Finnhub closed the connection");
                            return Err(StreamError::ConnectionClosed);
                        }
                        Some(Ok(_)) => monitor.record_activity(),
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(StreamError::ConnectionClosed),
                    }
                }
            }
        }
    }

    /// Move `Connecting` to `Connected` and claim the registry's wanted
    /// set. Returns the tickers to subscribe, or `None` if shutdown won.
    fn on_connected(&self) -> Option<Vec<Ticker>> {
        {
            let mut active = self.handle.shared.active.lock();
            let mut state = self.handle.shared.state.write();
            if *state != ConnectionState::Connecting {
                return None;
            }
            *state = ConnectionState::Connected;
            active.clear();
        }
        self.policy.lock().reset();
        metrics::set_stream_connected(true);

        let max = self.handle.shared.max_subscriptions;
        let restore = self.registry.with_wanted_tickers(|wanted| {
            let mut active = self.handle.shared.active.lock();
            let mut restore = Vec::new();
            for ticker in wanted {
                if active.contains(ticker) {
                    continue;
                }
                if active.len() >= max {
                    tracing::warn!(
                        ticker = %ticker,
                        limit = max,
                        "Subscription limit reached during reconciliation"
                    );
                    continue;
                }
                active.insert(ticker.clone());
                restore.push(ticker.clone());
            }
            metrics::set_active_subscriptions(active.len());
            restore
        });
        Some(restore)
    }

    async fn on_disconnected(self: &Arc<Self>, error: &StreamError) {
        {
            let mut active = self.handle.shared.active.lock();
            let mut state = self.handle.shared.state.write();
            if *state == ConnectionState::Closing {
                return;
            }
            *state = ConnectionState::Disconnected;
            active.clear();
        }
        metrics::set_stream_connected(false);
        metrics::set_active_subscriptions(0);
        tracing::warn!(error = %error, "Finnhub stream disconnected");

        self.emit(StreamEvent::Disconnected {
            reason: error.to_string(),
        })
        .await;
        self.schedule_reconnect();
    }

    /// Schedule one delayed reconnect. Returns `false` if one is already
    /// pending, the policy gave up, or the connection is shutting down.
    fn schedule_reconnect(self: &Arc<Self>) -> bool {
        if self.cancel.is_cancelled() || self.state() == ConnectionState::Closing {
            return false;
        }

        let mut slot = self.reconnect_task.lock();
        if self.reconnect_pending.swap(true, Ordering::SeqCst) {
            tracing::debug!("Reconnect already scheduled");
            return false;
        }

        let (delay, attempt) = {
            let mut policy = self.policy.lock();
            match policy.next_delay() {
                Ok(delay) => (delay, policy.attempt_count()),
                Err(error) => {
                    tracing::error!(
                        error = %error,
                        "Giving up on Finnhub stream until an admin reconnect"
                    );
                    self.reconnect_pending.store(false, Ordering::SeqCst);
                    return false;
                }
            }
        };

        self.handle.shared.reconnects.fetch_add(1, Ordering::Relaxed);
        metrics::record_reconnect();
        tracing::info!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Scheduling Finnhub reconnect"
        );
        if self
            .events
            .try_send(StreamEvent::Reconnecting { attempt, delay })
            .is_err()
        {
            tracing::debug!("Reconnect event not delivered");
        }

        let this = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            tokio::select! {
                () = this.cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    this.reconnect_pending.store(false, Ordering::SeqCst);
                    this.connect();
                }
            }
        }));
        true
    }

    async fn handle_text(&self, text: &str) {
        self.handle
            .shared
            .frames_received
            .fetch_add(1, Ordering::Relaxed);

        match self.codec.decode(text) {
            Ok(InboundFrame::Ping) => tracing::trace!("Finnhub ping"),
            Ok(InboundFrame::Trades(records)) => {
                if records.is_empty() {
                    return;
                }
                metrics::record_trades_received(TradeSource::Stream, records.len());
                self.emit(StreamEvent::Trades(records)).await;
            }
            Ok(InboundFrame::Error(message)) => {
                tracing::warn!(message = %message, "Finnhub reported an error");
            }
            Ok(InboundFrame::Other(kind)) => {
                tracing::debug!(kind = %kind, "Ignoring Finnhub frame");
            }
            Err(CodecError::Json(error)) => {
                metrics::record_malformed_frame();
                tracing::warn!(error = %error, "Dropping malformed Finnhub frame");
            }
        }
    }

    async fn send_control<S>(&self, write: &mut S, control: &ControlMessage) -> Result<(), StreamError>
    where
        S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let text = match self.codec.encode(control) {
            Ok(text) => text,
            Err(error) => {
                tracing::warn!(error = %error, "Failed to encode control message");
                return Ok(());
            }
        };
        tracing::debug!(
            action = control.action(),
            ticker = %control.symbol(),
            "Sending control message"
        );
        write.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn emit(&self, event: StreamEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("Stream event receiver dropped");
        }
    }
}

fn drain(rx: &mut mpsc::Receiver<ControlMessage>) -> usize {
    let mut discarded = 0;
    while rx.try_recv().is_ok() {
        discarded += 1;
    }
    discarded
}

// =============================================================================
// Event Consumer
// =============================================================================

/// Feed stream events into the ingestion pipeline until the sender side
/// is dropped. Batches are ingested in arrival order.
pub async fn forward_events(
    mut events: mpsc::Receiver<StreamEvent>,
    pipeline: Arc<TradeIngestionPipeline>,
) {
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Trades(records) => {
                let started = std::time::Instant::now();
                let summary = pipeline.ingest_batch(records, TradeSource::Stream).await;
                metrics::record_batch(TradeSource::Stream, &summary, started.elapsed());
            }
            StreamEvent::Connected { restored } => {
                tracing::debug!(restored, "Stream connected");
            }
            StreamEvent::Disconnected { reason } => {
                tracing::debug!(reason = %reason, "Stream disconnected");
            }
            StreamEvent::Reconnecting { attempt, delay } => {
                tracing::debug!(attempt, ?delay, "Stream reconnect pending");
            }
        }
    }
    tracing::info!("Stream event consumer stopped");
}
