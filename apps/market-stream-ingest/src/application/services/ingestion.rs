//! Trade Ingestion Pipeline
//!
//! The single funnel both delivery channels feed. For each trade:
//!
//! 1. validate the raw record
//! 2. look up the ticker's snapshot; untracked tickers are dropped
//! 3. append a `PriceTick` tagged with its channel
//! 4. derive the daily change from the previous snapshot price
//! 5. overwrite the snapshot price fields
//! 6. pass the throttle and hand off to the notification gateway
//!
//! Steps 2-5 hold a per-ticker async lock so trades for the same ticker
//! from both channels never interleave their read-modify-write. Trades
//! for different tickers run fully in parallel. A late, older trade can
//! still overwrite a newer price; ordering across channels is not
//! reconstructed here.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;

use crate::application::ports::{
    FundamentalsCache, NotificationGateway, PriceTickStore, StoreError,
};
use crate::domain::notification::{NotificationThrottle, PriceUpdateNotification};
use crate::domain::ticker::Ticker;
use crate::domain::trade::{
    PriceTick, PriceUpdate, RecordError, TradeEvent, TradeRecord, TradeSource,
};

// =============================================================================
// Outcomes
// =============================================================================

/// Storage step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStage {
    /// Snapshot lookup.
    SnapshotLookup,
    /// Tick append.
    TickAppend,
    /// Snapshot write.
    SnapshotUpdate,
}

impl fmt::Display for StoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SnapshotLookup => "snapshot_lookup",
            Self::TickAppend => "tick_append",
            Self::SnapshotUpdate => "snapshot_update",
        })
    }
}

/// A trade that made it all the way through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestedTrade {
    /// Ticker.
    pub ticker: Ticker,
    /// New current price.
    pub price: Decimal,
    /// Derived daily change.
    pub daily_change_percent: Option<Decimal>,
    /// Delivery channel.
    pub source: TradeSource,
    /// Whether a notification was handed to the gateway.
    pub notified: bool,
}

/// What happened to one trade.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// Tick written and snapshot updated.
    Ingested(IngestedTrade),
    /// Raw record failed validation.
    Rejected(RecordError),
    /// No snapshot exists for the ticker.
    Untracked(Ticker),
    /// A storage call failed; the trade is lost.
    Failed {
        /// Failing step.
        stage: StoreStage,
        /// Underlying error.
        error: StoreError,
    },
}

impl IngestOutcome {
    /// Short label for metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Ingested(_) => "ingested",
            Self::Rejected(_) => "invalid",
            Self::Untracked(_) => "untracked",
            Self::Failed { .. } => "store_error",
        }
    }

    /// Whether the trade was persisted.
    #[must_use]
    pub const fn is_ingested(&self) -> bool {
        matches!(self, Self::Ingested(_))
    }
}

/// Tally of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Trades persisted.
    pub ingested: usize,
    /// Records that failed validation.
    pub rejected: usize,
    /// Trades for untracked tickers.
    pub untracked: usize,
    /// Trades lost to storage errors.
    pub failed: usize,
    /// Notifications handed to the gateway.
    pub notified: usize,
}

impl BatchSummary {
    fn record(&mut self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Ingested(trade) => {
                self.ingested += 1;
                self.notified += usize::from(trade.notified);
            }
            IngestOutcome::Rejected(_) => self.rejected += 1,
            IngestOutcome::Untracked(_) => self.untracked += 1,
            IngestOutcome::Failed { .. } => self.failed += 1,
        }
    }

    /// Total trades seen.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.ingested + self.rejected + self.untracked + self.failed
    }
}

// =============================================================================
// Per-Ticker Locks
// =============================================================================

/// Lazily created async mutex per ticker. Entries for untracked tickers
/// are released on the way out, so the map holds tracked tickers plus
/// whatever is in flight.
#[derive(Debug, Default)]
struct TickerLocks {
    locks: parking_lot::Mutex<HashMap<Ticker, Arc<tokio::sync::Mutex<()>>>>,
}

impl TickerLocks {
    fn get(&self, ticker: &Ticker) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks.lock().entry(ticker.clone()).or_default())
    }

    /// Drop the entry unless another task still holds or waits on it.
    fn release(&self, ticker: &Ticker, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock();
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(ticker);
        }
        // Dropped under the map lock so a concurrent release sees the count.
        drop(lock);
        drop(locks);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Shared ingestion entry point for the stream and webhook channels.
pub struct TradeIngestionPipeline {
    ticks: Arc<dyn PriceTickStore>,
    fundamentals: Arc<dyn FundamentalsCache>,
    notifications: Option<Arc<dyn NotificationGateway>>,
    throttle: NotificationThrottle,
    locks: TickerLocks,
}

impl fmt::Debug for TradeIngestionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TradeIngestionPipeline")
            .field("notifications", &self.notifications.is_some())
            .field("throttle", &self.throttle)
            .finish_non_exhaustive()
    }
}

impl TradeIngestionPipeline {
    /// Create a pipeline without notifications.
    #[must_use]
    pub fn new(ticks: Arc<dyn PriceTickStore>, fundamentals: Arc<dyn FundamentalsCache>) -> Self {
        Self {
            ticks,
            fundamentals,
            notifications: None,
            throttle: NotificationThrottle::default(),
            locks: TickerLocks::default(),
        }
    }

    /// Send throttled price notifications through `gateway`.
    #[must_use]
    pub fn with_notifications(
        mut self,
        gateway: Arc<dyn NotificationGateway>,
        throttle: NotificationThrottle,
    ) -> Self {
        self.notifications = Some(gateway);
        self.throttle = throttle;
        self
    }

    /// Ingest a batch in order. Each record is independent: one failure
    /// never stops the rest.
    pub async fn ingest_batch(&self, records: Vec<TradeRecord>, source: TradeSource) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for record in records {
            let outcome = self.ingest_record(record, source).await;
            summary.record(&outcome);
        }

        tracing::debug!(
            source = %source,
            ingested = summary.ingested,
            rejected = summary.rejected,
            untracked = summary.untracked,
            failed = summary.failed,
            "Trade batch processed"
        );
        summary
    }

    /// Validate then ingest one raw record.
    pub async fn ingest_record(&self, record: TradeRecord, source: TradeSource) -> IngestOutcome {
        match record.into_event(source) {
            Ok(event) => self.ingest(event).await,
            Err(error) => {
                tracing::warn!(source = %source, error = %error, "Dropping invalid trade record");
                IngestOutcome::Rejected(error)
            }
        }
    }

    /// Ingest one validated trade.
    pub async fn ingest(&self, event: TradeEvent) -> IngestOutcome {
        let received_at = Utc::now();
        let lock = self.locks.get(&event.ticker);
        let guard = lock.lock().await;

        let snapshot = match self.fundamentals.find(&event.ticker).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                tracing::debug!(
                    ticker = %event.ticker,
                    source = %event.source,
                    "Dropping trade for untracked ticker"
                );
                drop(guard);
                self.locks.release(&event.ticker, lock);
                return IngestOutcome::Untracked(event.ticker);
            }
            Err(error) => return Self::store_failure(&event, StoreStage::SnapshotLookup, error),
        };

        if let Err(error) = self.ticks.append(PriceTick::from_event(&event, received_at)).await {
            return Self::store_failure(&event, StoreStage::TickAppend, error);
        }

        let update = PriceUpdate::derive(&snapshot, event.price, received_at);
        if let Err(error) = self.fundamentals.apply_price_update(&update).await {
            return Self::store_failure(&event, StoreStage::SnapshotUpdate, error);
        }
        drop(guard);

        tracing::debug!(
            ticker = %event.ticker,
            source = %event.source,
            price = %event.price,
            previous = ?update.previous_price,
            change_percent = ?update.daily_change_percent,
            "Trade ingested"
        );

        let notified = self.notify(&event, &update);

        IngestOutcome::Ingested(IngestedTrade {
            ticker: event.ticker,
            price: event.price,
            daily_change_percent: update.daily_change_percent,
            source: event.source,
            notified,
        })
    }

    /// Throttled, fire-and-forget notification. Returns whether one was
    /// handed off.
    fn notify(&self, event: &TradeEvent, update: &PriceUpdate) -> bool {
        let Some(gateway) = self.notifications.as_ref() else {
            return false;
        };
        if !self.throttle.should_notify(&event.ticker) {
            tracing::trace!(ticker = %event.ticker, "Notification throttled");
            return false;
        }

        let notification = PriceUpdateNotification::new(
            event.ticker.clone(),
            event.price,
            update.previous_price,
            update.daily_change_percent,
            event.traded_at,
        );
        let gateway = Arc::clone(gateway);
        tokio::spawn(async move {
            let ticker = notification.ticker.clone();
            if let Err(error) = gateway.send_price_update(notification).await {
                tracing::warn!(ticker = %ticker, error = %error, "Price notification failed");
            }
        });
        true
    }

    fn store_failure(event: &TradeEvent, stage: StoreStage, error: StoreError) -> IngestOutcome {
        tracing::warn!(
            ticker = %event.ticker,
            source = %event.source,
            stage = %stage,
            error = %error,
            "Trade lost to storage failure"
        );
        IngestOutcome::Failed { stage, error }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    use super::*;
    use crate::application::ports::NotificationError;
    use crate::domain::trade::FundamentalsSnapshot;
    use crate::infrastructure::persistence::{InMemoryFundamentalsCache, InMemoryPriceTickStore};

    mockall::mock! {
        Gateway {}

        #[async_trait]
        impl NotificationGateway for Gateway {
            async fn send_price_update(
                &self,
                notification: PriceUpdateNotification,
            ) -> Result<(), NotificationError>;
        }
    }

    struct ChannelGateway(mpsc::UnboundedSender<PriceUpdateNotification>);

    #[async_trait]
    impl NotificationGateway for ChannelGateway {
        async fn send_price_update(
            &self,
            notification: PriceUpdateNotification,
        ) -> Result<(), NotificationError> {
            let _ = self.0.send(notification);
            Ok(())
        }
    }

    struct Fixture {
        ticks: Arc<InMemoryPriceTickStore>,
        cache: Arc<InMemoryFundamentalsCache>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                ticks: Arc::new(InMemoryPriceTickStore::new()),
                cache: Arc::new(InMemoryFundamentalsCache::new()),
            }
        }

        fn pipeline(&self) -> TradeIngestionPipeline {
            TradeIngestionPipeline::new(self.ticks.clone(), self.cache.clone())
        }

        fn track(&self, ticker: &str, price: Option<Decimal>) {
            let ticker = Ticker::parse(ticker).unwrap();
            let snapshot = match price {
                Some(p) => FundamentalsSnapshot::with_price(ticker, p, Utc::now()),
                None => FundamentalsSnapshot::tracked(ticker),
            };
            self.cache.insert(snapshot);
        }

        fn snapshot(&self, ticker: &str) -> FundamentalsSnapshot {
            self.cache.get(&Ticker::parse(ticker).unwrap()).unwrap()
        }
    }

    fn trade(ticker: &str, price: Decimal, source: TradeSource) -> TradeEvent {
        TradeRecord::new(ticker, price, 1_732_285_432_000, Some(dec!(1000)))
            .into_event(source)
            .unwrap()
    }

    #[tokio::test]
    async fn untracked_ticker_writes_nothing() {
        let fx = Fixture::new();
        let outcome = fx.pipeline().ingest(trade("AAPL", dec!(175.50), TradeSource::Webhook)).await;

        assert!(matches!(outcome, IngestOutcome::Untracked(ref t) if t.as_str() == "AAPL"));
        assert!(fx.ticks.is_empty());
        assert!(fx.cache.is_empty());
    }

    #[tokio::test]
    async fn untracked_tickers_leave_no_lock_behind() {
        let fx = Fixture::new();
        fx.track("AAPL", Some(dec!(100)));
        let pipeline = fx.pipeline();

        for i in 0..500 {
            let ticker = format!("X{i}");
            let outcome = pipeline.ingest(trade(&ticker, dec!(1), TradeSource::Stream)).await;
            assert!(matches!(outcome, IngestOutcome::Untracked(_)));
        }
        assert_eq!(pipeline.locks.len(), 0);

        pipeline.ingest(trade("AAPL", dec!(101), TradeSource::Stream)).await;
        pipeline.ingest(trade("AAPL", dec!(102), TradeSource::Stream)).await;
        assert_eq!(pipeline.locks.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_untracked_trades_drain_the_lock_map() {
        let fx = Fixture::new();
        let pipeline = Arc::new(fx.pipeline());

        let handles: Vec<_> = (0..200)
            .map(|i| {
                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(async move {
                    let ticker = format!("Z{}", i % 7);
                    pipeline.ingest(trade(&ticker, dec!(1), TradeSource::Webhook)).await
                })
            })
            .collect();
        for handle in handles {
            assert!(matches!(handle.await.unwrap(), IngestOutcome::Untracked(_)));
        }

        assert_eq!(pipeline.locks.len(), 0);
    }

    #[tokio::test]
    async fn tracked_ticker_appends_tick_and_updates_snapshot() {
        let fx = Fixture::new();
        fx.track("AAPL", Some(dec!(170.00)));

        let outcome = fx.pipeline().ingest(trade("aapl", dec!(175.50), TradeSource::Webhook)).await;

        let IngestOutcome::Ingested(ingested) = outcome else {
            panic!("expected ingestion, got {outcome:?}");
        };
        assert_eq!(ingested.daily_change_percent, Some(dec!(3.2353)));
        assert!(!ingested.notified);

        let ticks = fx.ticks.ticks();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].ticker.as_str(), "AAPL");
        assert_eq!(ticks[0].price, dec!(175.50));
        assert_eq!(ticks[0].source, TradeSource::Webhook);

        let snapshot = fx.snapshot("AAPL");
        assert_eq!(snapshot.current_price, Some(dec!(175.50)));
        assert_eq!(snapshot.daily_change_percent, Some(dec!(3.2353)));
        assert!(snapshot.last_updated_at.is_some());
    }

    #[tokio::test]
    async fn ten_percent_move() {
        let fx = Fixture::new();
        fx.track("MSFT", Some(dec!(100)));

        fx.pipeline().ingest(trade("MSFT", dec!(110), TradeSource::Stream)).await;

        assert_eq!(fx.snapshot("MSFT").daily_change_percent, Some(dec!(10.00)));
    }

    #[tokio::test]
    async fn missing_or_zero_previous_price_leaves_change_unset() {
        let fx = Fixture::new();
        fx.track("AAPL", None);
        fx.track("MSFT", Some(Decimal::ZERO));
        let pipeline = fx.pipeline();

        pipeline.ingest(trade("AAPL", dec!(10), TradeSource::Stream)).await;
        pipeline.ingest(trade("MSFT", dec!(20), TradeSource::Stream)).await;

        assert_eq!(fx.snapshot("AAPL").current_price, Some(dec!(10)));
        assert_eq!(fx.snapshot("AAPL").daily_change_percent, None);
        assert_eq!(fx.snapshot("MSFT").current_price, Some(dec!(20)));
        assert_eq!(fx.snapshot("MSFT").daily_change_percent, None);
    }

    #[tokio::test]
    async fn invalid_record_is_rejected() {
        let fx = Fixture::new();
        fx.track("AAPL", Some(dec!(1)));
        let record = TradeRecord {
            price: None,
            ..TradeRecord::new("AAPL", dec!(1), 1, None)
        };

        let outcome = fx.pipeline().ingest_record(record, TradeSource::Stream).await;

        assert!(matches!(outcome, IngestOutcome::Rejected(RecordError::MissingPrice)));
        assert!(fx.ticks.is_empty());
    }

    #[tokio::test]
    async fn non_positive_price_never_becomes_the_change_base() {
        let fx = Fixture::new();
        fx.track("AAPL", Some(dec!(100)));
        let pipeline = fx.pipeline();

        for price in [Decimal::ZERO, dec!(-5)] {
            let record = TradeRecord::new("AAPL", price, 1, None);
            let outcome = pipeline.ingest_record(record, TradeSource::Webhook).await;
            assert!(matches!(outcome, IngestOutcome::Rejected(RecordError::NonPositivePrice(_))));
            assert_eq!(outcome.label(), "invalid");
        }
        assert!(fx.ticks.is_empty());

        pipeline.ingest(trade("AAPL", dec!(110), TradeSource::Webhook)).await;
        assert_eq!(fx.snapshot("AAPL").daily_change_percent, Some(dec!(10.00)));
    }

    #[tokio::test]
    async fn batch_continues_past_bad_records() {
        let fx = Fixture::new();
        fx.track("AAPL", Some(dec!(100)));
        let records = vec![
            TradeRecord::new("AAPL", dec!(101), 1, None),
            TradeRecord::default(),
            TradeRecord::new("ZZZZ", dec!(5), 1, None),
            TradeRecord::new("AAPL", dec!(102), 2, None),
        ];

        let summary = fx.pipeline().ingest_batch(records, TradeSource::Stream).await;

        assert_eq!(
            summary,
            BatchSummary {
                ingested: 2,
                rejected: 1,
                untracked: 1,
                failed: 0,
                notified: 0,
            }
        );
        assert_eq!(summary.total(), 4);
        assert_eq!(fx.ticks.len(), 2);
        assert_eq!(fx.snapshot("AAPL").current_price, Some(dec!(102)));
    }

    #[tokio::test]
    async fn both_channels_write_their_own_tick() {
        let fx = Fixture::new();
        fx.track("AAPL", Some(dec!(100)));
        let pipeline = fx.pipeline();

        pipeline.ingest(trade("AAPL", dec!(101), TradeSource::Stream)).await;
        pipeline.ingest(trade("AAPL", dec!(101), TradeSource::Webhook)).await;

        let sources: Vec<_> = fx.ticks.ticks().iter().map(|t| t.source).collect();
        assert_eq!(sources, vec![TradeSource::Stream, TradeSource::Webhook]);
    }

    #[tokio::test]
    async fn notifications_are_throttled_per_ticker() {
        let fx = Fixture::new();
        fx.track("AAPL", Some(dec!(100)));
        fx.track("MSFT", Some(dec!(100)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pipeline = fx
            .pipeline()
            .with_notifications(Arc::new(ChannelGateway(tx)), NotificationThrottle::default());

        let mut notified = Vec::new();
        for (ticker, price) in [("AAPL", dec!(101)), ("AAPL", dec!(102)), ("MSFT", dec!(99))] {
            if let IngestOutcome::Ingested(i) = pipeline.ingest(trade(ticker, price, TradeSource::Stream)).await {
                notified.push(i.notified);
            }
        }
        assert_eq!(notified, vec![true, false, true]);

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        let mut tickers = vec![first.ticker.to_string(), second.ticker.to_string()];
        tickers.sort();
        assert_eq!(tickers, vec!["AAPL", "MSFT"]);
        assert_eq!(first.price.max(second.price), dec!(101));
    }

    #[tokio::test]
    async fn notification_carries_previous_price() {
        let fx = Fixture::new();
        fx.track("AAPL", Some(dec!(170)));
        fx.track("MSFT", None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pipeline = fx
            .pipeline()
            .with_notifications(Arc::new(ChannelGateway(tx)), NotificationThrottle::default());

        pipeline.ingest(trade("AAPL", dec!(175.50), TradeSource::Stream)).await;
        let sent = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(sent.previous_price, Some(dec!(170)));
        assert_eq!(sent.change_percent, Some(dec!(3.2353)));
        assert_eq!(sent.data()["previousPrice"], "170");

        pipeline.ingest(trade("MSFT", dec!(400), TradeSource::Stream)).await;
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.previous_price, None);
        assert_eq!(first.change_percent, None);
    }

    #[tokio::test]
    async fn gateway_failure_does_not_fail_ingestion() {
        let fx = Fixture::new();
        fx.track("AAPL", Some(dec!(100)));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut gateway = MockGateway::new();
        gateway.expect_send_price_update().times(1).returning(move |n| {
            let _ = tx.send(n.ticker.to_string());
            Err(NotificationError::DeliveryFailed {
                message: "provider down".into(),
            })
        });
        let pipeline = fx
            .pipeline()
            .with_notifications(Arc::new(gateway), NotificationThrottle::default());

        let outcome = pipeline.ingest(trade("AAPL", dec!(105), TradeSource::Webhook)).await;

        assert!(outcome.is_ingested());
        let sent = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(sent.as_deref(), Some("AAPL"));
        assert_eq!(fx.snapshot("AAPL").current_price, Some(dec!(105)));
    }

    struct FailingTickStore;

    #[async_trait]
    impl PriceTickStore for FailingTickStore {
        async fn append(&self, _tick: PriceTick) -> Result<(), StoreError> {
            Err(StoreError::Unavailable {
                message: "disk full".into(),
            })
        }
    }

    #[tokio::test]
    async fn tick_append_failure_skips_snapshot_update() {
        let cache = Arc::new(InMemoryFundamentalsCache::new());
        cache.insert(FundamentalsSnapshot::with_price(
            Ticker::parse("AAPL").unwrap(),
            dec!(100),
            Utc::now(),
        ));
        let pipeline = TradeIngestionPipeline::new(Arc::new(FailingTickStore), cache.clone());

        let outcome = pipeline.ingest(trade("AAPL", dec!(120), TradeSource::Stream)).await;

        assert!(matches!(
            outcome,
            IngestOutcome::Failed {
                stage: StoreStage::TickAppend,
                ..
            }
        ));
        assert_eq!(outcome.label(), "store_error");
        let snapshot = cache.get(&Ticker::parse("AAPL").unwrap()).unwrap();
        assert_eq!(snapshot.current_price, Some(dec!(100)));
    }

    /// Cache that fails the test if two read-modify-writes on one ticker overlap.
    struct OverlapDetectingCache {
        inner: InMemoryFundamentalsCache,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl FundamentalsCache for OverlapDetectingCache {
        async fn find(&self, ticker: &Ticker) -> Result<Option<FundamentalsSnapshot>, StoreError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.inner.find(ticker).await
        }

        async fn apply_price_update(&self, update: &PriceUpdate) -> Result<(), StoreError> {
            let result = self.inner.apply_price_update(update).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_ticker_read_modify_write_is_serialized() {
        let cache = Arc::new(OverlapDetectingCache {
            inner: InMemoryFundamentalsCache::new(),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        cache.inner.insert(FundamentalsSnapshot::with_price(
            Ticker::parse("AAPL").unwrap(),
            dec!(100),
            Utc::now(),
        ));
        let ticks = Arc::new(InMemoryPriceTickStore::new());
        let pipeline = Arc::new(TradeIngestionPipeline::new(ticks.clone(), cache.clone()));

        let handles: Vec<_> = (0..40_i64)
            .map(|i| {
                let pipeline = Arc::clone(&pipeline);
                let source = if i % 2 == 0 { TradeSource::Stream } else { TradeSource::Webhook };
                tokio::spawn(async move {
                    pipeline.ingest(trade("AAPL", Decimal::from(100 + i), source)).await
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_ingested());
        }

        assert_eq!(cache.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(ticks.len(), 40);
    }
}
