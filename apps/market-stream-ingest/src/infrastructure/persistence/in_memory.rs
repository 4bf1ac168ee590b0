//! In-memory stores for testing and local runs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::application::ports::{FundamentalsCache, PriceTickStore, StoreError, WatchlistSource};
use crate::domain::ticker::Ticker;
use crate::domain::trade::{FundamentalsSnapshot, PriceTick, PriceUpdate};

// =============================================================================
// Price Ticks
// =============================================================================

/// In-memory implementation of `PriceTickStore`.
///
/// Suitable for testing and development. Not for production use.
#[derive(Debug, Default)]
pub struct InMemoryPriceTickStore {
    ticks: RwLock<Vec<PriceTick>>,
}

impl InMemoryPriceTickStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored ticks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ticks.read().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ticks.read().is_empty()
    }

    /// All ticks in append order.
    #[must_use]
    pub fn ticks(&self) -> Vec<PriceTick> {
        self.ticks.read().clone()
    }

    /// Ticks for one ticker in append order.
    #[must_use]
    pub fn for_ticker(&self, ticker: &Ticker) -> Vec<PriceTick> {
        self.ticks
            .read()
            .iter()
            .filter(|t| &t.ticker == ticker)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PriceTickStore for InMemoryPriceTickStore {
    async fn append(&self, tick: PriceTick) -> Result<(), StoreError> {
        self.ticks.write().push(tick);
        Ok(())
    }
}

// =============================================================================
// Fundamentals
// =============================================================================

/// In-memory implementation of `FundamentalsCache`.
///
/// Keys are normalized tickers, which makes lookups case-insensitive.
#[derive(Debug, Default)]
pub struct InMemoryFundamentalsCache {
    snapshots: RwLock<HashMap<Ticker, FundamentalsSnapshot>>,
}

impl InMemoryFundamentalsCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a snapshot (test setup and seeding).
    pub fn insert(&self, snapshot: FundamentalsSnapshot) {
        self.snapshots
            .write()
            .insert(snapshot.ticker.clone(), snapshot);
    }

    /// Start tracking a ticker with no price. Existing snapshots are kept.
    pub fn track(&self, raw: &str) -> bool {
        let Some(ticker) = Ticker::parse(raw) else {
            return false;
        };
        self.snapshots
            .write()
            .entry(ticker.clone())
            .or_insert_with(|| FundamentalsSnapshot::tracked(ticker));
        true
    }

    /// Get a snapshot by ticker.
    #[must_use]
    pub fn get(&self, ticker: &Ticker) -> Option<FundamentalsSnapshot> {
        self.snapshots.read().get(ticker).cloned()
    }

    /// Number of tracked tickers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    /// Whether no ticker is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.read().is_empty()
    }

    /// Tickers whose price is older than `max_age` or was never set.
    #[must_use]
    pub fn stale(&self, now: DateTime<Utc>, max_age: Duration) -> Vec<Ticker> {
        let mut stale: Vec<_> = self
            .snapshots
            .read()
            .values()
            .filter(|s| s.is_stale(now, max_age))
            .map(|s| s.ticker.clone())
            .collect();
        stale.sort();
        stale
    }
}

#[async_trait]
impl FundamentalsCache for InMemoryFundamentalsCache {
    async fn find(&self, ticker: &Ticker) -> Result<Option<FundamentalsSnapshot>, StoreError> {
        Ok(self.get(ticker))
    }

    async fn apply_price_update(&self, update: &PriceUpdate) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.write();
        let snapshot = snapshots
            .get_mut(&update.ticker)
            .ok_or_else(|| StoreError::Rejected {
                message: format!("no snapshot for {}", update.ticker),
            })?;
        snapshot.apply(update);
        Ok(())
    }
}

// =============================================================================
// Watchlist
// =============================================================================

/// In-memory implementation of `WatchlistSource`.
#[derive(Debug, Default)]
pub struct InMemoryWatchlist {
    entries: RwLock<Vec<String>>,
}

impl InMemoryWatchlist {
    /// Create a watchlist from raw ticker entries.
    #[must_use]
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: RwLock::new(entries.into_iter().map(Into::into).collect()),
        }
    }

    /// Add an entry.
    pub fn push(&self, raw: impl Into<String>) {
        self.entries.write().push(raw.into());
    }
}

#[async_trait]
impl WatchlistSource for InMemoryWatchlist {
    async fn ticker_occurrences(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.read().clone())
    }
}
