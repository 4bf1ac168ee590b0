//! Watchlist Source Port (Driven Port)
//!
//! Read-only view of the watchlist store, used once at startup.

use async_trait::async_trait;

use super::StoreError;

/// Port for enumerating watched tickers.
#[async_trait]
pub trait WatchlistSource: Send + Sync {
    /// One raw ticker per watchlist entry across all owners. Duplicates
    /// are expected: each occurrence is one reference.
    async fn ticker_occurrences(&self) -> Result<Vec<String>, StoreError>;
}
