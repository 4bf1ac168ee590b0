//! Fundamentals Cache Port (Driven Port)
//!
//! Keyed snapshot store of last-known price state per ticker. The
//! presence of a snapshot is what makes a ticker "tracked".

use async_trait::async_trait;

use super::StoreError;
use crate::domain::ticker::Ticker;
use crate::domain::trade::{FundamentalsSnapshot, PriceUpdate};

/// Port for reading and updating price snapshots.
#[async_trait]
pub trait FundamentalsCache: Send + Sync {
    /// Find the snapshot for a ticker. Lookup is by normalized ticker, so
    /// callers never need to care about the case of the original input.
    async fn find(&self, ticker: &Ticker) -> Result<Option<FundamentalsSnapshot>, StoreError>;

    /// Overwrite the price fields of an existing snapshot. Other fields
    /// are left alone.
    async fn apply_price_update(&self, update: &PriceUpdate) -> Result<(), StoreError>;
}
