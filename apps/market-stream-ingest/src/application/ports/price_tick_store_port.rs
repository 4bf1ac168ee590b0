//! Price Tick Store Port (Driven Port)
//!
//! Durable, append-only history of observed trades.

use async_trait::async_trait;

use crate::domain::trade::PriceTick;

/// Persistence failure shared by the tick store and fundamentals cache.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Backend could not be reached.
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Error details.
        message: String,
    },

    /// Write was refused.
    #[error("write rejected: {message}")]
    Rejected {
        /// Error details.
        message: String,
    },
}

/// Port for appending price ticks.
#[async_trait]
pub trait PriceTickStore: Send + Sync {
    /// Append one tick. Ticks are never updated after this call.
    async fn append(&self, tick: PriceTick) -> Result<(), StoreError>;
}
