//! Application Services
//!
//! - `SubscriptionRegistry`: reference-counted ticker subscriptions
//! - `TradeIngestionPipeline`: the shared funnel for streamed and webhook trades

mod ingestion;
mod subscription;

pub use ingestion::{
    BatchSummary, IngestOutcome, IngestedTrade, StoreStage, TradeIngestionPipeline,
};
pub use subscription::SubscriptionRegistry;
