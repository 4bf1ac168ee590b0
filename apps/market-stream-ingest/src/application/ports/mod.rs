//! Application Ports (Driven)
//!
//! Interfaces the ingestion core uses to reach systems it does not own.
//! Infrastructure adapters implement these; tests substitute fakes.
//!
//! - `PriceTickStore`: append-only tick history
//! - `FundamentalsCache`: per-ticker price snapshot
//! - `NotificationGateway`: push delivery to devices
//! - `WatchlistSource`: startup view of every watched ticker
//! - `WireSubscriber`: subscribe/unsubscribe on the live stream

mod fundamentals_cache_port;
mod notification_gateway_port;
mod price_tick_store_port;
mod watchlist_source_port;
mod wire_subscriber_port;

pub use fundamentals_cache_port::FundamentalsCache;
pub use notification_gateway_port::{NotificationError, NotificationGateway};
pub use price_tick_store_port::{PriceTickStore, StoreError};
pub use watchlist_source_port::WatchlistSource;
pub use wire_subscriber_port::WireSubscriber;
