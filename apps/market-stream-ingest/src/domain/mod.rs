//! Domain Layer - Core ingestion types and rules.
//!
//! Pure types with no I/O: ticker normalization, trade validation and
//! price arithmetic, subscription reference counts, and the per-ticker
//! notification throttle.

/// Notification throttle and payloads.
pub mod notification;

/// Subscription reference counting.
pub mod subscription;

/// Ticker symbol normalization.
pub mod ticker;

/// Trades, price ticks and fundamentals snapshots.
pub mod trade;
