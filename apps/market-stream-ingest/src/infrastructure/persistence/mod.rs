//! Persistence Adapters
//!
//! In-memory implementations of the storage ports. Used by tests and by
//! the binary when no external store is wired in.

mod in_memory;

pub use in_memory::{InMemoryFundamentalsCache, InMemoryPriceTickStore, InMemoryWatchlist};
