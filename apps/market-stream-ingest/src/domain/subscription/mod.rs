//! Subscription Reference Counting
//!
//! Pure bookkeeping for "how many watchlist entries want this ticker".
//! Many independent owners may watch the same symbol while the upstream
//! feed only needs one wire subscription, so each ticker carries a count
//! and only the 0→1 and 1→0 edges matter to the wire.
//!
//! The ledger has no locking of its own; the application-level registry
//! wraps it so the count check and the wire call happen atomically.

use std::collections::HashMap;

use crate::domain::ticker::Ticker;

// =============================================================================
// Transitions
// =============================================================================

/// Outcome of a single count change.
///
/// Serializes as `{"kind":"retained","count":2}`, with `count` only on
/// the variants that carry one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", content = "count", rename_all = "lowercase")]
pub enum Transition {
    /// Count went 0 → 1; the ticker must be subscribed upstream.
    Activated,
    /// Count went up but was already positive.
    Retained(usize),
    /// Count went down but is still positive.
    Released(usize),
    /// Count reached 0; the ticker must be unsubscribed upstream.
    Deactivated,
    /// Decrement of a ticker with no references. Count stays at 0.
    Untracked,
}

impl Transition {
    /// Whether this transition requires a wire message.
    #[must_use]
    pub const fn touches_wire(self) -> bool {
        matches!(self, Self::Activated | Self::Deactivated)
    }
}

// =============================================================================
// Ledger
// =============================================================================

/// Ticker → positive reference count. Zero counts are never stored.
#[derive(Debug, Default, Clone)]
pub struct RefCounts {
    counts: HashMap<Ticker, usize>,
}

impl RefCounts {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one reference.
    pub fn increment(&mut self, ticker: &Ticker) -> Transition {
        let count = self.counts.entry(ticker.clone()).or_insert(0);
        *count += 1;

        if *count == 1 {
            Transition::Activated
        } else {
            Transition::Retained(*count)
        }
    }

    /// Drop one reference. Never goes below zero.
    pub fn decrement(&mut self, ticker: &Ticker) -> Transition {
        let Some(count) = self.counts.get_mut(ticker) else {
            return Transition::Untracked;
        };

        *count = count.saturating_sub(1);
        if *count == 0 {
            self.counts.remove(ticker);
            Transition::Deactivated
        } else {
            Transition::Released(*count)
        }
    }

    /// Current count (0 when absent).
    #[must_use]
    pub fn count(&self, ticker: &Ticker) -> usize {
        self.counts.get(ticker).copied().unwrap_or(0)
    }

    /// Tickers with a positive count, sorted.
    #[must_use]
    pub fn wanted(&self) -> Vec<Ticker> {
        let mut tickers: Vec<_> = self.counts.keys().cloned().collect();
        tickers.sort();
        tickers
    }

    /// Aggregate statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            ticker_count: self.counts.len(),
            reference_count: self.counts.values().sum(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry-wide counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SubscriptionStats {
    /// Distinct tickers with at least one reference.
    pub ticker_count: usize,
    /// Sum of all references.
    pub reference_count: usize,
}

// =============================================================================
// Tests
// =============================================================================
