//! Subscription Registry
//!
//! Sole arbiter of "is this ticker currently wanted". Watchlist mutations
//! from unrelated requests land here; the registry reference-counts them
//! and tells the stream only about 0→1 and 1→0 edges.
//!
//! The count change and the resulting wire call happen under one lock,
//! so concurrent register/unregister calls can only reorder transient
//! wire traffic, never the converged count.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::application::ports::{StoreError, WatchlistSource, WireSubscriber};
use crate::domain::subscription::{RefCounts, SubscriptionStats, Transition};
use crate::domain::ticker::Ticker;

/// Reference-counted ticker registry shared by every watchlist caller.
pub struct SubscriptionRegistry {
    wire: Option<Arc<dyn WireSubscriber>>,
    ledger: Mutex<RefCounts>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("enabled", &self.is_enabled())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl SubscriptionRegistry {
    /// Create a registry that drives the given wire.
    #[must_use]
    pub fn new(wire: Arc<dyn WireSubscriber>) -> Self {
        Self {
            wire: Some(wire),
            ledger: Mutex::new(RefCounts::new()),
        }
    }

    /// Create a registry for when streaming is administratively off.
    /// Every mutation is a silent no-op.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            wire: None,
            ledger: Mutex::new(RefCounts::new()),
        }
    }

    /// Whether streaming is enabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.wire.is_some()
    }

    /// Add one reference to a ticker, subscribing on the wire on 0→1.
    ///
    /// Returns `None` when disabled or the symbol is blank.
    pub fn register(&self, raw: &str) -> Option<Transition> {
        let wire = self.wire.as_ref()?;
        let ticker = Ticker::parse(raw)?;

        let mut ledger = self.ledger.lock();
        let transition = ledger.increment(&ticker);
        if transition == Transition::Activated {
            tracing::info!(ticker = %ticker, "Ticker now wanted, subscribing");
            wire.subscribe(&ticker);
        } else {
            tracing::debug!(ticker = %ticker, ?transition, "Ticker reference added");
        }
        Some(transition)
    }

    /// Drop one reference to a ticker, unsubscribing on the wire on 1→0.
    ///
    /// Returns `None` when disabled or the symbol is blank.
    pub fn unregister(&self, raw: &str) -> Option<Transition> {
        let wire = self.wire.as_ref()?;
        let ticker = Ticker::parse(raw)?;

        let mut ledger = self.ledger.lock();
        let transition = ledger.decrement(&ticker);
        match transition {
            Transition::Deactivated => {
                tracing::info!(ticker = %ticker, "Ticker no longer wanted, unsubscribing");
                wire.unsubscribe(&ticker);
            }
            Transition::Untracked => {
                tracing::debug!(ticker = %ticker, "Unregister for untracked ticker ignored");
            }
            _ => {
                tracing::debug!(ticker = %ticker, ?transition, "Ticker reference dropped");
            }
        }
        Some(transition)
    }

    /// Move one reference from `from` to `to` (a watchlist entry changed
    /// its ticker). Both halves happen under one lock.
    ///
    /// Returns the `(from, to)` transitions, or `None` when disabled,
    /// either symbol is blank, or both normalize to the same ticker.
    pub fn rename(&self, from: &str, to: &str) -> Option<(Transition, Transition)> {
        let wire = self.wire.as_ref()?;
        let (from, to) = (Ticker::parse(from)?, Ticker::parse(to)?);
        if from == to {
            return None;
        }

        let mut ledger = self.ledger.lock();
        let released = ledger.decrement(&from);
        if released == Transition::Deactivated {
            wire.unsubscribe(&from);
        }
        let added = ledger.increment(&to);
        if added == Transition::Activated {
            wire.subscribe(&to);
        }
        tracing::info!(from = %from, to = %to, ?released, ?added, "Ticker reference renamed");
        Some((released, added))
    }

    /// Seed counts at startup: one reference per occurrence.
    ///
    /// Makes no assumption about what the wire already has; subscribes go
    /// out for every newly wanted ticker (and are dropped by the stream if
    /// it is not connected yet, to be reconciled on connect).
    ///
    /// Returns the number of distinct tickers now wanted.
    pub fn bootstrap<I, S>(&self, occurrences: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let Some(wire) = self.wire.as_ref() else {
            tracing::info!("Streaming disabled, skipping subscription bootstrap");
            return 0;
        };

        let mut ledger = self.ledger.lock();
        let mut skipped = 0_usize;
        for raw in occurrences {
            let Some(ticker) = Ticker::parse(raw.as_ref()) else {
                skipped += 1;
                continue;
            };
            if ledger.increment(&ticker) == Transition::Activated {
                wire.subscribe(&ticker);
            }
        }

        let stats = ledger.stats();
        tracing::info!(
            tickers = stats.ticker_count,
            references = stats.reference_count,
            skipped,
            "Subscription registry bootstrapped"
        );
        stats.ticker_count
    }

    /// Seed counts from every watchlist entry in `source`.
    ///
    /// When streaming is disabled the source is not read at all.
    ///
    /// # Errors
    ///
    /// Returns the source's `StoreError` if the watchlist cannot be read.
    pub async fn bootstrap_from(&self, source: &dyn WatchlistSource) -> Result<usize, StoreError> {
        if !self.is_enabled() {
            tracing::info!("Streaming disabled, skipping subscription bootstrap");
            return Ok(0);
        }
        let occurrences = source.ticker_occurrences().await?;
        Ok(self.bootstrap(occurrences))
    }

    /// Every ticker with a positive count, sorted.
    #[must_use]
    pub fn wanted_tickers(&self) -> Vec<Ticker> {
        self.ledger.lock().wanted()
    }

    /// Run `f` against the wanted set while holding the registry lock.
    ///
    /// Register and unregister calls block until `f` returns, so a caller
    /// reconciling wire state cannot race a concurrent 0→1 or 1→0 edge.
    pub fn with_wanted_tickers<R>(&self, f: impl FnOnce(&[Ticker]) -> R) -> R {
        let ledger = self.ledger.lock();
        f(&ledger.wanted())
    }

    /// Current count for a ticker.
    #[must_use]
    pub fn count(&self, raw: &str) -> usize {
        Ticker::parse(raw).map_or(0, |ticker| self.ledger.lock().count(&ticker))
    }

    /// Aggregate counts.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        self.ledger.lock().stats()
    }
}
