//! Wire Subscriber Port (Driven Port)
//!
//! The subscription registry's only view of the live stream.

use crate::domain::ticker::Ticker;

/// Fire-and-forget subscribe/unsubscribe on the streaming transport.
///
/// Calls are made while the registry holds its count lock, so
/// implementations must not block or call back into the registry.
/// Failures are the implementation's to log; nothing is returned.
pub trait WireSubscriber: Send + Sync {
    /// Start receiving trades for a ticker.
    fn subscribe(&self, ticker: &Ticker);

    /// Stop receiving trades for a ticker.
    fn unsubscribe(&self, ticker: &Ticker);
}
