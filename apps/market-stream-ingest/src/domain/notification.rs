//! Price Notifications
//!
//! The throttle that keeps high-frequency trades from turning into a
//! notification storm, and the payload handed to the notification gateway.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::time::Instant;

use super::ticker::Ticker;

/// Default minimum gap between notifications for one ticker.
pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_secs(60);

// =============================================================================
// Throttle
// =============================================================================

/// Per-ticker minimum-interval gate.
///
/// Check and record happen under one lock, so concurrent callers for the
/// same ticker see exactly one `true` per interval window. Entries are
/// never evicted; the map is bounded by ticker cardinality.
#[derive(Debug)]
pub struct NotificationThrottle {
    interval: Duration,
    last_allowed: Mutex<HashMap<Ticker, Instant>>,
}

impl Default for NotificationThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLE_INTERVAL)
    }
}

impl NotificationThrottle {
    /// Create a throttle with the given interval.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_allowed: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a notification for `ticker` may go out now. Records the
    /// decision when allowed.
    pub fn should_notify(&self, ticker: &Ticker) -> bool {
        self.should_notify_at(ticker, Instant::now())
    }

    /// [`should_notify`](Self::should_notify) against an explicit clock reading.
    pub fn should_notify_at(&self, ticker: &Ticker, now: Instant) -> bool {
        let mut last_allowed = self.last_allowed.lock();

        let allowed = last_allowed
            .get(ticker)
            .is_none_or(|last| now.saturating_duration_since(*last) >= self.interval);

        if allowed {
            last_allowed.insert(ticker.clone(), now);
        }
        allowed
    }

    /// Number of tickers with a recorded notification.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.last_allowed.lock().len()
    }
}

// =============================================================================
// Payload
// =============================================================================

/// Notification kinds understood by device clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    /// A tracked ticker traded at a new price.
    PriceUpdate,
}

impl NotificationKind {
    /// Wire label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PriceUpdate => "PRICE_UPDATE",
        }
    }
}

/// A price change worth telling watchers about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceUpdateNotification {
    /// Always [`NotificationKind::PriceUpdate`].
    pub kind: NotificationKind,
    /// Ticker.
    pub ticker: Ticker,
    /// New price.
    pub price: Decimal,
    /// Snapshot price this trade replaced, when there was one.
    pub previous_price: Option<Decimal>,
    /// Daily change, when known.
    pub change_percent: Option<Decimal>,
    /// Trade time.
    pub timestamp: DateTime<Utc>,
}

impl PriceUpdateNotification {
    /// Build a price-update notification.
    #[must_use]
    pub const fn new(
        ticker: Ticker,
        price: Decimal,
        previous_price: Option<Decimal>,
        change_percent: Option<Decimal>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: NotificationKind::PriceUpdate,
            ticker,
            price,
            previous_price,
            change_percent,
            timestamp,
        }
    }

    /// Push title, e.g. `AAPL 175.50 (+3.24%)`.
    #[must_use]
    pub fn title(&self) -> String {
        match self.change_percent {
            Some(pct) => {
                let sign = if pct.is_sign_negative() { "" } else { "+" };
                format!("{} {} ({sign}{}%)", self.ticker, self.price, pct.round_dp(2))
            }
            None => format!("{} {}", self.ticker, self.price),
        }
    }

    /// Flat string map for push transports that only carry string data.
    #[must_use]
    pub fn data(&self) -> BTreeMap<&'static str, String> {
        let mut data = BTreeMap::new();
        data.insert("type", self.kind.as_str().to_string());
        data.insert("ticker", self.ticker.to_string());
        data.insert("price", self.price.to_string());
        if let Some(previous) = self.previous_price {
            data.insert("previousPrice", previous.to_string());
        }
        if let Some(pct) = self.change_percent {
            data.insert("changePercent", pct.to_string());
        }
        data.insert("timestamp", self.timestamp.timestamp_millis().to_string());
        data
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use rust_decimal_macros::dec;

    fn t(s: &str) -> Ticker {
        Ticker::parse(s).unwrap()
    }

    #[test]
    fn second_call_within_interval_is_blocked() {
        let throttle = NotificationThrottle::new(Duration::from_secs(60));
        let now = Instant::now();

        assert!(throttle.should_notify_at(&t("AAPL"), now));
        assert!(!throttle.should_notify_at(&t("AAPL"), now + Duration::from_secs(59)));
    }

    #[test]
    fn allowed_again_after_interval() {
        let throttle = NotificationThrottle::new(Duration::from_secs(60));
        let now = Instant::now();

        assert!(throttle.should_notify_at(&t("AAPL"), now));
        assert!(!throttle.should_notify_at(&t("AAPL"), now + Duration::from_secs(30)));
        assert!(throttle.should_notify_at(&t("AAPL"), now + Duration::from_secs(60)));
        assert!(!throttle.should_notify_at(&t("AAPL"), now + Duration::from_secs(61)));
    }

    #[test]
    fn blocked_call_does_not_extend_window() {
        let throttle = NotificationThrottle::new(Duration::from_secs(60));
        let now = Instant::now();

        assert!(throttle.should_notify_at(&t("AAPL"), now));
        assert!(!throttle.should_notify_at(&t("AAPL"), now + Duration::from_secs(45)));
        assert!(throttle.should_notify_at(&t("AAPL"), now + Duration::from_secs(60)));
    }

    #[test]
    fn tickers_are_independent() {
        let throttle = NotificationThrottle::default();
        let now = Instant::now();

        assert!(throttle.should_notify_at(&t("AAPL"), now));
        assert!(throttle.should_notify_at(&t("MSFT"), now));
        assert_eq!(throttle.tracked(), 2);
    }

    #[test]
    fn concurrent_callers_see_one_allow() {
        let throttle = Arc::new(NotificationThrottle::default());
        let allowed = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let throttle = Arc::clone(&throttle);
                let allowed = Arc::clone(&allowed);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        if throttle.should_notify_at(&t("AAPL"), now) {
                            allowed.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(allowed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn payload_data_map() {
        let ts = DateTime::from_timestamp_millis(1_732_285_432_000).unwrap();
        let n = PriceUpdateNotification::new(
            t("AAPL"),
            dec!(175.50),
            Some(dec!(170.00)),
            Some(dec!(3.2353)),
            ts,
        );

        let data = n.data();
        assert_eq!(data["type"], "PRICE_UPDATE");
        assert_eq!(data["ticker"], "AAPL");
        assert_eq!(data["price"], "175.50");
        assert_eq!(data["previousPrice"], "170.00");
        assert_eq!(data["changePercent"], "3.2353");
        assert_eq!(data["timestamp"], "1732285432000");
        assert_eq!(n.title(), "AAPL 175.50 (+3.24%)");
    }

    #[test]
    fn payload_without_change() {
        let n = PriceUpdateNotification::new(t("MSFT"), dec!(410), None, None, Utc::now());
        assert!(!n.data().contains_key("changePercent"));
        assert!(!n.data().contains_key("previousPrice"));
        assert_eq!(n.title(), "MSFT 410");
    }
}
