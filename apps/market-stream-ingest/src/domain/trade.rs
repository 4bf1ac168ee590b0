//! Trade and Price Types
//!
//! Everything a trade turns into on its way through ingestion:
//!
//! - [`TradeRecord`]: the raw `{s, p, t, v}` object both delivery channels carry
//! - [`TradeEvent`]: a validated trade tagged with its [`TradeSource`]
//! - [`PriceTick`]: the immutable row appended to tick history
//! - [`FundamentalsSnapshot`] / [`PriceUpdate`]: the mutable per-ticker price cache

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::ticker::Ticker;

/// Decimal places kept on the daily change percentage.
pub const CHANGE_PERCENT_SCALE: u32 = 4;

/// Age after which a snapshot price counts as stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

// =============================================================================
// Trade Source
// =============================================================================

/// Channel a trade arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeSource {
    /// Persistent streaming connection.
    Stream,
    /// Provider-pushed webhook delivery.
    Webhook,
}

impl TradeSource {
    /// Lowercase label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Webhook => "webhook",
        }
    }
}

impl fmt::Display for TradeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Raw Trade Record
// =============================================================================

/// A trade as it appears on the wire, before validation.
///
/// Fields are kept as loose JSON values so one bad record never fails
/// the rest of its batch. Any JSON value deserializes: an element that
/// is not an object becomes an empty record, rejected for its missing
/// symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value")]
pub struct TradeRecord {
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: Option<Value>,
    /// Last price.
    #[serde(rename = "p")]
    pub price: Option<Value>,
    /// Trade time in epoch milliseconds.
    #[serde(rename = "t")]
    pub timestamp: Option<Value>,
    /// Volume.
    #[serde(rename = "v", skip_serializing_if = "Option::is_none")]
    pub volume: Option<Value>,
}

impl From<Value> for TradeRecord {
    fn from(value: Value) -> Self {
        let Value::Object(mut fields) = value else {
            return Self::default();
        };
        let mut take = |key: &str| fields.remove(key).filter(|v| !v.is_null());
        Self {
            symbol: take("s"),
            price: take("p"),
            timestamp: take("t"),
            volume: take("v"),
        }
    }
}

impl TradeRecord {
    /// Build a record from typed parts.
    #[must_use]
    pub fn new(symbol: &str, price: Decimal, timestamp_millis: i64, volume: Option<Decimal>) -> Self {
        Self {
            symbol: Some(Value::String(symbol.to_string())),
            price: Some(Value::String(price.to_string())),
            timestamp: Some(Value::from(timestamp_millis)),
            volume: volume.map(|v| Value::String(v.to_string())),
        }
    }

    /// Validate the record into a [`TradeEvent`].
    ///
    /// # Errors
    ///
    /// Returns `RecordError` when the symbol, price or timestamp is
    /// missing or cannot be parsed. An unparseable volume is dropped
    /// rather than rejected.
    pub fn into_event(self, source: TradeSource) -> Result<TradeEvent, RecordError> {
        let ticker = match self.symbol {
            Some(Value::String(raw)) => Ticker::parse(&raw).ok_or(RecordError::MissingSymbol)?,
            _ => return Err(RecordError::MissingSymbol),
        };

        let price_value = self.price.ok_or(RecordError::MissingPrice)?;
        let price = decimal_from_value(&price_value)
            .ok_or_else(|| RecordError::InvalidPrice(price_value.to_string()))?;
        if price <= Decimal::ZERO {
            return Err(RecordError::NonPositivePrice(price.to_string()));
        }

        let ts_value = self.timestamp.ok_or(RecordError::MissingTimestamp)?;
        let traded_at = millis_from_value(&ts_value)
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| RecordError::InvalidTimestamp(ts_value.to_string()))?;

        let volume = self.volume.as_ref().and_then(decimal_from_value);

        Ok(TradeEvent {
            ticker,
            price,
            volume,
            traded_at,
            source,
        })
    }
}

fn decimal_from_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            let text = n.to_string();
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .ok()
        }
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

fn millis_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Reasons a raw trade record is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// Symbol absent, blank or not a string.
    #[error("trade record has no symbol")]
    MissingSymbol,
    /// Price absent.
    #[error("trade record has no price")]
    MissingPrice,
    /// Price present but not a decimal.
    #[error("invalid trade price: {0}")]
    InvalidPrice(String),
    /// Price parsed but is zero or negative. Such a price would become the
    /// next change-percent base, so it is never stored.
    #[error("non-positive trade price: {0}")]
    NonPositivePrice(String),
    /// Timestamp absent.
    #[error("trade record has no timestamp")]
    MissingTimestamp,
    /// Timestamp present but not epoch milliseconds.
    #[error("invalid trade timestamp: {0}")]
    InvalidTimestamp(String),
}

// =============================================================================
// Trade Event
// =============================================================================

/// A validated trade. Lives only for the duration of one ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeEvent {
    /// Normalized ticker.
    pub ticker: Ticker,
    /// Trade price (always positive).
    pub price: Decimal,
    /// Trade volume, when reported.
    pub volume: Option<Decimal>,
    /// Exchange trade time.
    pub traded_at: DateTime<Utc>,
    /// Delivery channel.
    pub source: TradeSource,
}

impl TradeEvent {
    /// Trade time as epoch milliseconds.
    #[must_use]
    pub fn timestamp_millis(&self) -> i64 {
        self.traded_at.timestamp_millis()
    }
}

// =============================================================================
// Price Tick
// =============================================================================

/// One persisted trade observation. Write-once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTick {
    /// Row identifier.
    pub id: Uuid,
    /// Ticker.
    pub ticker: Ticker,
    /// Trade price.
    pub price: Decimal,
    /// Trade volume.
    pub volume: Option<Decimal>,
    /// Exchange trade time.
    pub traded_at: DateTime<Utc>,
    /// Time this process received the trade.
    pub received_at: DateTime<Utc>,
    /// Delivery channel.
    pub source: TradeSource,
}

impl PriceTick {
    /// Create a tick for a trade received at `received_at`.
    #[must_use]
    pub fn from_event(event: &TradeEvent, received_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ticker: event.ticker.clone(),
            price: event.price,
            volume: event.volume,
            traded_at: event.traded_at,
            received_at,
            source: event.source,
        }
    }
}

// =============================================================================
// Fundamentals Snapshot
// =============================================================================

/// Last-known price state for a tracked ticker.
///
/// Only the price fields are owned here; valuation fields live with the
/// valuation subsystem and are never touched by ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundamentalsSnapshot {
    /// Ticker.
    pub ticker: Ticker,
    /// Last trade price.
    pub current_price: Option<Decimal>,
    /// Change versus the previous price, in percent.
    pub daily_change_percent: Option<Decimal>,
    /// When the price fields were last written.
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl FundamentalsSnapshot {
    /// A tracked ticker with no price yet.
    #[must_use]
    pub const fn tracked(ticker: Ticker) -> Self {
        Self {
            ticker,
            current_price: None,
            daily_change_percent: None,
            last_updated_at: None,
        }
    }

    /// A tracked ticker with a known price.
    #[must_use]
    pub const fn with_price(ticker: Ticker, price: Decimal, at: DateTime<Utc>) -> Self {
        Self {
            ticker,
            current_price: Some(price),
            daily_change_percent: None,
            last_updated_at: Some(at),
        }
    }

    /// Whether the price is older than `max_age` (or was never set).
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        let Some(updated) = self.last_updated_at else {
            return true;
        };
        chrono::Duration::from_std(max_age).is_ok_and(|age| now - updated > age)
    }

    /// Overwrite the price fields from an update.
    pub fn apply(&mut self, update: &PriceUpdate) {
        self.current_price = Some(update.current_price);
        self.daily_change_percent = update.daily_change_percent;
        self.last_updated_at = Some(update.updated_at);
    }
}

/// The price fields written back to a snapshot after a trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceUpdate {
    /// Ticker.
    pub ticker: Ticker,
    /// Price before this trade.
    pub previous_price: Option<Decimal>,
    /// New price.
    pub current_price: Decimal,
    /// Derived change, unset when there was no usable previous price.
    pub daily_change_percent: Option<Decimal>,
    /// Write time.
    pub updated_at: DateTime<Utc>,
}

impl PriceUpdate {
    /// Derive the update a trade makes to a snapshot.
    #[must_use]
    pub fn derive(snapshot: &FundamentalsSnapshot, price: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            ticker: snapshot.ticker.clone(),
            previous_price: snapshot.current_price,
            current_price: price,
            daily_change_percent: change_percent(snapshot.current_price, price),
            updated_at: now,
        }
    }
}

/// `(new - old) / old * 100`, rounded to [`CHANGE_PERCENT_SCALE`] places.
///
/// `None` when `old` is absent, zero or negative, or the arithmetic overflows.
#[must_use]
pub fn change_percent(old: Option<Decimal>, new: Decimal) -> Option<Decimal> {
    let old = old.filter(|p| *p > Decimal::ZERO)?;
    new.checked_sub(old)?
        .checked_mul(Decimal::ONE_HUNDRED)?
        .checked_div(old)
        .map(|pct| {
            pct.round_dp_with_strategy(CHANGE_PERCENT_SCALE, RoundingStrategy::MidpointAwayFromZero)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use test_case::test_case;

    fn record(value: Value) -> TradeRecord {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn change_ten_percent_is_exact() {
        assert_eq!(change_percent(Some(dec!(100)), dec!(110)), Some(dec!(10.00)));
    }

    #[test]
    fn change_rounds_to_four_places() {
        assert_eq!(change_percent(Some(dec!(170.00)), dec!(175.50)), Some(dec!(3.2353)));
        assert_eq!(change_percent(Some(dec!(200)), dec!(150)), Some(dec!(-25)));
    }

    #[test_case(None ; "no previous price")]
    #[test_case(Some(Decimal::ZERO) ; "zero previous price")]
    #[test_case(Some(dec!(-1)) ; "negative previous price")]
    fn change_unset_without_usable_previous(old: Option<Decimal>) {
        assert_eq!(change_percent(old, dec!(42)), None);
    }

    #[test]
    fn record_parses_numeric_fields() {
        let event = record(json!({"s": "aapl", "p": 175.50, "t": 1_732_285_432_000_i64, "v": 1000, "c": ["1"]}))
            .into_event(TradeSource::Webhook)
            .unwrap();

        assert_eq!(event.ticker.as_str(), "AAPL");
        assert_eq!(event.price, dec!(175.5));
        assert_eq!(event.volume, Some(dec!(1000)));
        assert_eq!(event.timestamp_millis(), 1_732_285_432_000);
        assert_eq!(event.source, TradeSource::Webhook);
    }

    #[test]
    fn record_accepts_string_encoded_numbers() {
        let event = record(json!({"s": "MSFT", "p": "410.25", "t": "1732285432000"}))
            .into_event(TradeSource::Stream)
            .unwrap();
        assert_eq!(event.price, dec!(410.25));
        assert_eq!(event.volume, None);
    }

    #[test]
    fn record_drops_garbage_volume() {
        let event = record(json!({"s": "MSFT", "p": 1, "t": 1, "v": "lots"}))
            .into_event(TradeSource::Stream)
            .unwrap();
        assert_eq!(event.volume, None);
    }

    #[test_case(json!({"p": 1, "t": 1}), RecordError::MissingSymbol ; "no symbol")]
    #[test_case(json!({"s": " ", "p": 1, "t": 1}), RecordError::MissingSymbol ; "blank symbol")]
    #[test_case(json!({"s": 7, "p": 1, "t": 1}), RecordError::MissingSymbol ; "numeric symbol")]
    #[test_case(json!({"s": "A", "t": 1}), RecordError::MissingPrice ; "no price")]
    #[test_case(json!({"s": "A", "p": null, "t": 1}), RecordError::MissingPrice ; "null price")]
    #[test_case(json!({"s": "A", "p": "abc", "t": 1}), RecordError::InvalidPrice("\"abc\"".into()) ; "text price")]
    #[test_case(json!({"s": "A", "p": 0, "t": 1}), RecordError::NonPositivePrice("0".into()) ; "zero price")]
    #[test_case(json!({"s": "A", "p": "-2.5", "t": 1}), RecordError::NonPositivePrice("-2.5".into()) ; "negative price")]
    #[test_case(json!({"s": "A", "p": 1}), RecordError::MissingTimestamp ; "no timestamp")]
    #[test_case(json!({"s": "A", "p": 1, "t": "soon"}), RecordError::InvalidTimestamp("\"soon\"".into()) ; "text timestamp")]
    fn record_rejects(value: Value, expected: RecordError) {
        assert_eq!(record(value).into_event(TradeSource::Stream).unwrap_err(), expected);
    }

    #[test_case(json!(5) ; "number")]
    #[test_case(json!("AAPL") ; "string")]
    #[test_case(json!(null) ; "null")]
    #[test_case(json!([{"s": "AAPL"}]) ; "nested array")]
    fn non_object_element_is_rejected_alone(value: Value) {
        assert_eq!(
            record(value).into_event(TradeSource::Webhook).unwrap_err(),
            RecordError::MissingSymbol
        );
    }

    #[test]
    fn batch_with_non_object_element_still_parses() {
        let records: Vec<TradeRecord> =
            serde_json::from_value(json!([{"s": "A", "p": 1, "t": 1}, 5])).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].clone().into_event(TradeSource::Stream).is_ok());
        assert!(records[1].clone().into_event(TradeSource::Stream).is_err());
    }

    #[test]
    fn typed_record_round_trips_into_event() {
        let event = TradeRecord::new("nvda", dec!(120.5), 1_700_000_000_000, None)
            .into_event(TradeSource::Stream)
            .unwrap();
        assert_eq!(event.ticker.as_str(), "NVDA");
        assert_eq!(event.price, dec!(120.5));
    }

    #[test]
    fn update_overwrites_snapshot_price_fields() {
        let now = Utc::now();
        let ticker = Ticker::parse("AAPL").unwrap();
        let mut snapshot = FundamentalsSnapshot::with_price(ticker, dec!(100), now);
        snapshot.daily_change_percent = Some(dec!(1.5));

        let update = PriceUpdate::derive(&snapshot, dec!(110), now);
        snapshot.apply(&update);

        assert_eq!(update.previous_price, Some(dec!(100)));
        assert_eq!(snapshot.current_price, Some(dec!(110)));
        assert_eq!(snapshot.daily_change_percent, Some(dec!(10)));
        assert_eq!(snapshot.last_updated_at, Some(now));
    }

    #[test]
    fn update_clears_stale_change_when_no_previous_price() {
        let now = Utc::now();
        let mut snapshot = FundamentalsSnapshot::tracked(Ticker::parse("AAPL").unwrap());
        snapshot.daily_change_percent = Some(dec!(3));

        let update = PriceUpdate::derive(&snapshot, dec!(50), now);
        snapshot.apply(&update);

        assert_eq!(snapshot.current_price, Some(dec!(50)));
        assert_eq!(snapshot.daily_change_percent, None);
    }

    #[test]
    fn staleness() {
        let now = Utc::now();
        let ticker = Ticker::parse("AAPL").unwrap();
        let day = Duration::from_secs(86_400);

        assert!(FundamentalsSnapshot::tracked(ticker.clone()).is_stale(now, day));
        let fresh = FundamentalsSnapshot::with_price(ticker.clone(), dec!(1), now);
        assert!(!fresh.is_stale(now, day));
        let old = FundamentalsSnapshot::with_price(ticker, dec!(1), now - chrono::Duration::days(2));
        assert!(old.is_stale(now, day));
    }

    #[test]
    fn tick_carries_event_fields() {
        let event = TradeRecord::new("AAPL", dec!(1), 1_000, Some(dec!(5)))
            .into_event(TradeSource::Webhook)
            .unwrap();
        let received = Utc::now();
        let tick = PriceTick::from_event(&event, received);
        assert_eq!(tick.ticker, event.ticker);
        assert_eq!(tick.volume, Some(dec!(5)));
        assert_eq!(tick.received_at, received);
        assert_eq!(tick.source, TradeSource::Webhook);
    }
}
