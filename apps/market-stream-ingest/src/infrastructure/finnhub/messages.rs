//! Finnhub Wire Messages
//!
//! Outbound control frames and the inbound envelope shared by the
//! websocket stream and the webhook body.
//!
//! ```text
//! -> {"type":"subscribe","symbol":"AAPL"}
//! -> {"type":"unsubscribe","symbol":"AAPL"}
//! <- {"type":"trade","data":[{"s":"AAPL","p":175.5,"t":1732285432000,"v":100}]}
//! <- {"type":"ping"}
//! <- {"type":"error","msg":"Invalid symbol"}
//! ```
//!
//! # References
//!
//! - [Finnhub WebSocket trades](https://finnhub.io/docs/api/websocket-trades)

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::ticker::Ticker;
use crate::domain::trade::TradeRecord;

// =============================================================================
// Outbound
// =============================================================================

/// Client-to-server control frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Start receiving trades for a symbol.
    Subscribe {
        /// Upstream symbol.
        symbol: Ticker,
    },
    /// Stop receiving trades for a symbol.
    Unsubscribe {
        /// Upstream symbol.
        symbol: Ticker,
    },
}

impl ControlMessage {
    /// Subscribe frame.
    #[must_use]
    pub const fn subscribe(symbol: Ticker) -> Self {
        Self::Subscribe { symbol }
    }

    /// Unsubscribe frame.
    #[must_use]
    pub const fn unsubscribe(symbol: Ticker) -> Self {
        Self::Unsubscribe { symbol }
    }

    /// Symbol the frame refers to.
    #[must_use]
    pub const fn symbol(&self) -> &Ticker {
        match self {
            Self::Subscribe { symbol } | Self::Unsubscribe { symbol } => symbol,
        }
    }

    /// `subscribe` or `unsubscribe`.
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// Raw server frame before classification.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    /// Frame type (`trade`, `ping`, `error`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Payload; only read for `trade` frames.
    #[serde(default)]
    pub data: Option<Value>,
    /// Error text for `error` frames.
    #[serde(default)]
    pub msg: Option<String>,
}

/// Classified server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Keep-alive from the server.
    Ping,
    /// One batch of trade records, possibly empty.
    Trades(Vec<TradeRecord>),
    /// Server-reported error (bad symbol, rate limit, ...).
    Error(String),
    /// Any other frame type, ignored.
    Other(String),
}

impl InboundEnvelope {
    /// Classify by `type` first; `data` must be an array only on `trade`
    /// frames.
    ///
    /// # Errors
    ///
    /// Fails when a `trade` frame carries non-array `data`.
    pub fn classify(self) -> Result<InboundFrame, serde_json::Error> {
        Ok(match self.kind.as_str() {
            "ping" => InboundFrame::Ping,
            "trade" => InboundFrame::Trades(trade_records(self.data)?),
            "error" => InboundFrame::Error(self.msg.unwrap_or_default()),
            _ => InboundFrame::Other(self.kind),
        })
    }
}

/// Parse a `data` array element by element. Absent or `null` is an empty
/// batch.
///
/// # Errors
///
/// Fails only when `data` is present and not an array.
pub fn trade_records(data: Option<Value>) -> Result<Vec<TradeRecord>, serde_json::Error> {
    match data {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value),
    }
}
