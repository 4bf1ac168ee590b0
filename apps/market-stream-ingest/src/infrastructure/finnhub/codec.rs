//! Finnhub JSON Codec

use super::messages::{ControlMessage, InboundEnvelope, InboundFrame};

/// Frame (de)serialization errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON was malformed or did not match the envelope.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Text-frame codec for the Finnhub websocket.
#[derive(Debug, Clone, Copy, Default)]
pub struct FinnhubCodec;

impl FinnhubCodec {
    /// Create a codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Json` for malformed frames, frames without a
    /// `type` field, and `trade` frames whose `data` is not an array.
    pub fn decode(&self, text: &str) -> Result<InboundFrame, CodecError> {
        let envelope: InboundEnvelope = serde_json::from_str(text)?;
        Ok(envelope.classify()?)
    }

    /// Encode a control frame.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Json` if serialization fails.
    pub fn encode(&self, message: &ControlMessage) -> Result<String, CodecError> {
        Ok(serde_json::to_string(message)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trade::TradeSource;
    use rust_decimal_macros::dec;

    #[test]
    fn decodes_trade_batch() {
        let codec = FinnhubCodec::new();
        let frame = codec
            .decode(
                r#"{"type":"trade","data":[
                    {"s":"AAPL","p":175.5,"t":1732285432000,"v":100},
                    {"s":"MSFT","p":"410.25","t":1732285433000}
                ]}"#,
            )
            .unwrap();

        let InboundFrame::Trades(records) = frame else {
            panic!("expected trades, got {frame:?}");
        };
        assert_eq!(records.len(), 2);

        let first = records[0].clone().into_event(TradeSource::Stream).unwrap();
        assert_eq!(first.ticker.as_str(), "AAPL");
        assert_eq!(first.price, dec!(175.5));
        assert_eq!(first.volume, Some(dec!(100)));

        let second = records[1].clone().into_event(TradeSource::Stream).unwrap();
        assert_eq!(second.price, dec!(410.25));
        assert_eq!(second.volume, None);
    }

    #[test]
    fn decodes_ping_and_error() {
        let codec = FinnhubCodec::new();
        assert_eq!(codec.decode(r#"{"type":"ping"}"#).unwrap(), InboundFrame::Ping);
        assert_eq!(
            codec.decode(r#"{"type":"error","msg":"Invalid symbol"}"#).unwrap(),
            InboundFrame::Error("Invalid symbol".into())
        );
    }

    #[test]
    fn rejects_malformed_frames() {
        let codec = FinnhubCodec::new();
        assert!(codec.decode("not json").is_err());
        assert!(codec.decode(r#"{"data":[]}"#).is_err());
        assert!(codec.decode(r#"{"type":"trade","data":"oops"}"#).is_err());
    }

    #[test]
    fn bad_record_does_not_fail_frame() {
        let codec = FinnhubCodec::new();
        let frame = codec
            .decode(r#"{"type":"trade","data":[{"s":"AAPL"},{"p":1}]}"#)
            .unwrap();
        assert!(matches!(frame, InboundFrame::Trades(ref r) if r.len() == 2));
    }

    #[test]
    fn non_object_element_does_not_fail_frame() {
        let codec = FinnhubCodec::new();
        let frame = codec
            .decode(r#"{"type":"trade","data":[{"s":"AAPL","p":1,"t":1},5]}"#)
            .unwrap();

        let InboundFrame::Trades(records) = frame else {
            panic!("expected trades, got {frame:?}");
        };
        assert_eq!(records.len(), 2);
        assert!(records[0].clone().into_event(TradeSource::Stream).is_ok());
        assert!(records[1].clone().into_event(TradeSource::Stream).is_err());
    }
}
