//! Finnhub Integration
//!
//! Websocket trade stream client and its wire format. The webhook
//! channel reuses [`messages::trade_records`] for its `data` array.

pub mod codec;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;
pub mod stream;

pub use codec::{CodecError, FinnhubCodec};
pub use heartbeat::{HeartbeatConfig, HeartbeatError, LivenessMonitor};
pub use messages::{ControlMessage, InboundFrame};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectPolicy};
pub use stream::{
    ConnectionState, ResyncReport, StreamConfig, StreamConnection, StreamError, StreamEvent,
    StreamHandle, StreamStatus, SubscribeOutcome, UnsubscribeOutcome, forward_events,
};
